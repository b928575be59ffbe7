use std::path::Path;

use image::DynamicImage;
use ndarray::prelude::*;
use nshare::AsNdarray3;
use rayon::prelude::*;

use crate::errors::{Result, YoloError};

/// Extensions accepted when walking input directories.
pub const SUPPORTED_EXTENSIONS: [&str; 8] =
    ["jpg", "jpeg", "png", "webp", "bmp", "gif", "tiff", "avif"];

/// Reads an image file into a `(3, height, width)` RGB tensor scaled to `[0, 1]`.
pub fn image_preprocess<P: AsRef<Path>>(path: P) -> Result<Array3<f32>> {
    let path = path.as_ref();
    let img = image::open(path).map_err(|e| YoloError::ImageProcessing {
        path: path.display().to_string(),
        operation: "image decoding".to_string(),
        source: Box::new(e),
    })?;

    Ok(preprocess_image(&img))
}

/// Converts a decoded image into a `(3, height, width)` tensor scaled to `[0, 1]`.
pub fn preprocess_image(img: &DynamicImage) -> Array3<f32> {
    let rgb = img.to_rgb8();
    rgb.as_ndarray3().mapv(|v| f32::from(v) / 255.0)
}

/// Decodes several images in parallel. The result keeps the order of `paths`.
pub fn preprocess_images<P: AsRef<Path> + Sync>(paths: &[P]) -> Result<Vec<Array3<f32>>> {
    paths.par_iter().map(image_preprocess).collect()
}

/// Checks that a tensor is a non-empty three channel `(C, H, W)` image.
pub fn validate_image_tensor(tensor: ArrayView3<f32>) -> Result<()> {
    let (channels, height, width) = tensor.dim();
    if channels != 3 {
        return Err(YoloError::validation(
            "image",
            format!("must have 3 channels, got {}", channels),
        ));
    }
    if height == 0 || width == 0 {
        return Err(YoloError::validation(
            "image",
            format!("must not be empty, got {}x{}", width, height),
        ));
    }
    Ok(())
}

pub fn is_supported_image_format(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

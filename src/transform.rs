//! Letterbox resizing and batching of image tensors.
//!
//! Every image is scaled so that its long side matches `img_size`, padded with a
//! constant gray border, and the whole batch is padded to a common shape whose sides
//! are multiples of the network stride. The per-image [`ImageMeta`] is what maps boxes
//! between network-input and original-image coordinates.

use image::{imageops, imageops::FilterType, ImageBuffer, Rgb};
use ndarray::prelude::*;
use nshare::AsNdarray3;

use crate::errors::{Result, YoloError};
use crate::preprocess::validate_image_tensor;
use crate::target::Target;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageMeta {
    /// `(height, width)` of the image before letterboxing.
    pub original_size: (usize, usize),
    /// Scale factor applied to both sides.
    pub ratio: f32,
    /// `(left, top)` padding in network-input pixels.
    pub pad: (f32, f32),
}

#[derive(Debug, Clone)]
pub struct LetterboxTransform {
    pub img_size: usize,
    pub stride: usize,
    /// Shrink padding to the minimum rectangle allowed by `stride`.
    pub auto: bool,
    pub fill: f32,
}

impl Default for LetterboxTransform {
    fn default() -> Self {
        Self::new(640, 32)
    }
}

impl LetterboxTransform {
    pub const fn new(img_size: usize, stride: usize) -> Self {
        Self {
            img_size,
            stride,
            auto: true,
            fill: 114.0 / 255.0,
        }
    }

    pub const fn with_auto(mut self, auto: bool) -> Self {
        self.auto = auto;
        self
    }

    /// Computes the resized size `(h, w)` and padding metadata for one image.
    pub fn plan(&self, height: usize, width: usize) -> ((usize, usize), ImageMeta) {
        let size = self.img_size as f32;
        let ratio = (size / height as f32).min(size / width as f32);
        let new_w = ((width as f32 * ratio).round() as usize).max(1);
        let new_h = ((height as f32 * ratio).round() as usize).max(1);

        let mut dw = self.img_size.saturating_sub(new_w);
        let mut dh = self.img_size.saturating_sub(new_h);
        if self.auto {
            dw %= self.stride;
            dh %= self.stride;
        }
        let (dw, dh) = (dw as f32 / 2.0, dh as f32 / 2.0);
        let (left, right) = ((dw - 0.1).round(), (dw + 0.1).round());
        let (top, bottom) = ((dh - 0.1).round(), (dh + 0.1).round());

        let out_h = new_h + top as usize + bottom as usize;
        let out_w = new_w + left as usize + right as usize;
        let meta = ImageMeta {
            original_size: (height, width),
            ratio,
            pad: (left, top),
        };
        ((out_h, out_w), meta)
    }

    /// Letterboxes a single `(3, H, W)` tensor.
    pub fn apply(&self, image: ArrayView3<f32>) -> Result<(Array3<f32>, ImageMeta)> {
        validate_image_tensor(image)?;
        let (_, height, width) = image.dim();
        let ((out_h, out_w), meta) = self.plan(height, width);
        let new_w = ((width as f32 * meta.ratio).round() as usize).max(1);
        let new_h = ((height as f32 * meta.ratio).round() as usize).max(1);

        let mut canvas = Array3::<f32>::from_elem((3, out_h, out_w), self.fill);
        let (left, top) = (meta.pad.0 as usize, meta.pad.1 as usize);
        let resized = resize_chw(image, new_w as u32, new_h as u32);
        canvas
            .slice_mut(s![.., top..top + new_h, left..left + new_w])
            .assign(&resized);

        Ok((canvas, meta))
    }

    /// Letterboxes all images and stacks them into one `(N, 3, H, W)` batch.
    pub fn batch(&self, images: &[Array3<f32>]) -> Result<(Array4<f32>, Vec<ImageMeta>)> {
        if images.is_empty() {
            return Err(YoloError::validation("images", "must not be empty"));
        }

        let letterboxed = images
            .iter()
            .map(|img| self.apply(img.view()))
            .collect::<Result<Vec<_>>>()?;

        let round_up = |v: usize| v.div_ceil(self.stride) * self.stride;
        let max_h = round_up(letterboxed.iter().map(|(t, _)| t.dim().1).max().unwrap_or(0));
        let max_w = round_up(letterboxed.iter().map(|(t, _)| t.dim().2).max().unwrap_or(0));

        let mut batch = Array4::<f32>::from_elem((images.len(), 3, max_h, max_w), self.fill);
        let mut metas = Vec::with_capacity(images.len());
        for (i, (tensor, meta)) in letterboxed.into_iter().enumerate() {
            let (_, h, w) = tensor.dim();
            batch.slice_mut(s![i, .., ..h, ..w]).assign(&tensor);
            metas.push(meta);
        }

        Ok((batch, metas))
    }
}

fn resize_chw(image: ArrayView3<f32>, width: u32, height: u32) -> Array3<f32> {
    let (_, h, w) = image.dim();
    if h == height as usize && w == width as usize {
        return image.to_owned();
    }
    let buffer: ImageBuffer<Rgb<f32>, Vec<f32>> =
        ImageBuffer::from_fn(w as u32, h as u32, |x, y| {
            let (x, y) = (x as usize, y as usize);
            Rgb([image[[0, y, x]], image[[1, y, x]], image[[2, y, x]]])
        });
    let resized = imageops::resize(&buffer, width, height, FilterType::Triangle);
    resized.as_ndarray3().to_owned()
}

/// Maps `xyxy` boxes from network-input pixels back onto the original image, clipped
/// to its bounds.
pub fn scale_boxes_to_original(boxes: &mut Array2<f32>, meta: &ImageMeta) {
    let (height, width) = meta.original_size;
    let (pad_x, pad_y) = meta.pad;
    for mut row in boxes.rows_mut() {
        row[0] = ((row[0] - pad_x) / meta.ratio).clamp(0.0, width as f32);
        row[1] = ((row[1] - pad_y) / meta.ratio).clamp(0.0, height as f32);
        row[2] = ((row[2] - pad_x) / meta.ratio).clamp(0.0, width as f32);
        row[3] = ((row[3] - pad_y) / meta.ratio).clamp(0.0, height as f32);
    }
}

/// Re-normalises target boxes (`cx, cy, w, h` relative to the original image) so that
/// they are relative to the network input of shape `input_hw`.
pub fn targets_to_input(target: &Target, meta: &ImageMeta, input_hw: (usize, usize)) -> Array2<f32> {
    let (h0, w0) = (meta.original_size.0 as f32, meta.original_size.1 as f32);
    let (in_h, in_w) = (input_hw.0 as f32, input_hw.1 as f32);
    let (pad_x, pad_y) = meta.pad;
    let mut boxes = target.boxes.to_owned();
    for mut row in boxes.rows_mut() {
        row[0] = (row[0] * w0 * meta.ratio + pad_x) / in_w;
        row[1] = (row[1] * h0 * meta.ratio + pad_y) / in_h;
        row[2] = row[2] * w0 * meta.ratio / in_w;
        row[3] = row[3] * h0 * meta.ratio / in_h;
    }
    boxes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_landscape_auto() {
        // 1280x720 -> 640x360, padded to the next multiple of 32 (384)
        let transform = LetterboxTransform::new(640, 32);
        let ((h, w), meta) = transform.plan(720, 1280);
        assert_eq!((h, w), (384, 640));
        assert_eq!(meta.ratio, 0.5);
        assert_eq!(meta.pad, (0.0, 12.0));
    }

    #[test]
    fn test_plan_square_without_auto() {
        let transform = LetterboxTransform::new(640, 32).with_auto(false);
        let ((h, w), meta) = transform.plan(720, 1280);
        assert_eq!((h, w), (640, 640));
        assert_eq!(meta.pad, (0.0, 140.0));
    }

    #[test]
    fn test_apply_fills_border() -> Result<()> {
        let transform = LetterboxTransform::new(64, 32);
        let image = Array3::<f32>::ones((3, 32, 64));
        let (out, meta) = transform.apply(image.view())?;
        assert_eq!(out.dim(), (3, 32, 64));
        assert_eq!(meta.ratio, 1.0);
        assert!(out.iter().all(|v| *v == 1.0));

        let tall = Array3::<f32>::ones((3, 64, 16));
        let (out, meta) = transform.apply(tall.view())?;
        assert_eq!(out.dim(), (3, 64, 32));
        assert_eq!(meta.pad, (8.0, 0.0));
        assert!((out[[0, 0, 0]] - 114.0 / 255.0).abs() < 1e-6);
        assert_eq!(out[[0, 10, 10]], 1.0);
        Ok(())
    }

    #[test]
    fn test_batch_pads_to_common_shape() -> Result<()> {
        let transform = LetterboxTransform::new(64, 32);
        let images = vec![Array3::<f32>::zeros((3, 32, 64)), Array3::<f32>::zeros((3, 64, 64))];
        let (batch, metas) = transform.batch(&images)?;
        assert_eq!(batch.dim(), (2, 3, 64, 64));
        assert_eq!(metas.len(), 2);
        assert_eq!(metas[0].original_size, (32, 64));
        assert_eq!(metas[1].original_size, (64, 64));
        Ok(())
    }

    #[test]
    fn test_batch_rejects_empty_and_bad_channels() {
        let transform = LetterboxTransform::default();
        assert!(transform.batch(&[]).is_err());
        assert!(transform.batch(&[Array3::<f32>::zeros((4, 8, 8))]).is_err());
    }

    #[test]
    fn test_scale_boxes_round_trip() {
        let meta = ImageMeta {
            original_size: (720, 1280),
            ratio: 0.5,
            pad: (0.0, 12.0),
        };
        let mut boxes = array![[100.0f32, 62.0, 300.0, 212.0], [-10.0, 0.0, 700.0, 400.0]];
        scale_boxes_to_original(&mut boxes, &meta);
        assert_eq!(boxes.row(0).to_vec(), vec![200.0, 100.0, 600.0, 400.0]);
        // clipped to the original bounds
        assert_eq!(boxes.row(1).to_vec(), vec![0.0, 0.0, 1280.0, 720.0]);
    }

    #[test]
    fn test_targets_to_input() -> Result<()> {
        let meta = ImageMeta {
            original_size: (720, 1280),
            ratio: 0.5,
            pad: (0.0, 12.0),
        };
        let target = Target::new(array![[0.5f32, 0.5, 0.25, 0.5]], array![0])?;
        let boxes = targets_to_input(&target, &meta, (384, 640));
        assert!((boxes[[0, 0]] - 0.5).abs() < 1e-6);
        assert!((boxes[[0, 1]] - 0.5).abs() < 1e-6);
        assert!((boxes[[0, 2]] - 0.25).abs() < 1e-6);
        assert!((boxes[[0, 3]] - 180.0 / 384.0).abs() < 1e-6);
        Ok(())
    }
}

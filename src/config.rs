use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use clap::Parser;
use image::ImageFormat;

use crate::errors::{Result, YoloError};
use crate::model::YoloOptions;
use crate::onnx::SessionOptions;
use crate::postprocess::PostProcess;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Exported YOLOv5 ONNX graph.
    #[arg(short, long)]
    pub checkpoint: PathBuf,

    /// Image file or directory of images.
    #[arg(short, long)]
    pub input_source: PathBuf,

    /// Text file with one class name per line; COCO names when omitted.
    #[arg(short, long)]
    pub labelmap: Option<PathBuf>,

    #[arg(long)]
    pub gpu: bool,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    /// Write images with the detections drawn on them.
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    #[arg(short, long, default_value = "png", value_parser = check_format)]
    pub format: String,

    /// TrueType/OpenType font for the label text on overlays; bars only when omitted.
    #[arg(long)]
    pub font: Option<PathBuf>,

    #[arg(long, default_value_t = crate::visualize::DEFAULT_FONT_SIZE)]
    pub font_size: f32,

    #[arg(long, default_value_t = 640)]
    pub img_size: usize,

    #[arg(long, default_value_t = 0.25)]
    pub score_thresh: f32,

    #[arg(long, default_value_t = 0.45)]
    pub nms_thresh: f32,

    #[arg(long, default_value_t = 300)]
    pub detections_per_img: usize,

    #[arg(
        short, long, default_value_t = thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    )]
    pub num_threads: usize,
}

impl Config {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            gpu: self.gpu,
            device_id: self.device_id,
            intra_threads: Some(self.num_threads),
            warmup_size: Some(self.img_size),
        }
    }

    pub fn yolo_options(&self) -> YoloOptions {
        YoloOptions {
            img_size: self.img_size,
            postprocess: PostProcess {
                score_thresh: self.score_thresh,
                nms_thresh: self.nms_thresh,
                detections_per_img: self.detections_per_img,
            },
            session: self.session_options(),
            ..YoloOptions::pretrained()
        }
    }

    /// Where the overlay for `path` is written under `output_dir`.
    ///
    /// Directory inputs keep their layout below `input_source`; a single file lands
    /// directly in `output_dir`. Missing parent directories are created.
    pub fn output_path(&self, path: &Path, output_dir: &Path) -> Result<PathBuf> {
        let relative = match path.strip_prefix(&self.input_source) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
            _ => PathBuf::from(
                path.file_name()
                    .ok_or_else(|| YoloError::validation("path", "input path has no file name"))?,
            ),
        };
        let output_path = output_dir.join(relative).with_extension(&self.format);

        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent).map_err(|e| YoloError::FileSystem {
                path: parent.to_path_buf(),
                operation: "output directory creation".to_string(),
                source: e,
            })?;
        }
        Ok(output_path)
    }
}

fn check_format(s: &str) -> std::result::Result<String, String> {
    let supported: Vec<_> = ImageFormat::all()
        .filter(|f| f.writing_enabled())
        .flat_map(|f| f.extensions_str())
        .map(|s| format!("`{}`", s))
        .collect();
    let supported_message = format!("Supported formats: {}", supported.join(", "));

    let format = ImageFormat::from_extension(s)
        .ok_or(format!("{} is not supported. {}", s, supported_message))?;
    if !format.writing_enabled() {
        return Err(format!("{} is not supported. {}", s, supported_message));
    }

    Ok(s.to_string())
}

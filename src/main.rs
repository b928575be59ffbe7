use std::{path::Path, time::Instant};

use anyhow::{ensure, Context, Result};
use clap::Parser;
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use rayon::{prelude::*, ThreadPoolBuilder};
use tracing::info;
use walkdir::WalkDir;

use yolort_rs::preprocess::{is_supported_image_format, preprocess_image};
use yolort_rs::visualize::{load_font, Overlay};
use yolort_rs::{Config, LabelMap, YoloV5};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let config = Config::parse();

    ensure!(config.checkpoint.exists(), "Checkpoint does not exist");
    ensure!(config.input_source.exists(), "Input source does not exist");

    ThreadPoolBuilder::new()
        .num_threads(config.num_threads)
        .build_global()?;

    let labels = match &config.labelmap {
        Some(path) => LabelMap::load(path)?,
        None => LabelMap::default(),
    };
    info!(
        device = if config.gpu { "gpu" } else { "cpu" },
        classes = labels.len(),
        "loading checkpoint"
    );
    let model = YoloV5::from_checkpoint(&config.checkpoint, &config.yolo_options())?;
    let font = config.font.as_ref().map(load_font).transpose()?;
    let overlay = Overlay::new(font).with_font_size(config.font_size);
    let run = Run {
        model: &model,
        labels: &labels,
        overlay: &overlay,
        config: &config,
    };

    if config.input_source.is_file() {
        return run.detect(&config.input_source);
    }

    let image_paths = WalkDir::new(&config.input_source)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && is_supported_image_format(e.path()))
        .map(|e| e.into_path())
        .collect::<Vec<_>>();
    info!(images = image_paths.len(), "collected input images");

    let progress_bar = ProgressBar::new(image_paths.len() as u64);
    progress_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec} {eta})",
        )?
        .progress_chars("#>-"),
    );

    image_paths
        .par_iter()
        .progress_with(progress_bar.clone())
        .try_for_each(|path| run.detect(path))?;

    progress_bar.finish();

    Ok(())
}

struct Run<'a> {
    model: &'a YoloV5,
    labels: &'a LabelMap,
    overlay: &'a Overlay,
    config: &'a Config,
}

impl Run<'_> {
    fn detect(&self, path: &Path) -> Result<()> {
        let start = Instant::now();
        let image = image::open(path)
            .with_context(|| format!("Failed to open image: {}", path.display()))?;
        let tensor = preprocess_image(&image);
        let preprocess_ms = start.elapsed().as_secs_f64() * 1000.0;

        let start = Instant::now();
        let result = self
            .model
            .predict(&[tensor])?
            .into_iter()
            .next()
            .context("Model returned no result")?;
        let inference_ms = start.elapsed().as_secs_f64() * 1000.0;

        info!(
            image = %path.display(),
            preprocess_ms,
            inference_ms,
            detections = result.len(),
            "processed"
        );
        for ((bbox, &label), &score) in result
            .boxes
            .rows()
            .into_iter()
            .zip(&result.labels)
            .zip(&result.scores)
        {
            info!(
                label = %self.labels.name(label),
                score,
                bbox = ?bbox.to_vec(),
                "detection"
            );
        }

        if let Some(output_dir) = &self.config.output_dir {
            let canvas = self.overlay.draw(&image.into_rgb8(), &result, self.labels);
            let output_path = self.config.output_path(path, output_dir)?;
            canvas
                .save(&output_path)
                .with_context(|| format!("Failed to save image: {}", output_path.display()))?;
        }

        Ok(())
    }
}

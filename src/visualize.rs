use std::fs;
use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use tracing::debug;

use crate::errors::{Result, YoloError};
use crate::labels::LabelMap;
use crate::postprocess::DetectionResult;

pub const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
pub const DEFAULT_FONT_SIZE: f32 = 18.0;

const LABEL_PADDING: u32 = 2;

/// Reads a TrueType or OpenType font for label text.
pub fn load_font<P: AsRef<Path>>(path: P) -> Result<FontArc> {
    let path = path.as_ref();
    let data = fs::read(path).map_err(|e| YoloError::FileSystem {
        path: path.to_path_buf(),
        operation: "font read".to_string(),
        source: e,
    })?;
    FontArc::try_from_vec(data).map_err(|e| YoloError::Configuration {
        message: format!("{} is not a usable font: {}", path.display(), e),
    })
}

/// Draws detections as 2px outlines, each with a filled `"<name> <score>"` bar.
///
/// The bar sits above the box, or just inside its top edge when there is no room
/// above. Without a font only the bar is drawn, sized from the character count.
#[derive(Debug, Clone)]
pub struct Overlay {
    font: Option<FontArc>,
    scale: PxScale,
}

impl Default for Overlay {
    fn default() -> Self {
        Self {
            font: None,
            scale: PxScale::from(DEFAULT_FONT_SIZE),
        }
    }
}

impl Overlay {
    pub fn new(font: Option<FontArc>) -> Self {
        Self {
            font,
            ..Self::default()
        }
    }

    pub fn with_font_size(mut self, size: f32) -> Self {
        self.scale = PxScale::from(size);
        self
    }

    fn text_extent(&self, text: &str) -> (u32, u32) {
        match &self.font {
            Some(font) => text_size(self.scale, font, text),
            None => {
                let chars = text.chars().count() as f32;
                ((chars * self.scale.x * 0.5).ceil() as u32, self.scale.y.ceil() as u32)
            }
        }
    }

    /// Returns a copy of `image` with the detections drawn on it.
    pub fn draw(&self, image: &RgbImage, detections: &DetectionResult, names: &LabelMap) -> RgbImage {
        let mut canvas = image.clone();
        let (width, height) = (image.width() as f32, image.height() as f32);
        let rows = detections.boxes.rows().into_iter();
        for ((bbox, &label), &score) in rows.zip(&detections.labels).zip(&detections.scores) {
            let x1 = bbox[0].clamp(0.0, width);
            let y1 = bbox[1].clamp(0.0, height);
            let w = (bbox[2].clamp(0.0, width) - x1).round() as u32;
            let h = (bbox[3].clamp(0.0, height) - y1).round() as u32;
            if w == 0 || h == 0 {
                continue;
            }

            let (x, y) = (x1 as i32, y1 as i32);
            draw_hollow_rect_mut(&mut canvas, Rect::at(x, y).of_size(w, h), BOX_COLOR);
            if w > 2 && h > 2 {
                draw_hollow_rect_mut(&mut canvas, Rect::at(x + 1, y + 1).of_size(w - 2, h - 2), BOX_COLOR);
            }

            let text = format!("{} {:.2}", names.name(label), score);
            self.draw_label(&mut canvas, x, y, &text);
            debug!(label = %text, x, y, w, h, "drew box");
        }
        canvas
    }

    fn draw_label(&self, canvas: &mut RgbImage, x: i32, y: i32, text: &str) {
        let (text_w, text_h) = self.text_extent(text);
        let bar_h = text_h + 2 * LABEL_PADDING;
        let bar_w = (text_w + 2 * LABEL_PADDING).min(canvas.width().saturating_sub(x as u32));
        if bar_w == 0 {
            return;
        }

        let top = if y >= bar_h as i32 { y - bar_h as i32 } else { y };
        draw_filled_rect_mut(canvas, Rect::at(x, top).of_size(bar_w, bar_h), BOX_COLOR);
        if let Some(font) = &self.font {
            let pad = LABEL_PADDING as i32;
            draw_text_mut(canvas, TEXT_COLOR, x + pad, top + pad, self.scale, font, text);
        }
    }
}

/// Draws with the default [`Overlay`], which has no font.
pub fn overlay_boxes(image: &RgbImage, detections: &DetectionResult, names: &LabelMap) -> RgbImage {
    Overlay::default().draw(image, detections, names)
}

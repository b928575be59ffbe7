use ndarray::prelude::*;
use rayon::prelude::*;

use crate::anchors::AnchorSet;
use crate::errors::{Result, YoloError};
use crate::ops::{batched_nms, sigmoid, xywh_to_xyxy};
use crate::transform::{scale_boxes_to_original, ImageMeta};

/// Detections of one image.
///
/// `boxes` is `[K, 4]` with `(x1, y1, x2, y2)` in original-image pixels; `labels`
/// and `scores` have length `K` and rows are sorted by decreasing score.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub boxes: Array2<f32>,
    pub labels: Array1<i64>,
    pub scores: Array1<f32>,
}

impl DetectionResult {
    pub fn empty() -> Self {
        Self {
            boxes: Array2::zeros((0, 4)),
            labels: Array1::zeros(0),
            scores: Array1::zeros(0),
        }
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PostProcess {
    pub score_thresh: f32,
    pub nms_thresh: f32,
    pub detections_per_img: usize,
}

impl Default for PostProcess {
    fn default() -> Self {
        Self {
            score_thresh: 0.25,
            nms_thresh: 0.45,
            detections_per_img: 300,
        }
    }
}

struct Candidate {
    bbox: [f32; 4],
    score: f32,
    label: i64,
}

impl PostProcess {
    /// Decodes raw head outputs and returns one result per image, in batch order.
    pub fn run(
        &self,
        predictions: &[Array5<f32>],
        anchors: &AnchorSet,
        metas: &[ImageMeta],
    ) -> Result<Vec<DetectionResult>> {
        if predictions.len() != anchors.num_levels() {
            return Err(YoloError::validation(
                "predictions",
                format!(
                    "expected {} levels, got {}",
                    anchors.num_levels(),
                    predictions.len()
                ),
            ));
        }
        let batch_size = predictions[0].shape()[0];
        if predictions.iter().any(|p| p.shape()[0] != batch_size) || metas.len() != batch_size {
            return Err(YoloError::validation(
                "predictions",
                format!("batch size does not match {} images", metas.len()),
            ));
        }

        Ok((0..batch_size)
            .into_par_iter()
            .map(|b| {
                let candidates = self.candidates(predictions, anchors, b);
                let mut result = self.select(candidates);
                scale_boxes_to_original(&mut result.boxes, &metas[b]);
                result
            })
            .collect())
    }

    fn candidates(&self, predictions: &[Array5<f32>], anchors: &AnchorSet, image: usize) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for (level, pi) in predictions.iter().enumerate() {
            let stride = anchors.stride(level);
            let anchors_px = anchors.anchors_px(level);
            let (_, na, ny, nx, no) = pi.dim();
            for a in 0..na.min(anchors_px.len()) {
                let [aw, ah] = anchors_px[a];
                for y in 0..ny {
                    for x in 0..nx {
                        let p = pi.slice(s![image, a, y, x, ..]);
                        let obj = sigmoid(p[4]);
                        if obj <= self.score_thresh {
                            continue;
                        }
                        let cx = (sigmoid(p[0]) * 2.0 - 0.5 + x as f32) * stride;
                        let cy = (sigmoid(p[1]) * 2.0 - 0.5 + y as f32) * stride;
                        let w = (sigmoid(p[2]) * 2.0).powi(2) * aw;
                        let h = (sigmoid(p[3]) * 2.0).powi(2) * ah;
                        let bbox = xywh_to_xyxy([cx, cy, w, h]);
                        for c in 5..no {
                            let score = obj * sigmoid(p[c]);
                            if score > self.score_thresh {
                                candidates.push(Candidate {
                                    bbox,
                                    score,
                                    label: (c - 5) as i64,
                                });
                            }
                        }
                    }
                }
            }
        }
        candidates
    }

    fn select(&self, candidates: Vec<Candidate>) -> DetectionResult {
        if candidates.is_empty() {
            return DetectionResult::empty();
        }
        let boxes = Array2::from_shape_fn((candidates.len(), 4), |(i, j)| candidates[i].bbox[j]);
        let scores = Array1::from_iter(candidates.iter().map(|c| c.score));
        let labels = Array1::from_iter(candidates.iter().map(|c| c.label));

        let mut keep = batched_nms(boxes.view(), scores.view(), labels.view(), self.nms_thresh);
        keep.truncate(self.detections_per_img);

        DetectionResult {
            boxes: boxes.select(Axis(0), &keep),
            labels: labels.select(Axis(0), &keep),
            scores: scores.select(Axis(0), &keep),
        }
    }
}

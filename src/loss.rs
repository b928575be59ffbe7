//! YOLOv5 training loss: anchor matching, CIoU box regression, objectness and class
//! binary cross-entropy.

use std::collections::BTreeMap;

use ndarray::prelude::*;
use tracing::debug;

use crate::anchors::AnchorSet;
use crate::errors::{Result, YoloError};
use crate::ops::{bbox_ciou, bce_with_logits, sigmoid};

/// Loss weights and matching thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct LossConfig {
    pub box_gain: f32,
    pub cls_gain: f32,
    pub obj_gain: f32,
    /// Maximum width/height ratio between a target and an anchor it is matched to.
    pub anchor_t: f32,
    /// Objectness weight per pyramid level.
    pub balance: Vec<f32>,
    /// Objectness target mix between 1.0 and the predicted IoU.
    pub gr: f32,
    pub label_smoothing: f32,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            box_gain: 0.05,
            cls_gain: 0.5,
            obj_gain: 1.0,
            anchor_t: 4.0,
            balance: balance_for(3),
            gr: 1.0,
            label_smoothing: 0.0,
        }
    }
}

fn balance_for(num_levels: usize) -> Vec<f32> {
    if num_levels == 3 {
        vec![4.0, 1.0, 0.4]
    } else {
        vec![4.0, 1.0, 0.25, 0.06, 0.02]
    }
}

impl LossConfig {
    /// Rescales the gains for the number of classes, the input size and the number of
    /// detection layers, the way they are tuned for 80 classes, 640px and 3 layers.
    pub fn scaled(mut self, num_classes: usize, img_size: usize, num_levels: usize) -> Self {
        let layers = 3.0 / num_levels as f32;
        self.box_gain *= layers;
        self.cls_gain *= num_classes as f32 / 80.0 * layers;
        self.obj_gain *= (img_size as f32 / 640.0).powi(2) * layers;
        self.balance = balance_for(num_levels);
        self
    }
}

/// The three named loss components, each already multiplied by the batch size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossDict {
    pub loss_classifier: f32,
    pub loss_box_reg: f32,
    pub loss_objectness: f32,
}

impl LossDict {
    pub fn total(&self) -> f32 {
        self.loss_classifier + self.loss_box_reg + self.loss_objectness
    }

    pub fn as_map(&self) -> BTreeMap<&'static str, f32> {
        BTreeMap::from([
            ("loss_classifier", self.loss_classifier),
            ("loss_box_reg", self.loss_box_reg),
            ("loss_objectness", self.loss_objectness),
        ])
    }
}

/// One ground-truth box, normalised to the network input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetRow {
    pub image: usize,
    pub class: usize,
    /// `(cx, cy, w, h)` in `[0, 1]` of the network input.
    pub xywh: [f32; 4],
}

/// A target assigned to one anchor of one grid cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assignment {
    pub image: usize,
    pub anchor: usize,
    pub gj: usize,
    pub gi: usize,
    /// Box relative to the cell corner `(gi, gj)`, in grid units.
    pub tbox: [f32; 4],
    pub class: usize,
}

const NEIGHBOUR_BIAS: f32 = 0.5;

pub struct ComputeLoss {
    config: LossConfig,
    anchors: AnchorSet,
    num_classes: usize,
}

impl ComputeLoss {
    pub fn new(config: LossConfig, anchors: AnchorSet, num_classes: usize) -> Self {
        Self {
            config,
            anchors,
            num_classes,
        }
    }

    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    /// Assigns targets to anchors and grid cells of a level with grid `(ny, nx)`.
    ///
    /// A target is kept for an anchor when neither side differs by more than
    /// `anchor_t` times. Besides its own cell it is also assigned to the two
    /// neighbouring cells whose borders are closest to its centre.
    pub fn build_targets(&self, level: usize, grid: (usize, usize), targets: &[TargetRow]) -> Vec<Assignment> {
        let (ny, nx) = grid;
        let anchors = self.anchors.anchors_grid(level);
        let g = NEIGHBOUR_BIAS;
        let offsets = [[0.0, 0.0], [g, 0.0], [0.0, g], [-g, 0.0], [0.0, -g]];

        // anchor-major, then target order
        let mut matched = Vec::new();
        for (a, [aw, ah]) in anchors.iter().enumerate() {
            for t in targets {
                let gw = t.xywh[2] * nx as f32;
                let gh = t.xywh[3] * ny as f32;
                let (rw, rh) = (gw / aw, gh / ah);
                let worst = rw.max(1.0 / rw).max(rh.max(1.0 / rh));
                if worst < self.config.anchor_t {
                    matched.push((a, t, [t.xywh[0] * nx as f32, t.xywh[1] * ny as f32, gw, gh]));
                }
            }
        }

        let mut assignments = Vec::with_capacity(matched.len() * 3);
        for (k, [ox, oy]) in offsets.iter().enumerate() {
            for (a, t, [gx, gy, gw, gh]) in &matched {
                let (gxi, gyi) = (nx as f32 - gx, ny as f32 - gy);
                let selected = match k {
                    0 => true,
                    1 => gx.rem_euclid(1.0) < g && *gx > 1.0,
                    2 => gy.rem_euclid(1.0) < g && *gy > 1.0,
                    3 => gxi.rem_euclid(1.0) < g && gxi > 1.0,
                    _ => gyi.rem_euclid(1.0) < g && gyi > 1.0,
                };
                if !selected {
                    continue;
                }
                // offsets are taken against the clamped cell
                let gi = (gx - ox).trunc().clamp(0.0, nx.saturating_sub(1) as f32);
                let gj = (gy - oy).trunc().clamp(0.0, ny.saturating_sub(1) as f32);
                assignments.push(Assignment {
                    image: t.image,
                    anchor: *a,
                    gj: gj as usize,
                    gi: gi as usize,
                    tbox: [gx - gi, gy - gj, *gw, *gh],
                    class: t.class,
                });
            }
        }
        assignments
    }

    /// Computes the loss of raw head outputs `[N, anchors, ny, nx, 5 + nc]` per level.
    pub fn compute(&self, predictions: &[Array5<f32>], targets: &[TargetRow]) -> Result<LossDict> {
        self.check_predictions(predictions)?;
        let batch_size = predictions[0].shape()[0];
        if let Some(t) = targets.iter().find(|t| t.image >= batch_size || t.class >= self.num_classes) {
            return Err(YoloError::validation(
                "targets",
                format!(
                    "row (image {}, class {}) is outside batch {} / {} classes",
                    t.image, t.class, batch_size, self.num_classes
                ),
            ));
        }

        let nc = self.num_classes;
        let eps = self.config.label_smoothing;
        let (cp, cn) = (1.0 - 0.5 * eps, 0.5 * eps);
        let (mut lbox, mut lobj, mut lcls) = (0.0f32, 0.0f32, 0.0f32);

        for (level, pi) in predictions.iter().enumerate() {
            let (bs, na, ny, nx, _) = pi.dim();
            let anchors = self.anchors.anchors_grid(level);
            let assignments = self.build_targets(level, (ny, nx), targets);
            let mut tobj = Array4::<f32>::zeros((bs, na, ny, nx));

            if !assignments.is_empty() {
                let mut box_sum = 0.0f32;
                let mut cls_sum = 0.0f32;
                for m in &assignments {
                    let ps = pi.slice(s![m.image, m.anchor, m.gj, m.gi, ..]);
                    let [aw, ah] = anchors[m.anchor];
                    let px = sigmoid(ps[0]) * 2.0 - 0.5;
                    let py = sigmoid(ps[1]) * 2.0 - 0.5;
                    let pw = (sigmoid(ps[2]) * 2.0).powi(2) * aw;
                    let ph = (sigmoid(ps[3]) * 2.0).powi(2) * ah;
                    let iou = bbox_ciou([px, py, pw, ph], m.tbox);
                    box_sum += 1.0 - iou;

                    let gr = self.config.gr;
                    tobj[[m.image, m.anchor, m.gj, m.gi]] = (1.0 - gr) + gr * iou.max(0.0);

                    if nc > 1 {
                        for c in 0..nc {
                            let t = if c == m.class { cp } else { cn };
                            cls_sum += bce_with_logits(ps[5 + c], t);
                        }
                    }
                }
                let n = assignments.len() as f32;
                lbox += box_sum / n;
                if nc > 1 {
                    lcls += cls_sum / (n * nc as f32);
                }
            }

            let obj_logits = pi.slice(s![.., .., .., .., 4usize]);
            let obj_loss = ndarray::Zip::from(&obj_logits)
                .and(&tobj)
                .fold(0.0f32, |acc, &x, &t| acc + bce_with_logits(x, t))
                / tobj.len() as f32;
            let balance = self.config.balance.get(level).copied().unwrap_or(1.0);
            lobj += obj_loss * balance;

            debug!(
                level,
                assignments = assignments.len(),
                obj_loss,
                "computed level loss"
            );
        }

        let bs = batch_size as f32;
        Ok(LossDict {
            loss_classifier: lcls * self.config.cls_gain * bs,
            loss_box_reg: lbox * self.config.box_gain * bs,
            loss_objectness: lobj * self.config.obj_gain * bs,
        })
    }

    fn check_predictions(&self, predictions: &[Array5<f32>]) -> Result<()> {
        if predictions.len() != self.anchors.num_levels() {
            return Err(YoloError::validation(
                "predictions",
                format!(
                    "expected {} levels, got {}",
                    self.anchors.num_levels(),
                    predictions.len()
                ),
            ));
        }
        let batch_size = predictions[0].shape()[0];
        for p in predictions {
            let (bs, na, _, _, no) = p.dim();
            if bs != batch_size || na != self.anchors.num_anchors() || no != self.num_classes + 5 {
                return Err(YoloError::validation(
                    "predictions",
                    format!(
                        "level shape {:?} does not match batch {}, {} anchors, {} outputs",
                        p.shape(),
                        batch_size,
                        self.anchors.num_anchors(),
                        self.num_classes + 5
                    ),
                ));
            }
        }
        Ok(())
    }
}

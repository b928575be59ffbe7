use ndarray::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::anchors::AnchorSet;
use crate::errors::{Result, YoloError};

struct HeadLevel {
    /// `[anchors * (5 + nc), in_channels]`
    weight: Array2<f32>,
    bias: Array1<f32>,
}

/// YOLOv5 `Detect` layer: a 1x1 convolution per pyramid level.
pub struct DetectHead {
    num_classes: usize,
    num_anchors: usize,
    levels: Vec<HeadLevel>,
}

impl DetectHead {
    /// Builds an untrained head for `num_classes` on top of feature maps with
    /// `in_channels` channels per level.
    ///
    /// Weights are drawn from `U(-1/sqrt(C), 1/sqrt(C))`; objectness and class biases
    /// start from the usual priors (about 8 objects per 640px image and a 0.6 class
    /// frequency spread over `num_classes`).
    pub fn new(
        num_classes: usize,
        in_channels: &[usize],
        anchors: &AnchorSet,
        seed: u64,
    ) -> Result<Self> {
        if num_classes == 0 {
            return Err(YoloError::validation("num_classes", "must be at least 1"));
        }
        if in_channels.len() != anchors.num_levels() {
            return Err(YoloError::validation(
                "in_channels",
                format!(
                    "expected {} levels, got {}",
                    anchors.num_levels(),
                    in_channels.len()
                ),
            ));
        }

        let na = anchors.num_anchors();
        let no = num_classes + 5;
        let mut rng = StdRng::seed_from_u64(seed);
        let levels = in_channels
            .iter()
            .zip(anchors.strides())
            .map(|(&channels, &stride)| {
                let bound = 1.0 / (channels.max(1) as f32).sqrt();
                let weight = Array2::from_shape_simple_fn((na * no, channels), || {
                    rng.gen_range(-bound..bound)
                });
                let mut bias = Array1::from_shape_simple_fn(na * no, || rng.gen_range(-bound..bound));
                let obj_prior = (8.0 / (640.0 / stride).powi(2)).ln();
                let cls_prior = (0.6 / (num_classes as f32 - 0.99)).ln();
                for a in 0..na {
                    bias[a * no + 4] += obj_prior;
                    for c in 0..num_classes {
                        bias[a * no + 5 + c] += cls_prior;
                    }
                }
                HeadLevel { weight, bias }
            })
            .collect();

        Ok(Self {
            num_classes,
            num_anchors: na,
            levels,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn in_channels(&self) -> Vec<usize> {
        self.levels.iter().map(|l| l.weight.ncols()).collect()
    }

    /// Maps `[N, C, H, W]` features to `[N, anchors, H, W, 5 + nc]` raw predictions.
    pub fn forward(&self, features: &[Array4<f32>]) -> Result<Vec<Array5<f32>>> {
        if features.len() != self.levels.len() {
            return Err(YoloError::validation(
                "features",
                format!("expected {} levels, got {}", self.levels.len(), features.len()),
            ));
        }

        let na = self.num_anchors;
        let no = self.num_classes + 5;
        features
            .iter()
            .zip(&self.levels)
            .map(|(feature, level)| {
                let (n, c, h, w) = feature.dim();
                if c != level.weight.ncols() {
                    return Err(YoloError::validation(
                        "features",
                        format!("expected {} channels, got {}", level.weight.ncols(), c),
                    ));
                }

                let mut out = Array5::<f32>::zeros((n, na, h, w, no));
                let bias = level.bias.view().insert_axis(Axis(1));
                for b in 0..n {
                    let x = feature.slice(s![b, .., .., ..]);
                    let x = x.to_shape((c, h * w))?;
                    let y = level.weight.dot(&x) + &bias;
                    let y = y
                        .into_shape_with_order((na, no, h, w))?
                        .permuted_axes([0, 2, 3, 1]);
                    out.slice_mut(s![b, .., .., .., ..]).assign(&y);
                }
                Ok(out)
            })
            .collect()
    }
}

use crate::errors::Result;
use crate::loss::LossDict;
use crate::postprocess::DetectionResult;
use crate::target::Target;
use ndarray::prelude::*;

/// Source of raw (undecoded) detection head outputs.
///
/// This is the seam between the runtime that evaluates the network and the pure
/// decoding/loss code, so either side can be swapped out in tests.
pub trait RawPredictor: Send + Sync {
    /// One `[N, anchors, ny, nx, 5 + num_classes]` tensor per pyramid level, ordered
    /// from the smallest stride to the largest.
    fn raw_forward(&self, batch: ArrayView4<f32>) -> Result<Vec<Array5<f32>>>;

    fn num_classes(&self) -> usize;

    /// `(height, width)` the network requires, when its input is not dynamic.
    fn fixed_input_size(&self) -> Option<(usize, usize)> {
        None
    }
}

impl<P: RawPredictor + ?Sized> RawPredictor for Box<P> {
    fn raw_forward(&self, batch: ArrayView4<f32>) -> Result<Vec<Array5<f32>>> {
        (**self).raw_forward(batch)
    }

    fn num_classes(&self) -> usize {
        (**self).num_classes()
    }

    fn fixed_input_size(&self) -> Option<(usize, usize)> {
        (**self).fixed_input_size()
    }
}

/// Feature extractor producing the P3/P4/P5 maps a detection head consumes.
pub trait Backbone: Send + Sync {
    /// One `[N, C, H, W]` map per pyramid level.
    fn features(&self, batch: ArrayView4<f32>) -> Result<Vec<Array4<f32>>>;

    /// Channel count of each level returned by [`Backbone::features`].
    fn out_channels(&self) -> Vec<usize>;

    fn fixed_input_size(&self) -> Option<(usize, usize)> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    Training,
    #[default]
    Inference,
}

#[derive(Debug, Clone)]
pub enum ModelOutput {
    Detections(Vec<DetectionResult>),
    Losses(LossDict),
}

impl ModelOutput {
    pub fn into_detections(self) -> Option<Vec<DetectionResult>> {
        match self {
            Self::Detections(d) => Some(d),
            Self::Losses(_) => None,
        }
    }

    pub fn into_losses(self) -> Option<LossDict> {
        match self {
            Self::Losses(l) => Some(l),
            Self::Detections(_) => None,
        }
    }
}

/// Detection model with an explicit training/inference toggle.
pub trait DetectionModel {
    fn mode(&self) -> Mode;

    fn set_mode(&mut self, mode: Mode);

    fn train(&mut self) {
        self.set_mode(Mode::Training);
    }

    fn eval(&mut self) {
        self.set_mode(Mode::Inference);
    }

    fn is_training(&self) -> bool {
        self.mode() == Mode::Training
    }

    fn num_classes(&self) -> usize;

    /// Inference mode returns per-image detections aligned with `images`; training
    /// mode requires `targets` and returns the loss components.
    fn forward(&self, images: &[Array3<f32>], targets: Option<&[Target]>) -> Result<ModelOutput>;
}

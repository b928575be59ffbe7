use ndarray::prelude::*;

use crate::anchors::AnchorSet;
use crate::errors::{Result, YoloError};
use crate::model::{YoloOptions, YoloV5};
use crate::traits::{Backbone, RawPredictor};

const CONFIDENT: f32 = 8.0;
const SILENT: f32 = -8.0;

fn grid(size: usize, stride: f32) -> usize {
    let stride = stride as usize;
    size.div_ceil(stride).max(1)
}

/// Test predictor: every image yields exactly one confident box in the centre cell of
/// the first level, labelled `image_index % num_classes`.
#[derive(Debug, Clone)]
pub struct MockPredictor {
    pub num_classes: usize,
    anchors: AnchorSet,
    fixed_input: Option<usize>,
}

impl MockPredictor {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            anchors: AnchorSet::default(),
            fixed_input: None,
        }
    }

    /// Only accepts `size x size` batches, like a graph exported without dynamic axes.
    pub fn with_fixed_input(mut self, size: usize) -> Self {
        self.fixed_input = Some(size);
        self
    }
}

impl RawPredictor for MockPredictor {
    fn raw_forward(&self, batch: ArrayView4<f32>) -> Result<Vec<Array5<f32>>> {
        let (n, _, h, w) = batch.dim();
        if let Some(size) = self.fixed_input {
            if (h, w) != (size, size) {
                return Err(YoloError::validation(
                    "batch",
                    format!("expected {}x{} input, got {}x{}", size, size, w, h),
                ));
            }
        }
        let na = self.anchors.num_anchors();
        let no = self.num_classes + 5;

        let mut levels: Vec<_> = self
            .anchors
            .strides()
            .iter()
            .map(|&s| Array5::<f32>::from_elem((n, na, grid(h, s), grid(w, s), no), SILENT))
            .collect();

        let (_, _, ny, nx, _) = levels[0].dim();
        let anchor = 0usize;
        for b in 0..n {
            let mut cell = levels[0].slice_mut(s![b, anchor, ny / 2, nx / 2, ..]);
            cell.slice_mut(s![..4usize]).fill(0.0);
            cell[4] = CONFIDENT;
            cell[5 + b % self.num_classes] = CONFIDENT;
        }
        Ok(levels)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn fixed_input_size(&self) -> Option<(usize, usize)> {
        self.fixed_input.map(|size| (size, size))
    }
}

/// Test backbone: strided samples of the input, repeated over `channels`.
#[derive(Debug, Clone)]
pub struct MockBackbone {
    channels: Vec<usize>,
    strides: Vec<f32>,
}

impl MockBackbone {
    pub fn new(channels: Vec<usize>, strides: Vec<f32>) -> Self {
        Self { channels, strides }
    }
}

impl Backbone for MockBackbone {
    fn features(&self, batch: ArrayView4<f32>) -> Result<Vec<Array4<f32>>> {
        let (n, c, h, w) = batch.dim();
        Ok(self
            .channels
            .iter()
            .zip(&self.strides)
            .map(|(&channels, &stride)| {
                let step = stride as usize;
                Array4::from_shape_fn(
                    (n, channels, grid(h, stride), grid(w, stride)),
                    |(b, ch, y, x)| {
                        let v = batch[[b, ch % c, (y * step).min(h - 1), (x * step).min(w - 1)]];
                        v * (1.0 + ch as f32 * 0.1)
                    },
                )
            })
            .collect())
    }

    fn out_channels(&self) -> Vec<usize> {
        self.channels.clone()
    }
}

/// Mock-backed model on a 64px input.
pub fn create_mock_model(num_classes: usize) -> YoloV5<MockPredictor> {
    YoloV5::from_parts(
        MockPredictor::new(num_classes),
        &YoloOptions::pretrained().img_size(64),
    )
}

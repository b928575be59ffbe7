use ndarray::prelude::*;

use crate::errors::{Result, YoloError};

/// Ground-truth annotation for one image.
///
/// `boxes` holds one normalised `(cx, cy, w, h)` row per object, relative to the
/// original image; `labels` holds the matching class ids.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub boxes: Array2<f32>,
    pub labels: Array1<i64>,
}

impl Target {
    pub fn new(boxes: Array2<f32>, labels: Array1<i64>) -> Result<Self> {
        let target = Self { boxes, labels };
        target.check_shape()?;
        Ok(target)
    }

    pub fn empty() -> Self {
        Self {
            boxes: Array2::zeros((0, 4)),
            labels: Array1::zeros(0),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Checks shapes, coordinates and that every label is below `num_classes`.
    pub fn validate(&self, num_classes: usize) -> Result<()> {
        self.check_shape()?;
        if let Some(label) = self
            .labels
            .iter()
            .find(|&&l| l < 0 || l as usize >= num_classes)
        {
            return Err(YoloError::validation(
                "labels",
                format!("{} is outside 0..{}", label, num_classes),
            ));
        }
        Ok(())
    }

    fn check_shape(&self) -> Result<()> {
        if self.boxes.ncols() != 4 {
            return Err(YoloError::validation(
                "boxes",
                format!("must have 4 columns, got {}", self.boxes.ncols()),
            ));
        }
        if self.boxes.nrows() != self.labels.len() {
            return Err(YoloError::validation(
                "boxes",
                format!(
                    "count {} does not match label count {}",
                    self.boxes.nrows(),
                    self.labels.len()
                ),
            ));
        }
        if self.boxes.iter().any(|v| !v.is_finite()) {
            return Err(YoloError::validation("boxes", "must be finite"));
        }
        if self.boxes.column(0).iter().chain(self.boxes.column(1).iter()).any(|v| !(0.0..=1.0).contains(v)) {
            return Err(YoloError::validation("boxes", "centres must lie in [0, 1]"));
        }
        if self.boxes.column(2).iter().chain(self.boxes.column(3).iter()).any(|v| *v < 0.0) {
            return Err(YoloError::validation("boxes", "width and height must be non-negative"));
        }
        Ok(())
    }
}

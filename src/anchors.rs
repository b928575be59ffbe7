use crate::errors::{Result, YoloError};

/// Anchor boxes (in input pixels) and strides for each pyramid level.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorSet {
    anchors: Vec<Vec<[f32; 2]>>,
    strides: Vec<f32>,
}

impl Default for AnchorSet {
    /// YOLOv5 P3/8, P4/16 and P5/32 anchors.
    fn default() -> Self {
        Self {
            anchors: vec![
                vec![[10.0, 13.0], [16.0, 30.0], [33.0, 23.0]],
                vec![[30.0, 61.0], [62.0, 45.0], [59.0, 119.0]],
                vec![[116.0, 90.0], [156.0, 198.0], [373.0, 326.0]],
            ],
            strides: vec![8.0, 16.0, 32.0],
        }
    }
}

impl AnchorSet {
    pub fn new(anchors: Vec<Vec<[f32; 2]>>, strides: Vec<f32>) -> Result<Self> {
        if anchors.is_empty() || anchors.len() != strides.len() {
            return Err(YoloError::validation(
                "anchors",
                format!(
                    "need one anchor group per stride, got {} groups and {} strides",
                    anchors.len(),
                    strides.len()
                ),
            ));
        }
        let na = anchors[0].len();
        if na == 0 || anchors.iter().any(|level| level.len() != na) {
            return Err(YoloError::validation(
                "anchors",
                "every level must have the same non-zero number of anchors",
            ));
        }
        if strides.iter().any(|s| *s <= 0.0) {
            return Err(YoloError::validation("strides", "must be positive"));
        }
        Ok(Self { anchors, strides })
    }

    pub fn num_levels(&self) -> usize {
        self.strides.len()
    }

    pub fn num_anchors(&self) -> usize {
        self.anchors[0].len()
    }

    pub fn strides(&self) -> &[f32] {
        &self.strides
    }

    pub fn stride(&self, level: usize) -> f32 {
        self.strides[level]
    }

    pub fn max_stride(&self) -> usize {
        self.strides.iter().fold(0.0f32, |a, b| a.max(*b)) as usize
    }

    pub fn anchors_px(&self, level: usize) -> &[[f32; 2]] {
        &self.anchors[level]
    }

    /// Anchors of `level` expressed in grid cells.
    pub fn anchors_grid(&self, level: usize) -> Vec<[f32; 2]> {
        let stride = self.strides[level];
        self.anchors[level]
            .iter()
            .map(|[w, h]| [w / stride, h / stride])
            .collect()
    }
}

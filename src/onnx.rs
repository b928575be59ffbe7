use std::path::Path;

use ndarray::prelude::*;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::errors::{Result, YoloError};
use crate::traits::{Backbone, RawPredictor};

/// Runtime options shared by every ONNX graph the engine loads.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Register TensorRT and CUDA execution providers.
    pub gpu: bool,
    pub device_id: i32,
    pub intra_threads: Option<usize>,
    /// Side of the square zero tensor run once after loading to read the output
    /// shapes. `None` runs at 64px. Graphs with a fixed input always run at
    /// that input size.
    pub warmup_size: Option<usize>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            gpu: false,
            device_id: 0,
            intra_threads: None,
            warmup_size: Some(640),
        }
    }
}

struct OnnxSession {
    session: Mutex<Session>,
    input_name: String,
    /// Declared `[N, C, H, W]`; dynamic axes are negative.
    input_shape: Vec<i64>,
    output_names: Vec<String>,
}

impl OnnxSession {
    fn new(model_path: &Path, options: &SessionOptions) -> Result<Self> {
        if !model_path.exists() {
            return Err(YoloError::FileSystem {
                path: model_path.to_path_buf(),
                operation: "model lookup".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "model file does not exist"),
            });
        }

        let mut builder = SessionBuilder::new()
            .map_err(|e| YoloError::model("session builder initialisation", e.to_string()))?;
        if options.gpu {
            builder = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_device_id(options.device_id)
                        .build(),
                    CUDAExecutionProvider::default()
                        .with_device_id(options.device_id)
                        .build(),
                ])
                .map_err(|e| YoloError::model("execution provider setup", e.to_string()))?;
        }
        if let Some(threads) = options.intra_threads {
            builder = builder
                .with_intra_threads(threads)
                .map_err(|e| YoloError::model("intra-op thread setup", e.to_string()))?;
        }
        let session = builder
            .with_memory_pattern(true)
            .map_err(|e| YoloError::model("memory pattern setup", e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| {
                YoloError::model(
                    format!("model file loading: {}", model_path.display()),
                    e.to_string(),
                )
            })?;

        let input = session
            .inputs
            .first()
            .ok_or_else(|| YoloError::model("model input lookup", "graph has no inputs"))?;
        let input_name = input.name.clone();
        let input_shape: Vec<i64> = input
            .input_type
            .tensor_shape()
            .map(|shape| shape.iter().copied().collect())
            .ok_or_else(|| YoloError::model("model input lookup", "input is not a tensor"))?;
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        if output_names.is_empty() {
            return Err(YoloError::model("model output lookup", "graph has no outputs"));
        }
        info!(
            model = %model_path.display(),
            input = %input_name,
            input_shape = ?input_shape,
            outputs = ?output_names,
            gpu = options.gpu,
            "loaded ONNX graph"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            input_shape,
            output_names,
        })
    }

    fn fixed_input_size(&self) -> Option<(usize, usize)> {
        fixed_hw(&self.input_shape)
    }

    /// Runs once, at the fixed input size when the graph declares one.
    fn dry_run(&self, options: &SessionOptions) -> Result<Vec<ArrayD<f32>>> {
        match self.fixed_input_size() {
            Some((h, w)) => {
                let data = Array4::<f32>::zeros((1, 3, h, w));
                self.run(data.view())
            }
            None => self.warmup(options.warmup_size.unwrap_or(64)),
        }
    }

    fn run(&self, batch: ArrayView4<f32>) -> Result<Vec<ArrayD<f32>>> {
        let mut binding = self.session.lock();
        let outputs = binding.run(ort::inputs![
            self.input_name.as_str() => TensorRef::from_array_view(&batch.as_standard_layout())?
        ])?;
        self.output_names
            .iter()
            .map(|name| Ok(outputs[name.as_str()].try_extract_array::<f32>()?.to_owned()))
            .collect()
    }

    fn warmup(&self, size: usize) -> Result<Vec<ArrayD<f32>>> {
        let data = Array4::<f32>::zeros((1, 3, size, size));
        let outputs = self.run(data.view())?;
        debug!(size, "warm-up run finished");
        Ok(outputs)
    }
}

/// Spatial size of an `[N, C, H, W]` input whose height and width are static.
fn fixed_hw(shape: &[i64]) -> Option<(usize, usize)> {
    match shape {
        [_, _, h, w] if *h > 0 && *w > 0 => Some((*h as usize, *w as usize)),
        _ => None,
    }
}

/// Converts one raw head output into `[N, anchors, ny, nx, no]`.
///
/// Graphs exported without the final reshape emit `[N, anchors * no, ny, nx]`.
fn to_level_tensor(raw: ArrayD<f32>, num_anchors: usize) -> Result<Array5<f32>> {
    match raw.ndim() {
        5 => Ok(raw.into_dimensionality::<Ix5>()?),
        4 => {
            let raw = raw.into_dimensionality::<Ix4>()?;
            let (n, c, h, w) = raw.dim();
            if c % num_anchors != 0 {
                return Err(YoloError::validation(
                    "model output",
                    format!("{} channels are not divisible by {} anchors", c, num_anchors),
                ));
            }
            let no = c / num_anchors;
            Ok(raw
                .to_shape((n, num_anchors, no, h, w))?
                .permuted_axes([0, 1, 3, 4, 2])
                .to_owned())
        }
        d => Err(YoloError::validation(
            "model output",
            format!("expected a 4-D or 5-D tensor, got {} dimensions", d),
        )),
    }
}

/// A complete YOLOv5 graph whose outputs are the raw head tensors of each level.
pub struct OnnxPredictor {
    session: OnnxSession,
    num_anchors: usize,
    num_classes: usize,
}

impl OnnxPredictor {
    pub fn new(model_path: &Path, num_anchors: usize, options: &SessionOptions) -> Result<Self> {
        let session = OnnxSession::new(model_path, options)?;
        let outputs = session.dry_run(options)?;
        let first = to_level_tensor(
            outputs
                .into_iter()
                .next()
                .ok_or_else(|| YoloError::model("model output lookup", "graph has no outputs"))?,
            num_anchors,
        )?;
        let no = first.shape()[4];
        if no <= 5 {
            return Err(YoloError::validation(
                "model output",
                format!("last dimension {} leaves no room for class scores", no),
            ));
        }

        Ok(Self {
            session,
            num_anchors,
            num_classes: no - 5,
        })
    }
}

impl RawPredictor for OnnxPredictor {
    fn raw_forward(&self, batch: ArrayView4<f32>) -> Result<Vec<Array5<f32>>> {
        self.session
            .run(batch)?
            .into_iter()
            .map(|raw| to_level_tensor(raw, self.num_anchors))
            .collect()
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn fixed_input_size(&self) -> Option<(usize, usize)> {
        self.session.fixed_input_size()
    }
}

/// Backbone and neck of a YOLOv5 graph, emitting the P3/P4/P5 feature maps.
pub struct OnnxBackbone {
    session: OnnxSession,
    out_channels: Vec<usize>,
}

impl OnnxBackbone {
    pub fn new(model_path: &Path, options: &SessionOptions) -> Result<Self> {
        let session = OnnxSession::new(model_path, options)?;
        let outputs = session.dry_run(options)?;
        let out_channels = outputs
            .iter()
            .map(|f| match f.ndim() {
                4 => Ok(f.shape()[1]),
                d => Err(YoloError::validation(
                    "backbone output",
                    format!("expected 4-D feature maps, got {} dimensions", d),
                )),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            session,
            out_channels,
        })
    }
}

impl Backbone for OnnxBackbone {
    fn features(&self, batch: ArrayView4<f32>) -> Result<Vec<Array4<f32>>> {
        self.session
            .run(batch)?
            .into_iter()
            .map(|f| Ok(f.into_dimensionality::<Ix4>()?))
            .collect()
    }

    fn out_channels(&self) -> Vec<usize> {
        self.out_channels.clone()
    }

    fn fixed_input_size(&self) -> Option<(usize, usize)> {
        self.session.fixed_input_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_tensor_from_flat_channels() -> Result<()> {
        // [1, 3 * 6, 2, 2] where channel k of anchor a holds a * 10 + k
        let raw = Array4::from_shape_fn((1, 18, 2, 2), |(_, c, _, _)| {
            ((c / 6) * 10 + c % 6) as f32
        })
        .into_dyn();
        let level = to_level_tensor(raw, 3)?;
        assert_eq!(level.shape(), &[1, 3, 2, 2, 6]);
        assert_eq!(level[[0, 2, 1, 0, 4]], 24.0);
        assert_eq!(level[[0, 1, 0, 1, 0]], 10.0);
        Ok(())
    }

    #[test]
    fn test_level_tensor_passthrough_and_errors() {
        let five = Array5::<f32>::zeros((1, 3, 2, 2, 7)).into_dyn();
        assert_eq!(to_level_tensor(five, 3).unwrap().shape(), &[1, 3, 2, 2, 7]);
        let odd = Array4::<f32>::zeros((1, 10, 2, 2)).into_dyn();
        assert!(to_level_tensor(odd, 3).is_err());
        let flat = Array2::<f32>::zeros((4, 4)).into_dyn();
        assert!(to_level_tensor(flat, 3).is_err());
    }

    #[test]
    fn test_fixed_input_size_from_declared_shape() {
        assert_eq!(fixed_hw(&[1, 3, 640, 640]), Some((640, 640)));
        assert_eq!(fixed_hw(&[-1, 3, 384, 640]), Some((384, 640)));
        assert_eq!(fixed_hw(&[1, 3, -1, -1]), None);
        assert_eq!(fixed_hw(&[1, 3, 640]), None);
    }

    #[test]
    fn test_missing_model_file() {
        let result = OnnxPredictor::new(Path::new("missing/yolov5s.onnx"), 3, &SessionOptions::default());
        assert!(matches!(result, Err(YoloError::FileSystem { .. })));
        let result = OnnxBackbone::new(Path::new("missing/backbone.onnx"), &SessionOptions::default());
        assert!(matches!(result, Err(YoloError::FileSystem { .. })));
    }
}

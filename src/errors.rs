use std::path::PathBuf;
use thiserror::Error;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for the detection engine.
///
/// Each variant carries the context of its domain (filesystem, image decoding, model
/// runtime, input validation) so callers can match on the failure instead of parsing
/// messages. Sources are `Send + Sync` so errors cross rayon and `anyhow` boundaries.
#[derive(Error, Debug)]
pub enum YoloError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },
}

pub type Result<T> = std::result::Result<T, YoloError>;

impl YoloError {
    pub(crate) fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn model(operation: impl Into<String>, source: impl Into<BoxedSource>) -> Self {
        Self::Model {
            operation: operation.into(),
            source: source.into(),
        }
    }
}

/// Convert anyhow errors to configuration errors.
///
/// Some helpers return `anyhow::Error`, which carries no structure. They are folded into
/// the configuration category at the boundary rather than leaking `anyhow` into the API.
impl From<anyhow::Error> for YoloError {
    fn from(err: anyhow::Error) -> Self {
        YoloError::Configuration {
            message: err.to_string(),
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Callsites that know the path and operation should build `YoloError::FileSystem`
/// directly; this is only the fallback.
impl From<std::io::Error> for YoloError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<image::ImageError> for YoloError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

/// Convert ONNX Runtime errors to model errors.
///
/// The runtime error is flattened to its message; builder errors may hold session
/// handles that are not thread-safe.
impl From<ort::Error> for YoloError {
    fn from(err: ort::Error) -> Self {
        Self::model("ort operation", err.to_string())
    }
}

/// Shape errors come out of tensor reshapes inside the model, so they are model errors.
impl From<ndarray::ShapeError> for YoloError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

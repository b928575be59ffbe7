pub mod anchors;
pub mod config;
pub mod errors;
pub mod head;
pub mod labels;
pub mod loss;
pub mod model;
pub mod onnx;
pub mod ops;
pub mod postprocess;
pub mod preprocess;
pub mod target;
pub mod traits;
pub mod transform;
pub mod visualize;

pub mod mocks;

pub use anchors::AnchorSet;
pub use config::Config;
pub use errors::{Result, YoloError};
pub use labels::{load_names, LabelMap, COCO_CLASSES};
pub use loss::{ComputeLoss, LossConfig, LossDict};
pub use model::{
    build_model, yolov5l, yolov5m, yolov5n, yolov5s, yolov5x, HeadedBackbone, Variant, Weights,
    YoloOptions, YoloV5,
};
pub use postprocess::{DetectionResult, PostProcess};
pub use preprocess::{image_preprocess, preprocess_image, preprocess_images};
pub use target::Target;
pub use traits::*;
pub use transform::{ImageMeta, LetterboxTransform};

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use ndarray::prelude::*;
use tracing::{debug, info, warn};

use crate::anchors::AnchorSet;
use crate::errors::{Result, YoloError};
use crate::head::DetectHead;
use crate::loss::{ComputeLoss, LossConfig, LossDict, TargetRow};
use crate::onnx::{OnnxBackbone, OnnxPredictor, SessionOptions};
use crate::postprocess::{DetectionResult, PostProcess};
use crate::target::Target;
use crate::traits::{Backbone, DetectionModel, Mode, ModelOutput, RawPredictor};
use crate::transform::{targets_to_input, LetterboxTransform};

/// Environment variable pointing at the directory holding exported weights.
pub const WEIGHTS_DIR_ENV: &str = "YOLORT_HOME";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Variant {
    N,
    #[default]
    S,
    M,
    L,
    X,
}

impl Variant {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::N => "yolov5n",
            Self::S => "yolov5s",
            Self::M => "yolov5m",
            Self::L => "yolov5l",
            Self::X => "yolov5x",
        }
    }

    /// Channels of the P3/P4/P5 maps entering the detection head.
    pub const fn head_channels(&self) -> [usize; 3] {
        match self {
            Self::N => [64, 128, 256],
            Self::S => [128, 256, 512],
            Self::M => [192, 384, 768],
            Self::L => [256, 512, 1024],
            Self::X => [320, 640, 1280],
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How the model parameters are obtained. The two paths exclude each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Weights {
    /// Load the complete pretrained (COCO) graph.
    Pretrained,
    /// Pretrained backbone with a freshly initialised head for `num_classes`.
    Untrained { num_classes: usize },
}

#[derive(Debug, Clone)]
pub struct YoloOptions {
    pub weights: Weights,
    pub variant: Variant,
    pub weights_dir: PathBuf,
    pub img_size: usize,
    /// Pad only up to the next stride multiple instead of the full square. Ignored
    /// for graphs with a fixed input size.
    pub auto: bool,
    pub postprocess: PostProcess,
    pub loss: LossConfig,
    pub anchors: AnchorSet,
    pub session: SessionOptions,
    /// Seed for the initialisation of untrained heads.
    pub seed: u64,
}

impl YoloOptions {
    pub fn pretrained() -> Self {
        Self::with_weights(Weights::Pretrained)
    }

    pub fn with_num_classes(num_classes: usize) -> Self {
        Self::with_weights(Weights::Untrained { num_classes })
    }

    fn with_weights(weights: Weights) -> Self {
        Self {
            weights,
            variant: Variant::default(),
            weights_dir: default_weights_dir(),
            img_size: 640,
            auto: true,
            postprocess: PostProcess::default(),
            loss: LossConfig::default(),
            anchors: AnchorSet::default(),
            session: SessionOptions::default(),
            seed: 0,
        }
    }

    pub fn variant(mut self, variant: Variant) -> Self {
        self.variant = variant;
        self
    }

    pub fn weights_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.weights_dir = dir.into();
        self
    }

    pub fn img_size(mut self, img_size: usize) -> Self {
        self.img_size = img_size;
        self.session.warmup_size = self.session.warmup_size.map(|_| img_size);
        self
    }

    pub fn auto(mut self, auto: bool) -> Self {
        self.auto = auto;
        self
    }

    pub fn score_thresh(mut self, score_thresh: f32) -> Self {
        self.postprocess.score_thresh = score_thresh;
        self
    }

    pub fn nms_thresh(mut self, nms_thresh: f32) -> Self {
        self.postprocess.nms_thresh = nms_thresh;
        self
    }

    pub fn detections_per_img(mut self, detections_per_img: usize) -> Self {
        self.postprocess.detections_per_img = detections_per_img;
        self
    }

    pub fn session(mut self, session: SessionOptions) -> Self {
        self.session = session;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// `<weights_dir>/<variant>.onnx`
    pub fn pretrained_path(&self) -> PathBuf {
        self.weights_dir.join(format!("{}.onnx", self.variant))
    }

    /// `<weights_dir>/<variant>_backbone.onnx`
    pub fn backbone_path(&self) -> PathBuf {
        self.weights_dir.join(format!("{}_backbone.onnx", self.variant))
    }

    fn validate(&self) -> Result<()> {
        if let Weights::Untrained { num_classes: 0 } = self.weights {
            return Err(YoloError::Configuration {
                message: "num_classes must be at least 1".to_string(),
            });
        }
        let stride = self.anchors.max_stride();
        if self.img_size == 0 || stride == 0 || self.img_size % stride != 0 {
            return Err(YoloError::Configuration {
                message: format!("img_size {} must be a positive multiple of {}", self.img_size, stride),
            });
        }
        Ok(())
    }
}

fn default_weights_dir() -> PathBuf {
    std::env::var_os(WEIGHTS_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("weights"))
}

/// A backbone followed by a native detection head.
pub struct HeadedBackbone<B: Backbone> {
    backbone: B,
    head: DetectHead,
}

impl<B: Backbone> HeadedBackbone<B> {
    pub fn new(backbone: B, head: DetectHead) -> Result<Self> {
        let expected = head.in_channels();
        let actual = backbone.out_channels();
        if expected != actual {
            return Err(YoloError::validation(
                "backbone",
                format!("emits {:?} channels but the head expects {:?}", actual, expected),
            ));
        }
        Ok(Self { backbone, head })
    }
}

impl<B: Backbone> RawPredictor for HeadedBackbone<B> {
    fn raw_forward(&self, batch: ArrayView4<f32>) -> Result<Vec<Array5<f32>>> {
        let features = self.backbone.features(batch)?;
        self.head.forward(&features)
    }

    fn num_classes(&self) -> usize {
        self.head.num_classes()
    }

    fn fixed_input_size(&self) -> Option<(usize, usize)> {
        self.backbone.fixed_input_size()
    }
}

/// YOLOv5 detector: letterbox transform, a raw predictor, and decoding or loss
/// depending on the mode.
pub struct YoloV5<P: RawPredictor = Box<dyn RawPredictor>> {
    predictor: P,
    anchors: AnchorSet,
    transform: LetterboxTransform,
    postprocess: PostProcess,
    loss: ComputeLoss,
    mode: Mode,
}

impl<P: RawPredictor> YoloV5<P> {
    /// A predictor with a fixed square input overrides `img_size` and disables `auto`
    /// padding, so every batch matches the declared shape.
    pub fn from_parts(predictor: P, options: &YoloOptions) -> Self {
        let num_classes = predictor.num_classes();
        let anchors = options.anchors.clone();
        let (img_size, auto) = match predictor.fixed_input_size() {
            Some((h, w)) if h == w => {
                if h != options.img_size {
                    info!(img_size = h, requested = options.img_size, "using the fixed input size of the graph");
                }
                (h, false)
            }
            _ => (options.img_size, options.auto),
        };
        let loss_config =
            options
                .loss
                .clone()
                .scaled(num_classes, img_size, anchors.num_levels());
        Self {
            loss: ComputeLoss::new(loss_config, anchors.clone(), num_classes),
            transform: LetterboxTransform::new(img_size, anchors.max_stride()).with_auto(auto),
            postprocess: options.postprocess.clone(),
            predictor,
            anchors,
            mode: Mode::Inference,
        }
    }

    pub fn predictor(&self) -> &P {
        &self.predictor
    }

    pub fn anchors(&self) -> &AnchorSet {
        &self.anchors
    }

    pub fn transform(&self) -> &LetterboxTransform {
        &self.transform
    }

    /// Runs inference; the result has one entry per input image, in input order.
    pub fn predict(&self, images: &[Array3<f32>]) -> Result<Vec<DetectionResult>> {
        let start = Instant::now();
        let (batch, metas) = self.transform.batch(images)?;
        let raw = self.raw_forward(batch.view())?;
        let results = self.postprocess.run(&raw, &self.anchors, &metas)?;
        debug!(
            images = images.len(),
            detections = results.iter().map(|r| r.len()).sum::<usize>(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "inference finished"
        );
        Ok(results)
    }

    /// Computes the training loss of `images` against one target record per image.
    pub fn compute_loss(&self, images: &[Array3<f32>], targets: &[Target]) -> Result<LossDict> {
        if targets.len() != images.len() {
            return Err(YoloError::validation(
                "targets",
                format!("{} records for {} images", targets.len(), images.len()),
            ));
        }
        let num_classes = self.predictor.num_classes();
        for target in targets {
            target.validate(num_classes)?;
        }

        let (batch, metas) = self.transform.batch(images)?;
        let (_, _, height, width) = batch.dim();
        let rows: Vec<TargetRow> = targets
            .iter()
            .zip(&metas)
            .enumerate()
            .flat_map(|(image, (target, meta))| {
                let boxes = targets_to_input(target, meta, (height, width));
                target
                    .labels
                    .iter()
                    .zip(boxes.rows())
                    .map(|(&label, b)| TargetRow {
                        image,
                        class: label as usize,
                        xywh: [b[0], b[1], b[2], b[3]],
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        let raw = self.raw_forward(batch.view())?;
        let losses = self.loss.compute(&raw, &rows)?;
        debug!(
            targets = rows.len(),
            total = losses.total(),
            "loss computed"
        );
        Ok(losses)
    }

    fn raw_forward(&self, batch: ArrayView4<f32>) -> Result<Vec<Array5<f32>>> {
        let raw = self.predictor.raw_forward(batch)?;
        if raw.len() != self.anchors.num_levels() {
            return Err(YoloError::validation(
                "model output",
                format!(
                    "expected {} levels, got {}",
                    self.anchors.num_levels(),
                    raw.len()
                ),
            ));
        }
        Ok(raw)
    }
}

impl<P: RawPredictor> DetectionModel for YoloV5<P> {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    fn num_classes(&self) -> usize {
        self.predictor.num_classes()
    }

    /// Targets passed in inference mode are ignored.
    fn forward(&self, images: &[Array3<f32>], targets: Option<&[Target]>) -> Result<ModelOutput> {
        match self.mode {
            Mode::Inference => Ok(ModelOutput::Detections(self.predict(images)?)),
            Mode::Training => {
                let targets = targets.ok_or_else(|| {
                    YoloError::validation("targets", "are required in training mode")
                })?;
                Ok(ModelOutput::Losses(self.compute_loss(images, targets)?))
            }
        }
    }
}

impl YoloV5 {
    /// Loads a complete exported graph from an explicit path.
    pub fn from_checkpoint(path: &Path, options: &YoloOptions) -> Result<Self> {
        options.validate()?;
        let predictor = OnnxPredictor::new(path, options.anchors.num_anchors(), &options.session)?;
        info!(
            checkpoint = %path.display(),
            num_classes = predictor.num_classes(),
            "checkpoint loaded"
        );
        check_fixed_input(&predictor)?;
        let predictor: Box<dyn RawPredictor> = Box::new(predictor);
        Ok(Self::from_parts(predictor, options))
    }
}

fn check_fixed_input<P: RawPredictor>(predictor: &P) -> Result<()> {
    match predictor.fixed_input_size() {
        Some((h, w)) if h != w => Err(YoloError::Configuration {
            message: format!("graphs with a fixed non-square input ({}x{}) are not supported", w, h),
        }),
        _ => Ok(()),
    }
}

/// Builds a model from `options`, resolving weight files under `weights_dir`.
pub fn build_model(options: YoloOptions) -> Result<YoloV5> {
    options.validate()?;
    match options.weights {
        Weights::Pretrained => YoloV5::from_checkpoint(&options.pretrained_path(), &options),
        Weights::Untrained { num_classes } => {
            let backbone = OnnxBackbone::new(&options.backbone_path(), &options.session)?;
            let expected = options.variant.head_channels();
            if backbone.out_channels() != expected {
                warn!(
                    variant = %options.variant,
                    channels = ?backbone.out_channels(),
                    ?expected,
                    "backbone channels differ from the variant layout"
                );
            }
            let head = DetectHead::new(
                num_classes,
                &backbone.out_channels(),
                &options.anchors,
                options.seed,
            )?;
            info!(
                variant = %options.variant,
                num_classes,
                "initialised untrained detection head"
            );
            let predictor = HeadedBackbone::new(backbone, head)?;
            check_fixed_input(&predictor)?;
            let predictor: Box<dyn RawPredictor> = Box::new(predictor);
            Ok(YoloV5::from_parts(predictor, &options))
        }
    }
}

pub fn yolov5n(options: YoloOptions) -> Result<YoloV5> {
    build_model(options.variant(Variant::N))
}

pub fn yolov5s(options: YoloOptions) -> Result<YoloV5> {
    build_model(options.variant(Variant::S))
}

pub fn yolov5m(options: YoloOptions) -> Result<YoloV5> {
    build_model(options.variant(Variant::M))
}

pub fn yolov5l(options: YoloOptions) -> Result<YoloV5> {
    build_model(options.variant(Variant::L))
}

pub fn yolov5x(options: YoloOptions) -> Result<YoloV5> {
    build_model(options.variant(Variant::X))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockBackbone, MockPredictor};

    fn options() -> YoloOptions {
        YoloOptions::with_num_classes(12).img_size(64)
    }

    fn zidane_target() -> Result<Target> {
        Target::new(
            array![
                [0.3790f32, 0.5487, 0.3220, 0.2047],
                [0.2680, 0.5386, 0.2200, 0.1779],
                [0.1720, 0.5403, 0.1960, 0.1409],
                [0.2240, 0.4547, 0.1520, 0.0705],
            ],
            array![7, 2, 3, 4],
        )
    }

    #[test]
    fn test_mode_toggle() {
        let mut model = YoloV5::from_parts(MockPredictor::new(80), &options());
        assert_eq!(model.mode(), Mode::Inference);
        model.train();
        assert!(model.is_training());
        model.eval();
        assert!(!model.is_training());
    }

    #[test]
    fn test_predict_aligns_with_inputs() -> Result<()> {
        let model = YoloV5::from_parts(MockPredictor::new(80), &options());
        let images: Vec<_> = [(3, 48, 64), (3, 64, 32), (3, 20, 20)]
            .iter()
            .map(|&shape| Array3::<f32>::zeros(shape))
            .collect();

        let results = model.predict(&images)?;
        assert_eq!(results.len(), images.len());
        for result in &results {
            assert_eq!(result.boxes.nrows(), result.len());
            assert_eq!(result.labels.len(), result.len());
        }
        Ok(())
    }

    #[test]
    fn test_fixed_input_graph_gets_square_batches() -> Result<()> {
        let predictor = MockPredictor::new(80).with_fixed_input(64);
        let model = YoloV5::from_parts(predictor, &YoloOptions::pretrained().img_size(128));
        assert_eq!(model.transform().img_size, 64);
        assert!(!model.transform().auto);

        let images = vec![Array3::<f32>::zeros((3, 36, 128)), Array3::<f32>::zeros((3, 50, 20))];
        let results = model.predict(&images)?;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.len() == 1));

        // stride padding shrinks the wide image to 32 rows, which the fixed graph rejects
        let padded = YoloV5::from_parts(
            MockPredictor::new(80),
            &YoloOptions::pretrained().img_size(64),
        );
        assert_eq!(padded.transform().batch(&images[..1])?.0.dim(), (1, 3, 32, 64));
        assert!(model.predictor().raw_forward(Array4::<f32>::zeros((1, 3, 32, 64)).view()).is_err());
        Ok(())
    }

    #[test]
    fn test_auto_padding_option() -> Result<()> {
        let images = vec![Array3::<f32>::zeros((3, 72, 128))];
        let padded = YoloV5::from_parts(MockPredictor::new(2), &YoloOptions::pretrained().img_size(128));
        assert_eq!(padded.transform().batch(&images)?.0.dim(), (1, 3, 96, 128));

        let square = YoloV5::from_parts(
            MockPredictor::new(2),
            &YoloOptions::pretrained().img_size(128).auto(false),
        );
        assert_eq!(square.transform().batch(&images)?.0.dim(), (1, 3, 128, 128));
        Ok(())
    }

    #[test]
    fn test_non_square_fixed_input_is_rejected() {
        struct Wide;
        impl RawPredictor for Wide {
            fn raw_forward(&self, _: ArrayView4<f32>) -> Result<Vec<Array5<f32>>> {
                Ok(Vec::new())
            }
            fn num_classes(&self) -> usize {
                1
            }
            fn fixed_input_size(&self) -> Option<(usize, usize)> {
                Some((384, 640))
            }
        }
        assert!(matches!(
            check_fixed_input(&Wide),
            Err(YoloError::Configuration { .. })
        ));
        assert!(check_fixed_input(&MockPredictor::new(1).with_fixed_input(640)).is_ok());
    }

    #[test]
    fn test_predict_rejects_empty_batch() {
        let model = YoloV5::from_parts(MockPredictor::new(80), &options());
        assert!(model.predict(&[]).is_err());
    }

    #[test]
    fn test_training_forward_with_headed_backbone() -> Result<()> {
        let anchors = AnchorSet::default();
        let backbone = MockBackbone::new(vec![8, 16, 32], anchors.strides().to_vec());
        let head = DetectHead::new(12, &[8, 16, 32], &anchors, 3)?;
        let mut model = YoloV5::from_parts(HeadedBackbone::new(backbone, head)?, &options());
        model.train();

        let images = vec![Array3::<f32>::from_elem((3, 48, 64), 0.5)];
        let targets = vec![zidane_target()?];
        let losses = model
            .forward(&images, Some(targets.as_slice()))?
            .into_losses()
            .ok_or_else(|| YoloError::validation("output", "expected losses"))?;
        assert!(losses.loss_classifier.is_finite() && losses.loss_classifier >= 0.0);
        assert!(losses.loss_box_reg.is_finite() && losses.loss_box_reg >= 0.0);
        assert!(losses.loss_objectness.is_finite() && losses.loss_objectness >= 0.0);
        Ok(())
    }

    #[test]
    fn test_training_requires_matching_targets() -> Result<()> {
        let mut model = YoloV5::from_parts(MockPredictor::new(12), &options());
        model.train();
        let images = vec![Array3::<f32>::zeros((3, 32, 32))];

        assert!(model.forward(&images, None).is_err());
        assert!(model.forward(&images, Some(&[])).is_err());

        let out_of_range = Target::new(array![[0.5f32, 0.5, 0.1, 0.1]], array![12])?;
        assert!(model.forward(&images, Some(&[out_of_range])).is_err());
        Ok(())
    }

    #[test]
    fn test_headed_backbone_checks_channels() -> Result<()> {
        let anchors = AnchorSet::default();
        let backbone = MockBackbone::new(vec![8, 16, 32], anchors.strides().to_vec());
        let head = DetectHead::new(2, &[8, 16, 16], &anchors, 0)?;
        assert!(HeadedBackbone::new(backbone, head).is_err());
        Ok(())
    }

    #[test]
    fn test_options_validation_and_paths() {
        assert!(YoloOptions::with_num_classes(0).validate().is_err());
        assert!(YoloOptions::pretrained().img_size(100).validate().is_err());
        assert!(YoloOptions::pretrained().validate().is_ok());

        let options = YoloOptions::pretrained()
            .weights_dir("/models")
            .variant(Variant::M);
        assert_eq!(options.pretrained_path(), PathBuf::from("/models/yolov5m.onnx"));
        assert_eq!(
            options.backbone_path(),
            PathBuf::from("/models/yolov5m_backbone.onnx")
        );
    }

    #[test]
    fn test_factory_reports_missing_weights() {
        let dir = tempfile::TempDir::new().unwrap();
        let pretrained = yolov5s(YoloOptions::pretrained().weights_dir(dir.path()));
        assert!(matches!(pretrained, Err(YoloError::FileSystem { .. })));
        let untrained = yolov5s(YoloOptions::with_num_classes(12).weights_dir(dir.path()));
        assert!(matches!(untrained, Err(YoloError::FileSystem { .. })));
        let invalid = yolov5s(YoloOptions::with_num_classes(0).weights_dir(dir.path()));
        assert!(matches!(invalid, Err(YoloError::Configuration { .. })));
    }
}

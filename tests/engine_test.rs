use std::path::PathBuf;

use image::{Rgb, RgbImage};
use ndarray::prelude::*;
use tempfile::TempDir;

use yolort_rs::head::DetectHead;
use yolort_rs::mocks::{MockBackbone, MockPredictor};
use yolort_rs::{
    image_preprocess, yolov5s, AnchorSet, DetectionModel, HeadedBackbone, ModelOutput, Target,
    YoloOptions, YoloV5,
};

fn write_fixture(dir: &TempDir, name: &str, width: u32, height: u32) -> PathBuf {
    let path = dir.path().join(name);
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    })
    .save(&path)
    .unwrap();
    path
}

fn zidane_targets() -> Target {
    Target::new(
        array![
            [0.3790f32, 0.5487, 0.3220, 0.2047],
            [0.2680, 0.5386, 0.2200, 0.1779],
            [0.1720, 0.5403, 0.1960, 0.1409],
            [0.2240, 0.4547, 0.1520, 0.0705],
        ],
        array![7, 2, 3, 4],
    )
    .unwrap()
}

fn untrained_model(num_classes: usize) -> YoloV5<HeadedBackbone<MockBackbone>> {
    let anchors = AnchorSet::default();
    let channels = [16, 32, 64];
    let backbone = MockBackbone::new(channels.to_vec(), anchors.strides().to_vec());
    let head = DetectHead::new(num_classes, &channels, &anchors, 0).unwrap();
    YoloV5::from_parts(
        HeadedBackbone::new(backbone, head).unwrap(),
        &YoloOptions::with_num_classes(num_classes).img_size(128),
    )
}

#[test]
fn test_preprocess_fixture() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_fixture(&temp_dir, "zidane.png", 96, 54);

    let tensor = image_preprocess(&path).unwrap();
    assert_eq!(tensor.ndim(), 3);
    assert_eq!(tensor.dim(), (3, 54, 96));
    assert!(tensor.iter().all(|&v| (0.0..=1.0).contains(&v)));
}

#[test]
fn test_inference() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_fixture(&temp_dir, "zidane.png", 96, 54);
    let image = image_preprocess(&path).unwrap();

    let model = YoloV5::from_parts(MockPredictor::new(80), &YoloOptions::pretrained().img_size(128));
    assert!(!model.is_training());

    let out = model.forward(&[image], None).unwrap();
    let detections = match out {
        ModelOutput::Detections(d) => d,
        ModelOutput::Losses(_) => panic!("expected detections in inference mode"),
    };
    assert_eq!(detections.len(), 1);
    let result = &detections[0];
    assert_eq!(result.boxes.ncols(), 4);
    assert_eq!(result.boxes.nrows(), result.labels.len());
    assert_eq!(result.scores.len(), result.labels.len());
    assert!(!result.is_empty());
    for bbox in result.boxes.rows() {
        assert!(bbox[0] >= 0.0 && bbox[2] <= 96.0);
        assert!(bbox[1] >= 0.0 && bbox[3] <= 54.0);
        assert!(bbox[0] <= bbox[2] && bbox[1] <= bbox[3]);
    }
}

#[test]
fn test_inference_keeps_input_order() {
    let model = YoloV5::from_parts(MockPredictor::new(5), &YoloOptions::pretrained().img_size(64));
    let images: Vec<_> = (0..4)
        .map(|i| Array3::<f32>::from_elem((3, 40 + i * 8, 64), 0.2))
        .collect();

    let results = model.predict(&images).unwrap();
    assert_eq!(results.len(), 4);
    let labels: Vec<_> = results.iter().map(|r| r.labels[0]).collect();
    assert_eq!(labels, vec![0, 1, 2, 3]);
}

#[test]
fn test_train() {
    let mut model = untrained_model(12);
    model.train();

    let images = vec![Array3::<f32>::from_elem((3, 72, 128), 0.4)];
    let targets = vec![zidane_targets()];
    let losses = model
        .forward(&images, Some(targets.as_slice()))
        .unwrap()
        .into_losses()
        .unwrap();

    for (name, value) in losses.as_map() {
        assert!(value.is_finite(), "{} is not finite", name);
        assert!(value >= 0.0, "{} is negative", name);
    }
    assert!(losses.total() > 0.0);
}

#[test]
fn test_train_then_eval() {
    let mut model = untrained_model(3);
    let images = vec![Array3::<f32>::from_elem((3, 64, 64), 0.4); 2];
    let targets = vec![
        Target::new(array![[0.5f32, 0.5, 0.3, 0.3]], array![1]).unwrap(),
        Target::empty(),
    ];

    model.train();
    assert!(model.forward(&images, Some(targets.as_slice())).unwrap().into_losses().is_some());
    assert!(model.forward(&images, None).is_err());

    model.eval();
    let detections = model.forward(&images, None).unwrap().into_detections().unwrap();
    assert_eq!(detections.len(), 2);
}

#[test]
#[ignore = "needs exported weights under YOLORT_HOME"]
fn test_pretrained_weights() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_fixture(&temp_dir, "bus.png", 320, 240);
    let model = yolov5s(YoloOptions::pretrained()).unwrap();
    assert_eq!(model.num_classes(), 80);

    let results = model.predict(&[image_preprocess(&path).unwrap()]).unwrap();
    assert_eq!(results.len(), 1);
}

#[test]
#[ignore = "needs exported weights under YOLORT_HOME"]
fn test_untrained_head_on_pretrained_backbone() {
    let mut model = yolov5s(YoloOptions::with_num_classes(12)).unwrap();
    model.train();
    let losses = model
        .compute_loss(&[Array3::<f32>::from_elem((3, 360, 640), 0.5)], &[zidane_targets()])
        .unwrap();
    assert!(losses.total().is_finite());
}

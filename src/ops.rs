//! Box geometry, activation and suppression primitives shared by decoding and loss.

use std::cmp::Ordering;

use ndarray::prelude::*;
use num_traits::{Float, FloatConst, NumCast};

pub fn sigmoid<T: Float>(x: T) -> T {
    T::one() / (T::one() + (-x).exp())
}

/// Binary cross-entropy on a logit, written as `max(x, 0) - x*t + ln(1 + e^-|x|)`.
pub fn bce_with_logits<T: Float>(logit: T, target: T) -> T {
    logit.max(T::zero()) - logit * target + (-logit.abs()).exp().ln_1p()
}

/// `(cx, cy, w, h)` to `(x1, y1, x2, y2)`.
pub fn xywh_to_xyxy<T: Float>([cx, cy, w, h]: [T; 4]) -> [T; 4] {
    let two = T::one() + T::one();
    [cx - w / two, cy - h / two, cx + w / two, cy + h / two]
}

pub fn box_area<T: Float>(b: &[T; 4]) -> T {
    (b[2] - b[0]).max(T::zero()) * (b[3] - b[1]).max(T::zero())
}

/// IoU of two `xyxy` boxes.
pub fn box_iou<T: Float>(a: &[T; 4], b: &[T; 4]) -> T {
    let w = (a[2].min(b[2]) - a[0].max(b[0])).max(T::zero());
    let h = (a[3].min(b[3]) - a[1].max(b[1])).max(T::zero());
    let inter = w * h;
    let union = box_area(a) + box_area(b) - inter;
    if union > T::zero() {
        inter / union
    } else {
        T::zero()
    }
}

/// Complete IoU of two `xywh` boxes.
pub fn bbox_ciou<T: Float + FloatConst>(box1: [T; 4], box2: [T; 4]) -> T {
    let eps = <T as NumCast>::from(1e-7).unwrap_or_else(T::epsilon);
    let four = <T as NumCast>::from(4.0).unwrap_or_else(T::one);
    let [b1_x1, b1_y1, b1_x2, b1_y2] = xywh_to_xyxy(box1);
    let [b2_x1, b2_y1, b2_x2, b2_y2] = xywh_to_xyxy(box2);
    let (w1, h1) = (box1[2], box1[3] + eps);
    let (w2, h2) = (box2[2], box2[3] + eps);

    let inter = (b1_x2.min(b2_x2) - b1_x1.max(b2_x1)).max(T::zero())
        * (b1_y2.min(b2_y2) - b1_y1.max(b2_y1)).max(T::zero());
    let union = w1 * h1 + w2 * h2 - inter + eps;
    let iou = inter / union;

    // smallest enclosing box
    let cw = b1_x2.max(b2_x2) - b1_x1.min(b2_x1);
    let ch = b1_y2.max(b2_y2) - b1_y1.min(b2_y1);
    let c2 = cw * cw + ch * ch + eps;
    let dx = b2_x1 + b2_x2 - b1_x1 - b1_x2;
    let dy = b2_y1 + b2_y2 - b1_y1 - b1_y2;
    let rho2 = (dx * dx + dy * dy) / four;

    let angle = (w2 / h2).atan() - (w1 / h1).atan();
    let v = four / (T::PI() * T::PI()) * angle * angle;
    let alpha = v / (v - iou + (T::one() + eps));
    iou - (rho2 / c2 + v * alpha)
}

/// Greedy non-maximum suppression over `xyxy` boxes.
///
/// Returns the kept indices ordered by decreasing score.
pub fn nms(boxes: ArrayView2<f32>, scores: ArrayView1<f32>, iou_threshold: f32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(Ordering::Equal)
    });

    let rows: Vec<[f32; 4]> = boxes
        .rows()
        .into_iter()
        .map(|r| [r[0], r[1], r[2], r[3]])
        .collect();
    let mut suppressed = vec![false; order.len()];
    let mut keep = Vec::new();

    for (pos, &i) in order.iter().enumerate() {
        if suppressed[pos] {
            continue;
        }
        keep.push(i);
        for (offset, &j) in order[pos + 1..].iter().enumerate() {
            let other = pos + 1 + offset;
            if !suppressed[other] && box_iou(&rows[i], &rows[j]) > iou_threshold {
                suppressed[other] = true;
            }
        }
    }

    keep
}

/// Class-aware NMS: boxes with different labels never suppress each other.
///
/// Every class is shifted by a disjoint coordinate offset before a single NMS pass.
pub fn batched_nms(
    boxes: ArrayView2<f32>,
    scores: ArrayView1<f32>,
    labels: ArrayView1<i64>,
    iou_threshold: f32,
) -> Vec<usize> {
    if boxes.nrows() == 0 {
        return Vec::new();
    }
    let max_coordinate = boxes.iter().fold(f32::MIN, |a, b| a.max(*b));
    let mut shifted = boxes.to_owned();
    for (mut row, &label) in shifted.rows_mut().into_iter().zip(labels.iter()) {
        let offset = label as f32 * (max_coordinate + 1.0);
        row.mapv_inplace(|v| v + offset);
    }
    nms(shifted.view(), scores, iou_threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn test_sigmoid_and_bce() {
        assert!(close(sigmoid(0.0f32), 0.5));
        assert!(close(bce_with_logits(0.0f32, 1.0), std::f32::consts::LN_2));
        // large logits stay finite
        assert!(bce_with_logits(100.0f32, 0.0).is_finite());
        assert!(close(bce_with_logits(100.0f32, 1.0), 0.0));
        let x = 0.3f32;
        let expected = -(sigmoid(x).ln() * 0.7 + (1.0 - sigmoid(x)).ln() * 0.3);
        assert!(close(bce_with_logits(x, 0.7), expected));
    }

    #[test]
    fn test_box_iou() {
        let a = [0.0f32, 0.0, 2.0, 2.0];
        let b = [1.0f32, 1.0, 3.0, 3.0];
        assert!(close(box_iou(&a, &b), 1.0 / 7.0));
        assert!(close(box_iou(&a, &a), 1.0));
        assert_eq!(box_iou(&a, &[5.0, 5.0, 6.0, 6.0]), 0.0);
    }

    #[test]
    fn test_ciou_identical_boxes() {
        let b = [5.0f32, 5.0, 2.0, 4.0];
        assert!((bbox_ciou(b, b) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_ciou_penalises_distance() {
        let a = [0.0f64, 0.0, 2.0, 2.0];
        let near = [0.5f64, 0.0, 2.0, 2.0];
        let far = [10.0f64, 0.0, 2.0, 2.0];
        let ciou_near = bbox_ciou(a, near);
        let ciou_far = bbox_ciou(a, far);
        assert!(ciou_near < 1.0 && ciou_near > 0.0);
        // disjoint boxes go negative through the centre distance term
        assert!(ciou_far < 0.0);
        assert!(ciou_far >= -1.0);
    }

    #[test]
    fn test_nms_suppresses_overlaps() {
        let boxes = array![
            [0.0f32, 0.0, 10.0, 10.0],
            [1.0, 1.0, 11.0, 11.0],
            [20.0, 20.0, 30.0, 30.0],
        ];
        let scores = array![0.8f32, 0.9, 0.7];
        assert_eq!(nms(boxes.view(), scores.view(), 0.5), vec![1, 2]);
        assert_eq!(nms(boxes.view(), scores.view(), 0.9), vec![1, 0, 2]);
    }

    #[test]
    fn test_batched_nms_respects_labels() {
        let boxes = array![[0.0f32, 0.0, 10.0, 10.0], [1.0, 1.0, 11.0, 11.0]];
        let scores = array![0.8f32, 0.9];
        let same = array![3i64, 3];
        let different = array![3i64, 4];
        assert_eq!(batched_nms(boxes.view(), scores.view(), same.view(), 0.5), vec![1]);
        assert_eq!(
            batched_nms(boxes.view(), scores.view(), different.view(), 0.5),
            vec![1, 0]
        );
        let empty = Array2::<f32>::zeros((0, 4));
        let no_scores = Array1::<f32>::zeros(0);
        let no_labels = Array1::<i64>::zeros(0);
        assert!(batched_nms(empty.view(), no_scores.view(), no_labels.view(), 0.5).is_empty());
    }
}

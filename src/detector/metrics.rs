//! Detection accuracy at a fixed IoU threshold.
//!
//! Predictions are matched greedily by descending score to the unmatched
//! ground-truth box of the same class with the highest IoU. Average precision
//! uses the all-point interpolated precision envelope.

use std::fmt;

use super::{BoxAnnotation, Detection};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchCounts {
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
}

impl MatchCounts {
    pub fn precision(&self) -> f32 {
        let predicted = self.true_positives + self.false_positives;
        if predicted == 0 {
            0.0
        } else {
            self.true_positives as f32 / predicted as f32
        }
    }

    pub fn recall(&self) -> f32 {
        let actual = self.true_positives + self.false_negatives;
        if actual == 0 {
            0.0
        } else {
            self.true_positives as f32 / actual as f32
        }
    }
}

/// Match one image's predictions against its ground truth.
///
/// Returns the counts and `(score, is_true_positive)` for every prediction.
pub fn match_detections(
    predictions: &[Detection],
    truth: &[BoxAnnotation],
    iou_threshold: f32,
) -> (MatchCounts, Vec<(f32, bool)>) {
    let mut order: Vec<&Detection> = predictions.iter().collect();
    order.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut matched = vec![false; truth.len()];
    let mut scored = Vec::with_capacity(order.len());
    let mut counts = MatchCounts::default();
    for pred in order {
        let best = truth
            .iter()
            .enumerate()
            .filter(|(i, t)| !matched[*i] && t.class == pred.bbox.class)
            .map(|(i, t)| (i, t.iou(&pred.bbox)))
            .filter(|(_, iou)| *iou >= iou_threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1));
        match best {
            Some((i, _)) => {
                matched[i] = true;
                counts.true_positives += 1;
                scored.push((pred.score, true));
            }
            None => {
                counts.false_positives += 1;
                scored.push((pred.score, false));
            }
        }
    }
    counts.false_negatives = matched.iter().filter(|m| !**m).count();
    (counts, scored)
}

/// All-point interpolated average precision.
pub fn average_precision(scored: &[(f32, bool)], ground_truth: usize) -> f32 {
    if ground_truth == 0 || scored.is_empty() {
        return 0.0;
    }
    let mut sorted = scored.to_vec();
    sorted.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut tp = 0usize;
    let mut points = Vec::with_capacity(sorted.len());
    for (i, (_, hit)) in sorted.iter().enumerate() {
        if *hit {
            tp += 1;
        }
        points.push((tp as f32 / ground_truth as f32, tp as f32 / (i + 1) as f32));
    }
    // precision envelope, right to left
    for i in (0..points.len().saturating_sub(1)).rev() {
        points[i].1 = points[i].1.max(points[i + 1].1);
    }
    let mut ap = 0.0;
    let mut last_recall = 0.0;
    for (recall, precision) in points {
        ap += (recall - last_recall) * precision;
        last_recall = recall;
    }
    ap
}

/// Accumulates matches over a validation run.
#[derive(Debug, Clone)]
pub struct DetectionMetrics {
    iou_threshold: f32,
    counts: MatchCounts,
    scored: Vec<(f32, bool)>,
    ground_truth: usize,
    images: usize,
}

impl DetectionMetrics {
    pub fn new(iou_threshold: f32) -> Self {
        Self {
            iou_threshold,
            counts: MatchCounts::default(),
            scored: Vec::new(),
            ground_truth: 0,
            images: 0,
        }
    }

    pub fn update(&mut self, predictions: &[Detection], truth: &[BoxAnnotation]) {
        let (counts, scored) = match_detections(predictions, truth, self.iou_threshold);
        self.counts.true_positives += counts.true_positives;
        self.counts.false_positives += counts.false_positives;
        self.counts.false_negatives += counts.false_negatives;
        self.scored.extend(scored);
        self.ground_truth += truth.len();
        self.images += 1;
    }

    pub fn counts(&self) -> MatchCounts {
        self.counts
    }

    pub fn images(&self) -> usize {
        self.images
    }

    pub fn precision(&self) -> f32 {
        self.counts.precision()
    }

    pub fn recall(&self) -> f32 {
        self.counts.recall()
    }

    pub fn average_precision(&self) -> f32 {
        average_precision(&self.scored, self.ground_truth)
    }
}

impl fmt::Display for DetectionMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "images={} P={:.3} R={:.3} AP@{:.2}={:.3}",
            self.images,
            self.precision(),
            self.recall(),
            self.iou_threshold,
            self.average_precision()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gt(class: usize, cx: f32) -> BoxAnnotation {
        BoxAnnotation { class, cx, cy: 0.5, w: 0.2, h: 0.2 }
    }

    fn det(class: usize, cx: f32, score: f32) -> Detection {
        Detection { bbox: gt(class, cx), score }
    }

    #[test]
    fn test_matching_respects_class_and_uniqueness() {
        let truth = [gt(0, 0.2), gt(1, 0.7)];
        let preds = [det(0, 0.2, 0.9), det(0, 0.21, 0.8), det(0, 0.7, 0.7)];
        let (counts, scored) = match_detections(&preds, &truth, 0.5);
        assert_eq!(counts, MatchCounts { true_positives: 1, false_positives: 2, false_negatives: 1 });
        assert_eq!(scored, vec![(0.9, true), (0.8, false), (0.7, false)]);
        assert!((counts.precision() - 1.0 / 3.0).abs() < 1e-6);
        assert!((counts.recall() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_average_precision() {
        assert_eq!(average_precision(&[(0.9, true), (0.8, true)], 2), 1.0);
        // hit, miss, hit over two objects: 0.5 * 1 + 0.5 * 2/3
        let ap = average_precision(&[(0.9, true), (0.8, false), (0.7, true)], 2);
        assert!((ap - (0.5 + 1.0 / 3.0)).abs() < 1e-6);
        assert_eq!(average_precision(&[], 3), 0.0);
        assert_eq!(average_precision(&[(0.5, false)], 0), 0.0);
    }

    #[test]
    fn test_metrics_accumulate_over_images() {
        let mut m = DetectionMetrics::new(0.5);
        m.update(&[det(0, 0.5, 0.9)], &[gt(0, 0.5)]);
        m.update(&[], &[gt(0, 0.3)]);
        assert_eq!(m.images(), 2);
        assert_eq!(m.counts().false_negatives, 1);
        assert!((m.recall() - 0.5).abs() < 1e-6);
        assert_eq!(m.precision(), 1.0);
        assert!((m.average_precision() - 0.5).abs() < 1e-6);
    }
}

use crate::{
    common::*,
    decode::DetectionTable,
    label::GroundTruth,
};
use bbox::Tlbr;

/// One point of a precision/recall curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecRec {
    pub precision: R64,
    pub recall: R64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegralMethod {
    /// Average precision over evenly spaced recall points.
    Interpolation(usize),
    /// The classic VOC 11-point variant.
    ElevenPoint,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApCalculatorInit {
    pub integral_method: IntegralMethod,
    /// Overlap a detection needs with an unclaimed ground truth to
    /// count as a true positive.
    pub iou_thresh: R64,
}

impl Default for ApCalculatorInit {
    fn default() -> Self {
        Self {
            integral_method: IntegralMethod::Interpolation(101),
            iou_thresh: r64(0.5),
        }
    }
}

impl ApCalculatorInit {
    pub fn build(self) -> Result<ApCalculator> {
        let Self {
            integral_method,
            iou_thresh,
        } = self;

        if let IntegralMethod::Interpolation(n_points) = integral_method {
            ensure!(
                n_points >= 2,
                "invalid number of interpolated points {}",
                n_points
            );
        }
        ensure!(
            iou_thresh > 0.0 && iou_thresh <= 1.0,
            "iou_thresh must be in (0, 1]"
        );

        Ok(ApCalculator {
            integral_method,
            iou_thresh,
        })
    }
}

/// Per-class average precision and mean AP over a detection table.
#[derive(Debug, Clone)]
pub struct ApCalculator {
    integral_method: IntegralMethod,
    iou_thresh: R64,
}

/// Per-class AP (None when a class has neither ground truth nor
/// detections) and the mean over the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct ApReport {
    pub per_class: Vec<Option<R64>>,
    pub mean_ap: R64,
}

impl ApCalculator {
    /// Compute average precision from a precision/recall curve ordered
    /// by non-decreasing recall.
    pub fn compute_by_prec_rec(&self, sorted_prec_rec: &[PrecRec]) -> R64 {
        if sorted_prec_rec.is_empty() {
            return r64(0.0);
        }

        // precision envelope: each point takes the best precision
        // achieved at its recall or beyond
        let mut enveloped = sorted_prec_rec.to_vec();
        let mut max_precision = r64(0.0);
        for entry in enveloped.iter_mut().rev() {
            max_precision = max_precision.max(entry.precision);
            entry.precision = max_precision;
        }

        let stepwise = |recall: R64| -> R64 {
            enveloped
                .iter()
                .find(|entry| entry.recall >= recall)
                .map(|entry| entry.precision)
                .unwrap_or_else(|| r64(0.0))
        };

        match self.integral_method {
            IntegralMethod::Interpolation(n_points) => {
                let sum: R64 = (0..n_points)
                    .map(|index| stepwise(r64(index as f64 / (n_points - 1) as f64)))
                    .sum();
                sum / r64(n_points as f64)
            }
            IntegralMethod::ElevenPoint => {
                let sum: R64 = (0..=10).map(|index| stepwise(r64(index as f64 / 10.0))).sum();
                sum / r64(11.0)
            }
        }
    }

    /// AP for one class from score-ranked detections and per-image
    /// ground-truth boxes. `None` when the class has neither.
    pub fn compute_class_ap(
        &self,
        detections: &[(usize, R64, Tlbr<f32>)],
        ground_truth: &HashMap<usize, Vec<Tlbr<f32>>>,
    ) -> Option<R64> {
        let num_ground_truth: usize = ground_truth.values().map(Vec::len).sum();
        if num_ground_truth == 0 && detections.is_empty() {
            return None;
        }
        if num_ground_truth == 0 {
            // every detection is a false positive
            return Some(r64(0.0));
        }

        let mut detections = detections.to_vec();
        detections.sort_by_key(|&(_, score, _)| -score);

        // greedy matching: a detection claims the best-overlapping
        // unclaimed ground truth of its image
        let mut claimed: HashMap<usize, Vec<bool>> = ground_truth
            .iter()
            .map(|(&image, rects)| (image, vec![false; rects.len()]))
            .collect();

        let mut true_positives = 0usize;
        let mut false_positives = 0usize;
        let mut prec_rec = Vec::with_capacity(detections.len());

        for (image, _score, rect) in detections {
            let matched = ground_truth.get(&image).and_then(|rects| {
                let flags = claimed.get_mut(&image).expect("maps share keys");
                let best = rects
                    .iter()
                    .enumerate()
                    .filter(|(ix, _)| !flags[*ix])
                    .map(|(ix, gt_rect)| (ix, r64(rect.iou_with(gt_rect) as f64)))
                    .max_by(|(_, lhs), (_, rhs)| lhs.cmp(rhs));
                match best {
                    Some((ix, iou)) if iou >= self.iou_thresh => {
                        flags[ix] = true;
                        Some(())
                    }
                    _ => None,
                }
            });

            match matched {
                Some(()) => true_positives += 1,
                None => false_positives += 1,
            }

            prec_rec.push(PrecRec {
                precision: r64(true_positives as f64)
                    / r64((true_positives + false_positives) as f64),
                recall: r64(true_positives as f64) / r64(num_ground_truth as f64),
            });
        }

        Some(self.compute_by_prec_rec(&prec_rec))
    }

    /// Evaluate a full detection table against per-image ground truth.
    pub fn evaluate(
        &self,
        table: &DetectionTable,
        ground_truth: &[Vec<GroundTruth>],
        num_classes: usize,
    ) -> ApReport {
        let mut per_class: Vec<Option<R64>> = vec![None; num_classes];

        for class in 1..num_classes {
            let detections: Vec<(usize, R64, Tlbr<f32>)> = table
                .detections_for_class(class)
                .map(|(image, detection)| (image, detection.score, detection.rect))
                .collect();

            let class_truth: HashMap<usize, Vec<Tlbr<f32>>> = ground_truth
                .iter()
                .enumerate()
                .filter_map(|(image, truths)| {
                    let rects: Vec<Tlbr<f32>> = truths
                        .iter()
                        .filter(|gt| gt.class == class)
                        .map(|gt| gt.rect)
                        .collect();
                    (!rects.is_empty()).then(|| (image, rects))
                })
                .collect();

            per_class[class] = self.compute_class_ap(&detections, &class_truth);
        }

        let evaluated: Vec<R64> = per_class.iter().flatten().copied().collect();
        let mean_ap = if evaluated.is_empty() {
            r64(0.0)
        } else {
            evaluated.iter().copied().sum::<R64>() / r64(evaluated.len() as f64)
        };

        ApReport {
            per_class,
            mean_ap,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(t: f32, l: f32, b: f32, r: f32) -> Tlbr<f32> {
        Tlbr::try_new(t, l, b, r).unwrap()
    }

    #[test]
    fn single_correct_detection_scores_full_ap() {
        let calculator = ApCalculatorInit::default().build().unwrap();
        let detections = vec![(0, r64(0.9), rect(10.0, 10.0, 50.0, 50.0))];
        let truth: HashMap<_, _> =
            [(0, vec![rect(10.0, 10.0, 50.0, 50.0)])].into_iter().collect();

        let ap = calculator.compute_class_ap(&detections, &truth).unwrap();
        assert_eq!(ap, r64(1.0));
    }

    #[test]
    fn confident_false_positive_lowers_ap() {
        let calculator = ApCalculatorInit::default().build().unwrap();
        let detections = vec![
            // false positive ranked above the true positive
            (0, r64(0.95), rect(200.0, 200.0, 220.0, 220.0)),
            (0, r64(0.80), rect(10.0, 10.0, 50.0, 50.0)),
        ];
        let truth: HashMap<_, _> =
            [(0, vec![rect(10.0, 10.0, 50.0, 50.0)])].into_iter().collect();

        let ap = calculator.compute_class_ap(&detections, &truth).unwrap();
        assert!(ap < r64(1.0));
        assert!(ap > r64(0.0));
    }

    #[test]
    fn each_ground_truth_matches_at_most_once() {
        let calculator = ApCalculatorInit::default().build().unwrap();
        // two detections on the same ground truth: one TP, one FP
        let detections = vec![
            (0, r64(0.9), rect(10.0, 10.0, 50.0, 50.0)),
            (0, r64(0.8), rect(10.0, 10.0, 50.0, 50.0)),
        ];
        let truth: HashMap<_, _> =
            [(0, vec![rect(10.0, 10.0, 50.0, 50.0)])].into_iter().collect();

        let ap = calculator.compute_class_ap(&detections, &truth).unwrap();
        // recall reaches 1.0 at precision 1.0 before the duplicate
        assert_eq!(ap, r64(1.0));
    }

    #[test]
    fn no_truth_and_no_detections_is_skipped() {
        let calculator = ApCalculatorInit::default().build().unwrap();
        assert_eq!(calculator.compute_class_ap(&[], &HashMap::new()), None);
    }

    #[test]
    fn detections_without_truth_score_zero() {
        let calculator = ApCalculatorInit::default().build().unwrap();
        let detections = vec![(0, r64(0.9), rect(10.0, 10.0, 50.0, 50.0))];
        assert_eq!(
            calculator.compute_class_ap(&detections, &HashMap::new()),
            Some(r64(0.0))
        );
    }

    #[test]
    fn eleven_point_variant_matches_perfect_curve() {
        let calculator = ApCalculatorInit {
            integral_method: IntegralMethod::ElevenPoint,
            ..Default::default()
        }
        .build()
        .unwrap();
        let curve = vec![PrecRec {
            precision: r64(1.0),
            recall: r64(1.0),
        }];
        assert_eq!(calculator.compute_by_prec_rec(&curve), r64(1.0));
    }

    #[test]
    fn mean_ap_averages_evaluated_classes() {
        use crate::decode::{Detection, DetectionTable};
        use crate::label::GroundTruth;

        let calculator = ApCalculatorInit::default().build().unwrap();
        let mut table = DetectionTable::new();
        table.insert(
            1,
            0,
            vec![Detection {
                class: 1,
                score: r64(0.9),
                rect: rect(10.0, 10.0, 50.0, 50.0),
            }],
        );

        let truth = vec![vec![
            GroundTruth::try_new(rect(10.0, 10.0, 50.0, 50.0), 1).unwrap(),
            GroundTruth::try_new(rect(100.0, 100.0, 150.0, 150.0), 2).unwrap(),
        ]];

        let report = calculator.evaluate(&table, &truth, 4);
        // class 1 is perfect, class 2 is all misses, class 3 has nothing
        assert_eq!(report.per_class[1], Some(r64(1.0)));
        assert_eq!(report.per_class[2], Some(r64(0.0)));
        assert_eq!(report.per_class[3], None);
        assert_eq!(report.mean_ap, r64(0.5));
    }
}

use crate::{common::*, label::GroundTruth};
use bbox::{CyCxHw, Tlbr};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatcherInit {
    pub overlap_thresh: f32,
}

impl Default for MatcherInit {
    fn default() -> Self {
        Self {
            overlap_thresh: 0.5,
        }
    }
}

impl MatcherInit {
    pub fn build(self) -> Result<Matcher> {
        let Self { overlap_thresh } = self;
        ensure!(
            overlap_thresh > 0.0 && overlap_thresh <= 1.0,
            "overlap_thresh must be in (0, 1], got {}",
            overlap_thresh
        );
        Ok(Matcher { overlap_thresh })
    }
}

/// Per-anchor assignment outcome for one image.
///
/// `assigned[anchor]` is the matched ground-truth index or `None` for
/// background; `overlap[anchor]` is the IoU with the assigned ground
/// truth (the best overlap for background anchors).
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub assigned: Vec<Option<usize>>,
    pub overlap: Vec<f32>,
}

impl MatchResult {
    pub fn num_anchors(&self) -> usize {
        self.assigned.len()
    }

    pub fn num_positives(&self) -> usize {
        self.assigned.iter().flatten().count()
    }

    pub fn positive_indexes(&self) -> Vec<usize> {
        self.assigned
            .iter()
            .enumerate()
            .filter_map(|(anchor, assigned)| assigned.map(|_| anchor))
            .collect()
    }
}

/// Assigns each anchor to a ground-truth instance or to background.
#[derive(Debug, Clone)]
pub struct Matcher {
    overlap_thresh: f32,
}

impl Matcher {
    pub fn overlap_thresh(&self) -> f32 {
        self.overlap_thresh
    }

    /// Two-pass assignment: a threshold pass matching every anchor to
    /// its best-overlapping ground truth, then a bipartite pass that
    /// force-assigns each ground truth's single best anchor so that no
    /// instance is left unmatched. The forced assignment wins conflicts.
    pub fn match_anchors(
        &self,
        anchors: &[CyCxHw<f32>],
        ground_truth: &[GroundTruth],
    ) -> MatchResult {
        let num_anchors = anchors.len();

        if ground_truth.is_empty() {
            return MatchResult {
                assigned: vec![None; num_anchors],
                overlap: vec![0.0; num_anchors],
            };
        }

        let anchor_rects: Vec<Tlbr<f32>> =
            anchors.iter().map(|anchor| anchor.to_tlbr()).collect();
        let iou: Vec<Vec<f32>> = ground_truth
            .iter()
            .map(|gt| {
                anchor_rects
                    .iter()
                    .map(|rect| gt.rect.iou_with(rect))
                    .collect()
            })
            .collect();

        // threshold pass
        let mut assigned = vec![None; num_anchors];
        let mut overlap = vec![0.0; num_anchors];
        for anchor in 0..num_anchors {
            let (best_gt, best_iou) = (0..ground_truth.len())
                .map(|gt| (gt, iou[gt][anchor]))
                .max_by(|(_, lhs), (_, rhs)| lhs.partial_cmp(rhs).unwrap_or(Ordering::Equal))
                .expect("ground truth is non-empty");
            overlap[anchor] = best_iou;
            if best_iou >= self.overlap_thresh {
                assigned[anchor] = Some(best_gt);
            }
        }

        // bipartite pass; overrides the threshold pass on conflict
        for (gt, row) in iou.iter().enumerate() {
            let (best_anchor, best_iou) = row
                .iter()
                .copied()
                .enumerate()
                .max_by(|(_, lhs), (_, rhs)| lhs.partial_cmp(rhs).unwrap_or(Ordering::Equal))
                .expect("anchor set is non-empty");
            assigned[best_anchor] = Some(gt);
            overlap[best_anchor] = best_iou;
        }

        MatchResult { assigned, overlap }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn anchor(cy: f32, cx: f32, h: f32, w: f32) -> CyCxHw<f32> {
        CyCxHw::try_new(cy, cx, h, w).unwrap()
    }

    fn gt(t: f32, l: f32, b: f32, r: f32, class: usize) -> GroundTruth {
        GroundTruth::try_new(Tlbr::try_new(t, l, b, r).unwrap(), class).unwrap()
    }

    #[test]
    fn zero_ground_truth_is_all_background() {
        let matcher = MatcherInit::default().build().unwrap();
        let anchors = vec![anchor(0.5, 0.5, 0.2, 0.2), anchor(0.2, 0.2, 0.1, 0.1)];
        let result = matcher.match_anchors(&anchors, &[]);
        assert!(result.assigned.iter().all(Option::is_none));
        assert_eq!(result.num_positives(), 0);
    }

    #[test]
    fn overlapping_anchor_is_assigned() {
        let matcher = MatcherInit::default().build().unwrap();
        let anchors = vec![
            anchor(0.5, 0.5, 0.2, 0.2),
            anchor(0.1, 0.1, 0.05, 0.05),
            anchor(0.9, 0.9, 0.05, 0.05),
        ];
        let truth = vec![gt(0.4, 0.4, 0.6, 0.6, 3)];
        let result = matcher.match_anchors(&anchors, &truth);

        assert_eq!(result.assigned[0], Some(0));
        assert_eq!(result.assigned[1], None);
        assert_eq!(result.assigned[2], None);
        assert_abs_diff_eq!(result.overlap[0], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn every_ground_truth_gets_an_anchor() {
        // both boxes overlap every anchor poorly, below the threshold
        let matcher = MatcherInit {
            overlap_thresh: 0.5,
        }
        .build()
        .unwrap();
        let anchors = vec![
            anchor(0.25, 0.25, 0.4, 0.4),
            anchor(0.75, 0.75, 0.4, 0.4),
        ];
        let truth = vec![gt(0.0, 0.0, 0.2, 0.2, 1), gt(0.8, 0.8, 1.0, 1.0, 2)];
        let result = matcher.match_anchors(&anchors, &truth);

        for gt_index in 0..truth.len() {
            assert!(
                result.assigned.contains(&Some(gt_index)),
                "ground truth {} left unmatched",
                gt_index
            );
        }
    }

    #[test]
    fn no_anchor_is_both_background_and_assigned() {
        let matcher = MatcherInit::default().build().unwrap();
        let anchors: Vec<_> = (0..10)
            .map(|ix| anchor(0.05 + ix as f32 * 0.1, 0.5, 0.15, 0.15))
            .collect();
        let truth = vec![gt(0.4, 0.4, 0.6, 0.6, 1)];
        let result = matcher.match_anchors(&anchors, &truth);
        assert_eq!(result.assigned.len(), anchors.len());
        let positives = result.num_positives();
        let background = result.assigned.iter().filter(|slot| slot.is_none()).count();
        assert_eq!(positives + background, anchors.len());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        assert!(MatcherInit {
            overlap_thresh: 0.0
        }
        .build()
        .is_err());
        assert!(MatcherInit {
            overlap_thresh: 1.5
        }
        .build()
        .is_err());
    }
}

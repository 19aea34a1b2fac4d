use super::{
    misc::{LossOutput, RefineLossOutput},
    multibox::{MultiBoxLoss, MultiBoxLossInit},
};
use crate::{
    common::*,
    label::GroundTruth,
    prediction::{softmax_rows, RefineOutput},
};
use bbox::{BoxTransform, CyCxHw};

#[derive(Debug, Clone, PartialEq)]
pub struct RefineMultiBoxLossInit {
    /// Number of ODM confidence columns, background included. The ARM
    /// head is always binary (background vs. object).
    pub num_classes: usize,
    pub arm_overlap_thresh: f32,
    pub odm_overlap_thresh: f32,
    pub neg_pos_ratio: usize,
    /// Ceiling on the ARM background probability; anchors above it are
    /// dropped before ODM matching.
    pub neg_anchor_thresh: f32,
    pub transform: BoxTransform<f32>,
}

impl RefineMultiBoxLossInit {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            arm_overlap_thresh: 0.5,
            odm_overlap_thresh: 0.5,
            neg_pos_ratio: 3,
            neg_anchor_thresh: 0.99,
            transform: BoxTransform::default(),
        }
    }

    pub fn build(self) -> Result<RefineMultiBoxLoss> {
        let Self {
            num_classes,
            arm_overlap_thresh,
            odm_overlap_thresh,
            neg_pos_ratio,
            neg_anchor_thresh,
            transform,
        } = self;

        ensure!(
            neg_anchor_thresh > 0.0 && neg_anchor_thresh <= 1.0,
            "neg_anchor_thresh must be in (0, 1], got {}",
            neg_anchor_thresh
        );
        let arm = MultiBoxLossInit {
            num_classes: 2,
            overlap_thresh: arm_overlap_thresh,
            neg_pos_ratio,
            transform,
        }
        .build()?;
        let odm = MultiBoxLossInit {
            num_classes,
            overlap_thresh: odm_overlap_thresh,
            neg_pos_ratio,
            transform,
        }
        .build()?;

        Ok(RefineMultiBoxLoss {
            arm,
            odm,
            transform,
            neg_anchor_thresh,
        })
    }
}

/// Two-stage matching/loss: an ARM objectness pass over the original
/// anchors, then an ODM multi-class pass over the ARM-refined anchors
/// that survive the negative-anchor filter.
///
/// The filter runs before ODM matching; the ODM pass never sees a
/// dropped anchor.
#[derive(Debug, Clone)]
pub struct RefineMultiBoxLoss {
    arm: MultiBoxLoss,
    odm: MultiBoxLoss,
    transform: BoxTransform<f32>,
    neg_anchor_thresh: f32,
}

impl RefineMultiBoxLoss {
    pub fn num_classes(&self) -> usize {
        self.odm.num_classes()
    }

    pub fn transform(&self) -> &BoxTransform<f32> {
        &self.transform
    }

    /// Loss terms for one image.
    pub fn forward(
        &self,
        prediction: &RefineOutput,
        anchors: &[CyCxHw<f32>],
        ground_truth: &[GroundTruth],
    ) -> Result<RefineLossOutput> {
        prediction.arm.validate(anchors.len(), 2)?;
        prediction.odm.validate(anchors.len(), self.odm.num_classes())?;

        // ARM: binary objectness over the original anchors
        let binary_truth: Vec<GroundTruth> = ground_truth
            .iter()
            .map(|gt| GroundTruth {
                rect: gt.rect,
                class: 1,
            })
            .collect();
        let arm = self.arm.forward(&prediction.arm, anchors, &binary_truth)?;

        // refinement and the negative-anchor filter, then ODM matching
        let refined = refine_anchors(&self.transform, &prediction.arm.loc.view(), anchors);
        let survivors =
            filter_negative_anchors(&prediction.arm.conf.view(), self.neg_anchor_thresh);

        let odm = if survivors.is_empty() {
            debug!("no anchors survived the negative-anchor filter");
            LossOutput::default()
        } else {
            let odm_prediction = prediction.odm.select_rows(&survivors);
            let odm_anchors: Vec<CyCxHw<f32>> =
                survivors.iter().map(|&ix| refined[ix]).collect();
            self.odm
                .forward(&odm_prediction, &odm_anchors, ground_truth)?
        };

        Ok(RefineLossOutput { arm, odm })
    }

    /// Sum of per-image losses over one batch.
    pub fn forward_batch(
        &self,
        predictions: &[RefineOutput],
        anchors: &[CyCxHw<f32>],
        targets: &[Vec<GroundTruth>],
    ) -> Result<RefineLossOutput> {
        ensure!(
            predictions.len() == targets.len(),
            "batch has {} predictions but {} target lists",
            predictions.len(),
            targets.len()
        );
        predictions
            .iter()
            .zip(targets.iter())
            .map(|(prediction, ground_truth)| self.forward(prediction, anchors, ground_truth))
            .sum()
    }
}

/// Apply ARM offsets to the original anchors.
pub fn refine_anchors(
    transform: &BoxTransform<f32>,
    arm_loc: &ArrayView2<f32>,
    anchors: &[CyCxHw<f32>],
) -> Vec<CyCxHw<f32>> {
    debug_assert_eq!(arm_loc.nrows(), anchors.len());
    arm_loc
        .rows()
        .into_iter()
        .zip(anchors.iter())
        .map(|(row, anchor)| transform.decode([row[0], row[1], row[2], row[3]], anchor))
        .collect()
}

/// Indexes of anchors whose ARM background probability does not exceed
/// the ceiling, in anchor order.
pub fn filter_negative_anchors(arm_conf: &ArrayView2<f32>, neg_anchor_thresh: f32) -> Vec<usize> {
    let probs = softmax_rows(arm_conf);
    probs
        .rows()
        .into_iter()
        .enumerate()
        .filter_map(|(anchor, row)| (row[0] <= neg_anchor_thresh).then(|| anchor))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prediction::HeadOutput;
    use approx::assert_abs_diff_eq;
    use bbox::Tlbr;

    fn anchors() -> Vec<CyCxHw<f32>> {
        vec![
            CyCxHw::try_new(0.5, 0.5, 0.2, 0.2).unwrap(),
            CyCxHw::try_new(0.1, 0.1, 0.1, 0.1).unwrap(),
            CyCxHw::try_new(0.9, 0.9, 0.1, 0.1).unwrap(),
        ]
    }

    fn single_gt() -> Vec<GroundTruth> {
        vec![GroundTruth::try_new(
            Tlbr::try_new(0.4, 0.4, 0.6, 0.6).unwrap(),
            2,
        )
        .unwrap()]
    }

    fn zero_refine_prediction(num_anchors: usize, num_classes: usize) -> RefineOutput {
        RefineOutput {
            arm: HeadOutput {
                loc: Array2::zeros((num_anchors, 4)),
                conf: Array2::zeros((num_anchors, 2)),
            },
            odm: HeadOutput {
                loc: Array2::zeros((num_anchors, 4)),
                conf: Array2::zeros((num_anchors, num_classes)),
            },
        }
    }

    #[test]
    fn zero_arm_offsets_leave_anchors_unchanged() {
        let transform = BoxTransform::default();
        let anchors = anchors();
        let arm_loc = Array2::<f32>::zeros((anchors.len(), 4));
        let refined = refine_anchors(&transform, &arm_loc.view(), &anchors);
        for (refined, original) in refined.iter().zip(&anchors) {
            assert_abs_diff_eq!(refined.cy(), original.cy(), epsilon = 1e-6);
            assert_abs_diff_eq!(refined.cx(), original.cx(), epsilon = 1e-6);
            assert_abs_diff_eq!(refined.h(), original.h(), epsilon = 1e-6);
            assert_abs_diff_eq!(refined.w(), original.w(), epsilon = 1e-6);
        }
    }

    #[test]
    fn raising_the_filter_threshold_never_drops_more_anchors() {
        let mut arm_conf = Array2::<f32>::zeros((5, 2));
        for anchor in 0..5 {
            // background logits spread from strongly negative to strongly positive
            arm_conf[[anchor, 0]] = anchor as f32 * 2.0 - 4.0;
        }

        let mut previous = 0;
        for &thresh in &[0.1, 0.5, 0.9, 0.99, 1.0] {
            let survivors = filter_negative_anchors(&arm_conf.view(), thresh).len();
            assert!(survivors >= previous);
            previous = survivors;
        }
    }

    #[test]
    fn losses_are_non_negative_and_summed() {
        let loss = RefineMultiBoxLossInit::new(3).build().unwrap();
        let output = loss
            .forward(&zero_refine_prediction(3, 3), &anchors(), &single_gt())
            .unwrap();
        assert!(output.arm.loc_loss >= 0.0);
        assert!(output.arm.conf_loss >= 0.0);
        assert!(output.odm.loc_loss >= 0.0);
        assert!(output.odm.conf_loss >= 0.0);
        assert_abs_diff_eq!(
            output.total(),
            output.arm.loc_loss
                + output.arm.conf_loss
                + output.odm.loc_loss
                + output.odm.conf_loss,
            epsilon = 1e-6
        );
    }

    #[test]
    fn all_anchors_filtered_out_zeroes_the_odm_terms() {
        let loss = RefineMultiBoxLossInit {
            neg_anchor_thresh: 0.01,
            ..RefineMultiBoxLossInit::new(3)
        }
        .build()
        .unwrap();

        let mut prediction = zero_refine_prediction(3, 3);
        // ARM is certain every anchor is background
        for anchor in 0..3 {
            prediction.arm.conf[[anchor, 0]] = 20.0;
        }

        let output = loss.forward(&prediction, &anchors(), &single_gt()).unwrap();
        assert_abs_diff_eq!(output.odm.loc_loss, 0.0);
        assert_abs_diff_eq!(output.odm.conf_loss, 0.0);
        assert!(output.arm.conf_loss > 0.0);
    }

    #[test]
    fn zero_ground_truth_is_not_an_error() {
        let loss = RefineMultiBoxLossInit::new(3).build().unwrap();
        let output = loss
            .forward(&zero_refine_prediction(3, 3), &anchors(), &[])
            .unwrap();
        assert_abs_diff_eq!(output.arm.loc_loss, 0.0);
        assert_abs_diff_eq!(output.odm.loc_loss, 0.0);
        assert!(output.arm.conf_loss > 0.0);
    }

    #[test]
    fn rejects_non_binary_arm_head() {
        let loss = RefineMultiBoxLossInit::new(3).build().unwrap();
        let mut prediction = zero_refine_prediction(3, 3);
        prediction.arm.conf = Array2::zeros((3, 3));
        assert!(loss.forward(&prediction, &anchors(), &single_gt()).is_err());
    }
}

use super::{
    cross_entropy::CrossEntropyLoss,
    hard_negative::{HardNegativeMiner, HardNegativeMinerInit},
    matcher::{Matcher, MatcherInit},
    misc::{LossOutput, Reduction},
    smooth_l1::SmoothL1Loss,
};
use crate::{
    common::*,
    label::{GroundTruth, BACKGROUND_CLASS},
    prediction::{gather_rows, HeadOutput},
};
use bbox::{BoxTransform, CyCxHw};

#[derive(Debug, Clone, PartialEq)]
pub struct MultiBoxLossInit {
    /// Number of confidence columns, background included.
    pub num_classes: usize,
    pub overlap_thresh: f32,
    pub neg_pos_ratio: usize,
    pub transform: BoxTransform<f32>,
}

impl MultiBoxLossInit {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            overlap_thresh: 0.5,
            neg_pos_ratio: 3,
            transform: BoxTransform::default(),
        }
    }

    pub fn build(self) -> Result<MultiBoxLoss> {
        let Self {
            num_classes,
            overlap_thresh,
            neg_pos_ratio,
            transform,
        } = self;

        ensure!(
            num_classes >= 2,
            "num_classes must cover background and at least one object class"
        );
        let matcher = MatcherInit { overlap_thresh }.build()?;
        let miner = HardNegativeMinerInit { neg_pos_ratio }.build()?;

        Ok(MultiBoxLoss {
            num_classes,
            matcher,
            miner,
            transform,
            loc_loss: SmoothL1Loss::new(Reduction::Sum),
            conf_loss: CrossEntropyLoss::new(Reduction::Sum),
        })
    }
}

/// Single-stage matching/mining/loss pass.
///
/// Localization is a smooth-L1 regression of matched anchors toward
/// their assigned ground truth, parameterized as anchor-relative
/// offsets; confidence is cross entropy over the matched anchors and
/// the mined hard negatives. Both terms are sums, never means.
#[derive(Debug, Clone)]
pub struct MultiBoxLoss {
    num_classes: usize,
    matcher: Matcher,
    miner: HardNegativeMiner,
    transform: BoxTransform<f32>,
    loc_loss: SmoothL1Loss,
    conf_loss: CrossEntropyLoss,
}

impl MultiBoxLoss {
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn transform(&self) -> &BoxTransform<f32> {
        &self.transform
    }

    /// Loss terms for one image.
    pub fn forward(
        &self,
        prediction: &HeadOutput,
        anchors: &[CyCxHw<f32>],
        ground_truth: &[GroundTruth],
    ) -> Result<LossOutput> {
        prediction.validate(anchors.len(), self.num_classes)?;
        for gt in ground_truth {
            ensure!(
                gt.class < self.num_classes,
                "ground-truth class {} exceeds num_classes {}",
                gt.class,
                self.num_classes
            );
        }

        let matches = self.matcher.match_anchors(anchors, ground_truth);
        let positives = matches.positive_indexes();

        // localization over matched anchors only
        let loc_loss = if positives.is_empty() {
            0.0
        } else {
            let input = gather_rows(&prediction.loc, &positives);
            let mut target = Array2::zeros((positives.len(), 4));
            for (row, &anchor_ix) in positives.iter().enumerate() {
                let gt_ix = matches.assigned[anchor_ix].expect("index is positive");
                let encoded = self
                    .transform
                    .encode(&ground_truth[gt_ix].rect, &anchors[anchor_ix]);
                target
                    .row_mut(row)
                    .assign(&ArrayView1::from(&encoded[..]));
            }
            self.loc_loss.forward(&input.view(), &target.view())
        };

        // confidence over matched anchors plus mined hard negatives
        let conf_target: Vec<usize> = matches
            .assigned
            .iter()
            .map(|assigned| match assigned {
                Some(gt_ix) => ground_truth[*gt_ix].class,
                None => BACKGROUND_CLASS,
            })
            .collect();
        let per_anchor = self
            .conf_loss
            .forward_per_instance(&prediction.conf.view(), &conf_target);
        let negatives = self.miner.mine(
            &matches,
            per_anchor.as_slice().expect("per-anchor losses are contiguous"),
        );

        let conf_loss = positives
            .iter()
            .chain(negatives.0.iter())
            .map(|&anchor| per_anchor[anchor])
            .sum();

        Ok(LossOutput {
            loc_loss,
            conf_loss,
        })
    }

    /// Sum of per-image losses over one batch.
    pub fn forward_batch(
        &self,
        predictions: &[HeadOutput],
        anchors: &[CyCxHw<f32>],
        targets: &[Vec<GroundTruth>],
    ) -> Result<LossOutput> {
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

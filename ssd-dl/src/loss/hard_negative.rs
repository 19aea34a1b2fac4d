use super::matcher::MatchResult;
use crate::common::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardNegativeMinerInit {
    pub neg_pos_ratio: usize,
}

impl Default for HardNegativeMinerInit {
    fn default() -> Self {
        Self { neg_pos_ratio: 3 }
    }
}

impl HardNegativeMinerInit {
    pub fn build(self) -> Result<HardNegativeMiner> {
        let Self { neg_pos_ratio } = self;
        ensure!(neg_pos_ratio >= 1, "neg_pos_ratio must be at least 1");
        Ok(HardNegativeMiner { neg_pos_ratio })
    }
}

/// Background anchor indexes selected for the confidence loss, ordered
/// hardest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegativeSet(pub Vec<usize>);

impl NegativeSet {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Selects a bounded set of the highest-loss background anchors.
///
/// The bound is `neg_pos_ratio` times the positive count, floored at
/// one positive so that images without ground truth still contribute a
/// non-empty confidence loss.
#[derive(Debug, Clone)]
pub struct HardNegativeMiner {
    neg_pos_ratio: usize,
}

impl HardNegativeMiner {
    pub fn neg_pos_ratio(&self) -> usize {
        self.neg_pos_ratio
    }

    pub fn mine(&self, matches: &MatchResult, conf_loss: &[f32]) -> NegativeSet {
        debug_assert_eq!(matches.num_anchors(), conf_loss.len());

        let limit = self.neg_pos_ratio * matches.num_positives().max(1);

        let mut candidates: Vec<usize> = matches
            .assigned
            .iter()
            .enumerate()
            .filter_map(|(anchor, assigned)| assigned.is_none().then(|| anchor))
            .collect();
        candidates.sort_by_key(|&anchor| -r64(conf_loss[anchor] as f64));
        candidates.truncate(limit);

        NegativeSet(candidates)
    }
}

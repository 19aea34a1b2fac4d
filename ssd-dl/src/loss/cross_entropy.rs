use super::misc::Reduction;
use crate::common::*;

/// Multi-class cross entropy over raw logits with sparse integer
/// targets, computed through log-sum-exp for stability.
#[derive(Debug, Clone, Copy)]
pub struct CrossEntropyLoss {
    reduction: Reduction,
}

impl CrossEntropyLoss {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }

    /// Per-instance loss values, one per logit row.
    pub fn forward_per_instance(&self, logits: &ArrayView2<f32>, target: &[usize]) -> Array1<f32> {
        debug_assert_eq!(logits.nrows(), target.len());
        debug_assert!(target.iter().all(|&class| class < logits.ncols()));

        let losses: Vec<f32> = logits
            .rows()
            .into_iter()
            .zip(target.iter())
            .map(|(row, &class)| log_sum_exp(&row) - row[class])
            .collect();
        Array1::from_vec(losses)
    }

    pub fn forward(&self, logits: &ArrayView2<f32>, target: &[usize]) -> f32 {
        let losses = self.forward_per_instance(logits, target);
        match self.reduction {
            Reduction::Sum => losses.sum(),
            Reduction::Mean => {
                if losses.is_empty() {
                    0.0
                } else {
                    losses.mean().unwrap_or(0.0)
                }
            }
        }
    }
}

fn log_sum_exp(row: &ArrayView1<f32>) -> f32 {
    let max = row.fold(f32::NEG_INFINITY, |acc, &val| acc.max(val));
    max + row.iter().map(|&val| (val - max).exp()).sum::<f32>().ln()
}

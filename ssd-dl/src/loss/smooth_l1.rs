use super::misc::Reduction;
use crate::common::*;

/// Robust regression loss: quadratic for residuals inside the unit
/// interval, linear beyond it.
#[derive(Debug, Clone, Copy)]
pub struct SmoothL1Loss {
    reduction: Reduction,
}

impl SmoothL1Loss {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }

    pub fn forward(&self, input: &ArrayView2<f32>, target: &ArrayView2<f32>) -> f32 {
        debug_assert_eq!(input.dim(), target.dim());

        let total: f32 = input
            .iter()
            .zip(target.iter())
            .map(|(&lhs, &rhs)| {
                let diff = (lhs - rhs).abs();
                if diff < 1.0 {
                    0.5 * diff * diff
                } else {
                    diff - 0.5
                }
            })
            .sum();

        match self.reduction {
            Reduction::Sum => total,
            Reduction::Mean => {
                let count = input.len();
                if count == 0 {
                    0.0
                } else {
                    total / count as f32
                }
            }
        }
    }
}

use crate::common::*;

/// How per-instance loss values are collapsed into a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reduction {
    Mean,
    Sum,
}

/// Scalar loss terms of one matching/loss pass.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LossOutput {
    pub loc_loss: f32,
    pub conf_loss: f32,
}

impl LossOutput {
    pub fn total(&self) -> f32 {
        self.loc_loss + self.conf_loss
    }
}

impl Sum for LossOutput {
    fn sum<I>(iter: I) -> Self
    where
        I: Iterator<Item = Self>,
    {
        iter.fold(Self::default(), |acc, item| Self {
            loc_loss: acc.loc_loss + item.loc_loss,
            conf_loss: acc.conf_loss + item.conf_loss,
        })
    }
}

/// The four terms of the two-stage loss. Logged separately, summed for
/// the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RefineLossOutput {
    pub arm: LossOutput,
    pub odm: LossOutput,
}

impl RefineLossOutput {
    pub fn total(&self) -> f32 {
        self.arm.total() + self.odm.total()
    }
}

impl Sum for RefineLossOutput {
    fn sum<I>(iter: I) -> Self
    where
        I: Iterator<Item = Self>,
    {
        iter.fold(Self::default(), |acc, item| Self {
            arm: [acc.arm, item.arm].into_iter().sum(),
            odm: [acc.odm, item.odm].into_iter().sum(),
        })
    }
}

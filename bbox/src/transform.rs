use crate::{common::*, CyCxHw, Tlbr};

/// Anchor-relative box parameterization.
///
/// Encoding expresses a target box as translation offsets of the anchor
/// center scaled by the anchor size, and log ratios of the sizes. The
/// variances rescale the four components. Offsets are ordered (ty, tx,
/// th, tw), matching the center-size component order used elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxTransform<T> {
    center_variance: T,
    size_variance: T,
}

impl<T> BoxTransform<T>
where
    T: Float,
{
    pub fn try_new(center_variance: T, size_variance: T) -> Result<Self> {
        ensure!(
            center_variance > T::zero() && size_variance > T::zero(),
            "variances must be positive"
        );
        Ok(Self {
            center_variance,
            size_variance,
        })
    }

    pub fn center_variance(&self) -> T {
        self.center_variance
    }

    pub fn size_variance(&self) -> T {
        self.size_variance
    }

    /// Regression target for `target` relative to `anchor`.
    pub fn encode(&self, target: &Tlbr<T>, anchor: &CyCxHw<T>) -> [T; 4] {
        let target = target.to_cycxhw();
        let ty = (target.cy() - anchor.cy()) / (anchor.h() * self.center_variance);
        let tx = (target.cx() - anchor.cx()) / (anchor.w() * self.center_variance);
        let th = (target.h() / anchor.h()).ln() / self.size_variance;
        let tw = (target.w() / anchor.w()).ln() / self.size_variance;
        [ty, tx, th, tw]
    }

    /// Inverse of [`encode`](Self::encode): absolute box from predicted
    /// offsets and the anchor they are relative to.
    pub fn decode(&self, offsets: [T; 4], anchor: &CyCxHw<T>) -> CyCxHw<T> {
        let [ty, tx, th, tw] = offsets;
        let cy = ty * self.center_variance * anchor.h() + anchor.cy();
        let cx = tx * self.center_variance * anchor.w() + anchor.cx();
        let h = (th * self.size_variance).exp() * anchor.h();
        let w = (tw * self.size_variance).exp() * anchor.w();
        CyCxHw { cy, cx, h, w }
    }
}

impl<T> Default for BoxTransform<T>
where
    T: Float,
{
    fn default() -> Self {
        let center_variance = T::from(0.1).unwrap();
        let size_variance = T::from(0.2).unwrap();
        Self {
            center_variance,
            size_variance,
        }
    }
}

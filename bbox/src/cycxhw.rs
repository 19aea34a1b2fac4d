use crate::{common::*, Tlbr};

/// Bounding box in center-size (cy, cx, h, w) format.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CyCxHw<T> {
    pub(crate) cy: T,
    pub(crate) cx: T,
    pub(crate) h: T,
    pub(crate) w: T,
}

impl<T> CyCxHw<T>
where
    T: Float,
{
    pub fn try_new(cy: T, cx: T, h: T, w: T) -> Result<Self> {
        ensure!(
            h >= T::zero() && w >= T::zero(),
            "box height and width must be non-negative"
        );
        Ok(Self { cy, cx, h, w })
    }

    pub fn cy(&self) -> T {
        self.cy
    }

    pub fn cx(&self) -> T {
        self.cx
    }

    pub fn h(&self) -> T {
        self.h
    }

    pub fn w(&self) -> T {
        self.w
    }

    pub fn cycxhw(&self) -> [T; 4] {
        [self.cy, self.cx, self.h, self.w]
    }

    pub fn area(&self) -> T {
        self.h * self.w
    }

    pub fn iou_with(&self, other: &Self) -> T {
        self.to_tlbr().iou_with(&other.to_tlbr())
    }

    /// Clamp the corner extent to the unit square.
    pub fn clamp_unit(&self) -> Self {
        let tlbr = self.to_tlbr();
        let zero = T::zero();
        let one = T::one();
        let t = tlbr.t().max(zero).min(one);
        let l = tlbr.l().max(zero).min(one);
        let b = tlbr.b().max(zero).min(one);
        let r = tlbr.r().max(zero).min(one);
        Self::from(&Tlbr { t, l, b, r })
    }

    pub fn to_tlbr(&self) -> Tlbr<T> {
        Tlbr::from(self)
    }

    pub fn cast<V>(&self) -> Option<CyCxHw<V>>
    where
        T: ToPrimitive,
        V: NumCast,
    {
        Some(CyCxHw {
            cy: V::from(self.cy)?,
            cx: V::from(self.cx)?,
            h: V::from(self.h)?,
            w: V::from(self.w)?,
        })
    }
}

impl<T> From<&Tlbr<T>> for CyCxHw<T>
where
    T: Float,
{
    fn from(from: &Tlbr<T>) -> Self {
        let two = T::one() + T::one();
        let h = from.b() - from.t();
        let w = from.r() - from.l();
        Self {
            cy: from.t() + h / two,
            cx: from.l() + w / two,
            h,
            w,
        }
    }
}

impl<T> From<Tlbr<T>> for CyCxHw<T>
where
    T: Float,
{
    fn from(from: Tlbr<T>) -> Self {
        Self::from(&from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn rejects_negative_size() {
        assert!(CyCxHw::try_new(0.5f64, 0.5, -0.1, 0.2).is_err());
    }

    #[test]
    fn center_corner_round_trip() {
        let orig = CyCxHw::try_new(0.5f64, 0.4, 0.2, 0.6).unwrap();
        let back = CyCxHw::from(orig.to_tlbr());
        assert_abs_diff_eq!(orig.cy(), back.cy(), epsilon = 1e-12);
        assert_abs_diff_eq!(orig.cx(), back.cx(), epsilon = 1e-12);
        assert_abs_diff_eq!(orig.h(), back.h(), epsilon = 1e-12);
        assert_abs_diff_eq!(orig.w(), back.w(), epsilon = 1e-12);
    }

    #[test]
    fn clamp_unit_cuts_overflow() {
        let rect = CyCxHw::try_new(0.0f64, 0.0, 0.4, 0.4).unwrap().clamp_unit();
        let tlbr = rect.to_tlbr();
        assert_abs_diff_eq!(tlbr.t(), 0.0);
        assert_abs_diff_eq!(tlbr.l(), 0.0);
        assert_abs_diff_eq!(tlbr.b(), 0.2);
        assert_abs_diff_eq!(tlbr.r(), 0.2);
    }
}

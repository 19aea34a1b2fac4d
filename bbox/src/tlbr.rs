use crate::{common::*, CyCxHw};

/// Bounding box in corner (top, left, bottom, right) format.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tlbr<T> {
    pub(crate) t: T,
    pub(crate) l: T,
    pub(crate) b: T,
    pub(crate) r: T,
}

impl<T> Tlbr<T>
where
    T: Float,
{
    pub fn try_new(t: T, l: T, b: T, r: T) -> Result<Self> {
        ensure!(
            b >= t && r >= l,
            "invalid corner box: bottom >= top and right >= left must hold"
        );
        Ok(Self { t, l, b, r })
    }

    /// Corner box from center-size components without validity checks on
    /// the caller side; negative sizes are rejected.
    pub fn try_from_cycxhw(cycxhw: [T; 4]) -> Result<Self> {
        let [cy, cx, h, w] = cycxhw;
        let zero = T::zero();
        ensure!(
            h >= zero && w >= zero,
            "box height and width must be non-negative"
        );
        let two = T::one() + T::one();
        Ok(Self {
            t: cy - h / two,
            l: cx - w / two,
            b: cy + h / two,
            r: cx + w / two,
        })
    }

    pub fn t(&self) -> T {
        self.t
    }

    pub fn l(&self) -> T {
        self.l
    }

    pub fn b(&self) -> T {
        self.b
    }

    pub fn r(&self) -> T {
        self.r
    }

    pub fn h(&self) -> T {
        self.b - self.t
    }

    pub fn w(&self) -> T {
        self.r - self.l
    }

    pub fn cy(&self) -> T {
        let two = T::one() + T::one();
        self.t + self.h() / two
    }

    pub fn cx(&self) -> T {
        let two = T::one() + T::one();
        self.l + self.w() / two
    }

    pub fn tlbr(&self) -> [T; 4] {
        [self.t, self.l, self.b, self.r]
    }

    pub fn area(&self) -> T {
        self.h() * self.w()
    }

    /// Intersection box, or `None` when the boxes do not overlap.
    pub fn intersect_with(&self, other: &Self) -> Option<Self> {
        let t = self.t.max(other.t);
        let l = self.l.max(other.l);
        let b = self.b.min(other.b);
        let r = self.r.min(other.r);
        (b > t && r > l).then(|| Self { t, l, b, r })
    }

    pub fn intersection_area_with(&self, other: &Self) -> T {
        self.intersect_with(other)
            .map(|rect| rect.area())
            .unwrap_or_else(T::zero)
    }

    pub fn iou_with(&self, other: &Self) -> T {
        let inter_area = self.intersection_area_with(other);
        let union_area = self.area() + other.area() - inter_area;
        if union_area <= T::zero() {
            T::zero()
        } else {
            inter_area / union_area
        }
    }

    /// Scale both axes independently, e.g. ratio to pixel units.
    pub fn scale_xy(&self, scale_x: T, scale_y: T) -> Self {
        Self {
            t: self.t * scale_y,
            l: self.l * scale_x,
            b: self.b * scale_y,
            r: self.r * scale_x,
        }
    }

    pub fn to_cycxhw(&self) -> CyCxHw<T> {
        CyCxHw::from(self)
    }

    pub fn cast<V>(&self) -> Option<Tlbr<V>>
    where
        T: ToPrimitive,
        V: NumCast,
    {
        Some(Tlbr {
            t: V::from(self.t)?,
            l: V::from(self.l)?,
            b: V::from(self.b)?,
            r: V::from(self.r)?,
        })
    }
}

impl<T> From<&CyCxHw<T>> for Tlbr<T>
where
    T: Float,
{
    fn from(from: &CyCxHw<T>) -> Self {
        let two = T::one() + T::one();
        Self {
            t: from.cy() - from.h() / two,
            l: from.cx() - from.w() / two,
            b: from.cy() + from.h() / two,
            r: from.cx() + from.w() / two,
        }
    }
}

impl<T> From<CyCxHw<T>> for Tlbr<T>
where
    T: Float,
{
    fn from(from: CyCxHw<T>) -> Self {
        Self::from(&from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn rejects_flipped_corners() {
        assert!(Tlbr::try_new(0.5f64, 0.5, 0.1, 0.9).is_err());
        assert!(Tlbr::try_new(0.1f64, 0.1, 0.5, 0.5).is_ok());
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let lhs = Tlbr::try_new(0.1f64, 0.2, 0.5, 0.6).unwrap();
        assert_abs_diff_eq!(lhs.iou_with(&lhs), 1.0);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let lhs = Tlbr::try_new(0.0f64, 0.0, 0.2, 0.2).unwrap();
        let rhs = Tlbr::try_new(0.5f64, 0.5, 0.9, 0.9).unwrap();
        assert_abs_diff_eq!(lhs.iou_with(&rhs), 0.0);
    }

    #[test]
    fn iou_of_half_overlap() {
        let lhs = Tlbr::try_new(0.0f64, 0.0, 1.0, 1.0).unwrap();
        let rhs = Tlbr::try_new(0.0f64, 0.5, 1.0, 1.5).unwrap();
        // intersection 0.5, union 1.5
        assert_abs_diff_eq!(lhs.iou_with(&rhs), 1.0 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn corner_center_round_trip() {
        let orig = Tlbr::try_new(0.1f64, 0.2, 0.5, 0.8).unwrap();
        let back = Tlbr::from(orig.to_cycxhw());
        assert_abs_diff_eq!(orig.t(), back.t(), epsilon = 1e-12);
        assert_abs_diff_eq!(orig.l(), back.l(), epsilon = 1e-12);
        assert_abs_diff_eq!(orig.b(), back.b(), epsilon = 1e-12);
        assert_abs_diff_eq!(orig.r(), back.r(), epsilon = 1e-12);
    }
}

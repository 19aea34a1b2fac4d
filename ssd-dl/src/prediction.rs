//! Raw per-image network outputs consumed by the loss and the decoder.

use crate::common::*;

/// One detection head's outputs for a single image.
///
/// Rows follow the anchor generator's ordering position for position;
/// the loss and the decoder validate the widths against the anchor set
/// they are given.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadOutput {
    /// Box offsets, shape `[n_anchors, 4]`, ordered (ty, tx, th, tw).
    pub loc: Array2<f32>,
    /// Class logits, shape `[n_anchors, n_classes]`.
    pub conf: Array2<f32>,
}

impl HeadOutput {
    pub fn num_anchors(&self) -> usize {
        self.loc.nrows()
    }

    pub fn num_classes(&self) -> usize {
        self.conf.ncols()
    }

    pub fn validate(&self, num_anchors: usize, num_classes: usize) -> Result<()> {
        ensure!(
            self.loc.dim() == (num_anchors, 4),
            "localization prediction has shape {:?}, expected ({}, 4)",
            self.loc.dim(),
            num_anchors
        );
        ensure!(
            self.conf.dim() == (num_anchors, num_classes),
            "confidence prediction has shape {:?}, expected ({}, {})",
            self.conf.dim(),
            num_anchors,
            num_classes
        );
        Ok(())
    }

    /// Row-gather into a new head output over a subset of anchors.
    pub fn select_rows(&self, indexes: &[usize]) -> Self {
        let loc = gather_rows(&self.loc, indexes);
        let conf = gather_rows(&self.conf, indexes);
        Self { loc, conf }
    }
}

/// ARM and ODM head outputs of the two-stage refinement detector for a
/// single image. Both heads share the anchor ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct RefineOutput {
    pub arm: HeadOutput,
    pub odm: HeadOutput,
}

pub(crate) fn gather_rows(from: &Array2<f32>, indexes: &[usize]) -> Array2<f32> {
    let mut out = Array2::zeros((indexes.len(), from.ncols()));
    for (row, &ix) in indexes.iter().enumerate() {
        out.row_mut(row).assign(&from.row(ix));
    }
    out
}

/// Per-row softmax over logits.
pub(crate) fn softmax_rows(logits: &ArrayView2<f32>) -> Array2<f32> {
    let mut out = logits.to_owned();
    for mut row in out.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |acc, &val| acc.max(val));
        row.mapv_inplace(|val| (val - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|val| val / sum);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn validate_rejects_mismatched_widths() {
        let output = HeadOutput {
            loc: Array2::zeros((8, 4)),
            conf: Array2::zeros((8, 3)),
        };
        assert!(output.validate(8, 3).is_ok());
        assert!(output.validate(9, 3).is_err());
        assert!(output.validate(8, 4).is_err());
    }

    #[test]
    fn softmax_rows_are_normalized() {
        let logits = array![[0.0_f32, 0.0, 0.0], [1.0, 2.0, 3.0]];
        let probs = softmax_rows(&logits.view());
        for row in probs.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-6);
        }
        assert_abs_diff_eq!(probs[[0, 0]], 1.0 / 3.0, epsilon = 1e-6);
        assert!(probs[[1, 2]] > probs[[1, 1]]);
    }

    #[test]
    fn select_rows_gathers_in_order() {
        let output = HeadOutput {
            loc: array![[0.0_f32, 0., 0., 0.], [1., 1., 1., 1.], [2., 2., 2., 2.]],
            conf: array![[0.0_f32, 0.], [1., 1.], [2., 2.]],
        };
        let subset = output.select_rows(&[2, 0]);
        assert_eq!(subset.loc.nrows(), 2);
        assert_abs_diff_eq!(subset.loc[[0, 0]], 2.0);
        assert_abs_diff_eq!(subset.conf[[1, 1]], 0.0);
    }
}

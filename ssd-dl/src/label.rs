use crate::common::*;
use bbox::Tlbr;

/// The class index reserved for background.
pub const BACKGROUND_CLASS: usize = 0;

/// One labeled object instance with corners in ratio units.
///
/// Object classes start at 1; class 0 is reserved for background and
/// never appears in ground truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundTruth {
    pub rect: Tlbr<f32>,
    pub class: usize,
}

impl GroundTruth {
    pub fn try_new(rect: Tlbr<f32>, class: usize) -> Result<Self> {
        ensure!(
            class != BACKGROUND_CLASS,
            "ground truth must not carry the background class"
        );
        Ok(Self { rect, class })
    }
}

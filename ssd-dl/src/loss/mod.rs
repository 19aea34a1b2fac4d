//! Loss function building blocks.

mod average_precision;
mod cross_entropy;
mod hard_negative;
mod matcher;
mod misc;
mod multibox;
mod refine;
mod smooth_l1;

pub use average_precision::*;
pub use cross_entropy::*;
pub use hard_negative::*;
pub use matcher::*;
pub use misc::*;
pub use multibox::*;
pub use refine::*;
pub use smooth_l1::*;

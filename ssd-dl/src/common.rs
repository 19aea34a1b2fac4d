pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use indexmap::IndexMap;
pub use itertools::{iproduct, Itertools as _};
pub use log::{debug, warn};
pub use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
pub use noisy_float::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    cmp::Ordering,
    collections::HashMap,
    fmt::Debug,
    iter::{self, Sum},
};

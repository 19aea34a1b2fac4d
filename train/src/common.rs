//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use bbox::{BoxTransform, CyCxHw, Tlbr};
pub use chrono::{DateTime, Local};
pub use itertools::Itertools as _;
pub use log::{info, warn};
pub use noisy_float::prelude::*;
pub use once_cell::sync::Lazy;
pub use serde::{Deserialize, Serialize};
pub use ssd_dl::{
    anchor::{AnchorGenerator, AnchorGeneratorInit, LevelConfig},
    decode::{Detection, DetectionDecoder, DetectionDecoderInit, DetectionTable},
    label::GroundTruth,
    loss::{
        ApCalculator, ApCalculatorInit, ApReport, IntegralMethod, LossOutput, MultiBoxLoss,
        MultiBoxLossInit, RefineLossOutput, RefineMultiBoxLoss, RefineMultiBoxLossInit,
    },
    prediction::{HeadOutput, RefineOutput},
};
pub use std::{
    collections::HashMap,
    fmt,
    fmt::Debug,
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
};

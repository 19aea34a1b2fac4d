//! Collaborator seams for the detector network and its optimizer.

use crate::{common::*, data::TrainingBatch, utils::ParameterBlob};
use ndarray::Array2;
use std::iter;

/// Which detector profile a model produces predictions for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileKind {
    SingleStage,
    Refine,
}

/// Per-image predictions for one batch, in anchor-generator order.
#[derive(Debug, Clone)]
pub enum Predictions {
    SingleStage(Vec<HeadOutput>),
    Refine(Vec<RefineOutput>),
}

impl Predictions {
    pub fn len(&self) -> usize {
        match self {
            Self::SingleStage(outputs) => outputs.len(),
            Self::Refine(outputs) => outputs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The backbone network seam. Implementations must emit predictions in
/// the exact ordering of the anchor generator they were built against.
pub trait Detector {
    fn num_classes(&self) -> usize;

    fn forward(&self, batch: &TrainingBatch) -> Result<Predictions>;

    /// Learned parameters as an opaque blob for the checkpoint store.
    fn parameters(&self) -> ParameterBlob;

    fn load_parameters(&mut self, blob: &ParameterBlob) -> Result<()>;

    /// Independent copy used for evaluation; training parameters and
    /// optimizer state are never touched through it.
    fn eval_instance(&self) -> Box<dyn Detector>;
}

/// The gradient/update seam. The loop only triggers it; computing
/// gradients is the implementation's concern.
pub trait Optimizer {
    fn step(&mut self, total_loss: f64) -> Result<()>;
    fn set_lr(&mut self, lr: f64);
}

/// Parameter-free detector producing constant zero predictions. It
/// exercises the full pipeline (matching, mining, losses, decoding)
/// without a backbone attached.
#[derive(Debug, Clone)]
pub struct BaselineDetector {
    num_anchors: usize,
    num_classes: usize,
    profile: ProfileKind,
}

impl BaselineDetector {
    pub fn new(num_anchors: usize, num_classes: usize, profile: ProfileKind) -> Result<Self> {
        ensure!(num_anchors > 0, "num_anchors must be positive");
        ensure!(
            num_classes >= 2,
            "num_classes must cover background and at least one object class"
        );
        Ok(Self {
            num_anchors,
            num_classes,
            profile,
        })
    }

    fn single_stage_output(&self) -> HeadOutput {
        HeadOutput {
            loc: Array2::zeros((self.num_anchors, 4)),
            conf: Array2::zeros((self.num_anchors, self.num_classes)),
        }
    }

    fn refine_output(&self) -> RefineOutput {
        RefineOutput {
            arm: HeadOutput {
                loc: Array2::zeros((self.num_anchors, 4)),
                conf: Array2::zeros((self.num_anchors, 2)),
            },
            odm: self.single_stage_output(),
        }
    }
}

impl Detector for BaselineDetector {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn forward(&self, batch: &TrainingBatch) -> Result<Predictions> {
        let predictions = match self.profile {
            ProfileKind::SingleStage => Predictions::SingleStage(
                iter::repeat_with(|| self.single_stage_output())
                    .take(batch.len())
                    .collect(),
            ),
            ProfileKind::Refine => Predictions::Refine(
                iter::repeat_with(|| self.refine_output())
                    .take(batch.len())
                    .collect(),
            ),
        };
        Ok(predictions)
    }

    fn parameters(&self) -> ParameterBlob {
        ParameterBlob(Vec::new())
    }

    fn load_parameters(&mut self, blob: &ParameterBlob) -> Result<()> {
        ensure!(
            blob.0.is_empty(),
            "the baseline detector has no parameters, got a {}-byte blob",
            blob.0.len()
        );
        Ok(())
    }

    fn eval_instance(&self) -> Box<dyn Detector> {
        Box::new(self.clone())
    }
}

/// Optimizer stand-in for parameter-free models; records the trigger
/// count and the current learning rate.
#[derive(Debug, Clone, Default)]
pub struct BaselineOptimizer {
    lr: f64,
    steps: usize,
}

impl BaselineOptimizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }
}

impl Optimizer for BaselineOptimizer {
    fn step(&mut self, total_loss: f64) -> Result<()> {
        ensure!(
            total_loss.is_finite(),
            "non-finite total loss {}",
            total_loss
        );
        self.steps += 1;
        Ok(())
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }
}

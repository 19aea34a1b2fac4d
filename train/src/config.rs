//! Training program configuration format.

use crate::common::*;

pub use dataset::*;
pub use model::*;
pub use training::*;

/// The main training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub dataset: DatasetConfig,
    pub model: ModelConfig,
    pub anchors: AnchorGeneratorInit,
    pub training: TrainingConfig,
    pub eval: EvalConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = fs::read_to_string(path)?;
        let config = json5::from_str(&text)?;
        Ok(config)
    }
}

/// Data logging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub dir: PathBuf,
}

mod dataset {
    use super::*;

    /// Dataset options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DatasetConfig {
        /// Tag used for the final checkpoint and log lines.
        pub name: String,
        /// Confidence columns of the dataset taxonomy, background
        /// included.
        pub num_classes: NonZeroUsize,
        /// Shuffle the image order on every pass.
        #[serde(default = "default_true")]
        pub shuffle: bool,
        pub kind: DatasetKind,
    }

    /// Variants of dataset and options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum DatasetKind {
        /// Label lists stored as CSV rows.
        Csv {
            label_file: PathBuf,
            /// Held-out labels for evaluation during training.
            val_label_file: Option<PathBuf>,
        },
    }

    fn default_true() -> bool {
        true
    }
}

mod model {
    use super::*;

    /// The model configuration.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "kind")]
    pub enum ModelConfig {
        /// Parameter-free detector producing constant predictions; used
        /// for end-to-end pipeline runs without a backbone attached.
        Baseline,
    }
}

mod training {
    use super::*;

    /// The training options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TrainingConfig {
        /// The batch size.
        pub batch_size: NonZeroUsize,
        /// Total epochs to run.
        pub epochs: NonZeroUsize,
        /// Initial learning rate.
        pub initial_lr: R64,
        /// Multiplier applied per decay interval.
        #[serde(default = "default_lr_decay_gamma")]
        pub lr_decay_gamma: R64,
        /// Epochs between learning-rate decays.
        #[serde(default = "default_lr_decay_epochs")]
        pub lr_decay_epochs: NonZeroUsize,
        /// If enabled, it overrides the initial training step.
        pub override_initial_step: Option<usize>,
        /// If set, it saves a checkpoint file per this steps.
        pub save_checkpoint_steps: Option<NonZeroUsize>,
        /// Steps between running-mean loss log lines.
        #[serde(default = "default_log_steps")]
        pub log_steps: NonZeroUsize,
        /// Checkpoint file loading method.
        #[serde(default)]
        pub load_checkpoint: LoadCheckpoint,
        /// The loss function options.
        pub loss: LossConfig,
    }

    /// Checkpoint file loading method.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LoadCheckpoint {
        /// Disable checkpoint file loading.
        Disabled,
        /// Load the most recent checkpoint file.
        FromRecent,
        /// Load the checkpoint file at specified path.
        FromFile { file: PathBuf },
    }

    impl Default for LoadCheckpoint {
        fn default() -> Self {
            Self::Disabled
        }
    }

    /// The loss function configuration; one variant per detector
    /// profile.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LossConfig {
        SingleStage {
            #[serde(default = "default_overlap_thresh")]
            overlap_thresh: R64,
            #[serde(default = "default_neg_pos_ratio")]
            neg_pos_ratio: usize,
        },
        Refine {
            #[serde(default = "default_overlap_thresh")]
            arm_overlap_thresh: R64,
            #[serde(default = "default_overlap_thresh")]
            odm_overlap_thresh: R64,
            #[serde(default = "default_neg_pos_ratio")]
            neg_pos_ratio: usize,
            /// ARM background-probability ceiling during training.
            #[serde(default = "default_neg_anchor_thresh")]
            neg_anchor_thresh_train: R64,
            /// ARM background-probability ceiling during inference.
            #[serde(default = "default_neg_anchor_thresh")]
            neg_anchor_thresh_infer: R64,
        },
    }

    fn default_lr_decay_gamma() -> R64 {
        r64(0.1)
    }

    fn default_lr_decay_epochs() -> NonZeroUsize {
        NonZeroUsize::new(30).unwrap()
    }

    fn default_log_steps() -> NonZeroUsize {
        NonZeroUsize::new(10).unwrap()
    }

    fn default_overlap_thresh() -> R64 {
        r64(0.5)
    }

    fn default_neg_pos_ratio() -> usize {
        3
    }

    fn default_neg_anchor_thresh() -> R64 {
        r64(0.99)
    }
}

/// Evaluation-during-training options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    pub enabled: bool,
    #[serde(default = "default_epochs_per_eval")]
    pub epochs_per_eval: NonZeroUsize,
    /// Detection confidence threshold for decoding.
    #[serde(default = "default_confidence_thresh")]
    pub confidence_thresh: R64,
    /// Maximum detections retained per image.
    #[serde(default = "default_top_k")]
    pub top_k: NonZeroUsize,
    /// Overlap required for a detection to count as a true positive.
    #[serde(default = "default_ap_iou_thresh")]
    pub ap_iou_thresh: R64,
}

fn default_epochs_per_eval() -> NonZeroUsize {
    NonZeroUsize::new(1).unwrap()
}

fn default_confidence_thresh() -> R64 {
    r64(0.01)
}

fn default_top_k() -> NonZeroUsize {
    NonZeroUsize::new(200).unwrap()
}

fn default_ap_iou_thresh() -> R64 {
    r64(0.5)
}

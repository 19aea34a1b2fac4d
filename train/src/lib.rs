//! The training program for the ssd-dl project.

pub mod common;
pub mod config;
pub mod data;
pub mod model;
pub mod train_loop;
pub mod utils;

use crate::{
    common::*,
    config::{Config, DatasetKind, LoadCheckpoint, LossConfig, ModelConfig},
    data::CsvDataset,
    model::{BaselineDetector, BaselineOptimizer, Detector, ProfileKind},
    train_loop::{EvalSettings, TrainingLoopInit},
    utils::{CheckpointStore, FileCheckpointStore, ParameterBlob, FILE_STRFTIME},
};

/// The entry of training program.
pub fn start(config: Arc<Config>) -> Result<()> {
    let start_time = Local::now();
    let logging_dir = config
        .logging
        .dir
        .join(format!("{}", start_time.format(FILE_STRFTIME)));
    let checkpoint_dir = logging_dir.join("checkpoints");
    let eval_dir = logging_dir.join("evals");

    // create dirs and save config
    fs::create_dir_all(&logging_dir)?;
    let text = serde_json::to_string_pretty(&*config)?;
    fs::write(logging_dir.join("config.json5"), text)?;

    // load dataset
    info!("loading dataset");
    let (label_file, val_label_file) = match &config.dataset.kind {
        DatasetKind::Csv {
            label_file,
            val_label_file,
        } => (label_file, val_label_file),
    };
    let mut train_data = CsvDataset::open(label_file, config.dataset.shuffle)?;
    let mut val_data = match (config.eval.enabled, val_label_file) {
        (true, Some(path)) => Some(CsvDataset::open(path, false)?),
        (true, None) => {
            warn!("evaluation is enabled but no val_label_file is configured; skipping");
            None
        }
        (false, _) => None,
    };

    // anchors
    let generator = config.anchors.clone().build()?;
    let anchors = generator.generate();
    info!("generated {} anchors", anchors.len());

    // model and optimizer
    let num_classes = config.dataset.num_classes.get();
    let profile_kind = match config.training.loss {
        LossConfig::SingleStage { .. } => ProfileKind::SingleStage,
        LossConfig::Refine { .. } => ProfileKind::Refine,
    };
    let mut model: Box<dyn Detector> = match config.model {
        ModelConfig::Baseline => {
            Box::new(BaselineDetector::new(anchors.len(), num_classes, profile_kind)?)
        }
    };
    let mut optimizer = BaselineOptimizer::new();

    // checkpoints
    let mut checkpoints = FileCheckpointStore::new(&checkpoint_dir)?;
    match &config.training.load_checkpoint {
        LoadCheckpoint::Disabled => {
            info!("checkpoint loading is disabled");
        }
        LoadCheckpoint::FromRecent => {
            if let Some(blob) = checkpoints.load_recent()? {
                model.load_parameters(&blob)?;
            }
        }
        LoadCheckpoint::FromFile { file } => {
            let blob = ParameterBlob(fs::read(file).with_context(|| {
                format!("failed to read checkpoint file '{}'", file.display())
            })?);
            model.load_parameters(&blob)?;
        }
    }

    // evaluation settings
    let eval = match &val_data {
        Some(_) => {
            let decoder = ssd_dl::decode::DetectionDecoderInit {
                num_classes,
                confidence_thresh: config.eval.confidence_thresh.raw() as f32,
                top_k: config.eval.top_k.get(),
                neg_anchor_thresh: match config.training.loss {
                    LossConfig::Refine {
                        neg_anchor_thresh_infer,
                        ..
                    } => neg_anchor_thresh_infer.raw() as f32,
                    LossConfig::SingleStage { .. } => 1.0,
                },
                transform: BoxTransform::default(),
            }
            .build()?;
            let ap_calculator = ApCalculatorInit {
                integral_method: IntegralMethod::Interpolation(101),
                iou_thresh: config.eval.ap_iou_thresh,
            }
            .build()?;
            Some(EvalSettings {
                epochs_per_eval: config.eval.epochs_per_eval.get(),
                decoder,
                ap_calculator,
                output_dir: Some(eval_dir),
            })
        }
        None => None,
    };

    // training
    let training_loop = TrainingLoopInit {
        num_classes,
        anchors,
        batch_size: config.training.batch_size.get(),
        epochs: config.training.epochs.get(),
        initial_lr: config.training.initial_lr.raw(),
        lr_decay_gamma: config.training.lr_decay_gamma.raw(),
        lr_decay_epochs: config.training.lr_decay_epochs.get(),
        log_steps: config.training.log_steps.get(),
        save_checkpoint_steps: config.training.save_checkpoint_steps.map(|steps| steps.get()),
        override_initial_step: config.training.override_initial_step,
        loss: config.training.loss.clone(),
        eval,
        dataset_name: config.dataset.name.clone(),
    }
    .build()?;

    let summary = training_loop.run(
        &mut *model,
        &mut optimizer,
        &mut train_data,
        val_data
            .as_mut()
            .map(|source| source as &mut dyn data::BatchSource),
        &mut checkpoints,
    )?;

    info!(
        "finished {} iterations over {} epochs, final lr {:e}, optimizer triggered {} times",
        summary.iterations_run,
        summary.epochs_run,
        summary.final_lr,
        optimizer.steps()
    );
    for (epoch, mean_ap) in &summary.evaluations {
        info!("epoch {} mean AP {:.4}", epoch, mean_ap.raw());
    }

    Ok(())
}

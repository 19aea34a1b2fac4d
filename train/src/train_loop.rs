//! The sequential training loop: batches, loss, optimizer triggers,
//! learning-rate decay, checkpoints, and evaluation boundaries.

use crate::{
    common::*,
    config::LossConfig,
    data::BatchSource,
    model::{Detector, Optimizer, Predictions},
    utils::{CheckpointKey, CheckpointStore},
};

/// The loss profile in effect, sharing the matcher/miner building
/// blocks between both variants.
#[derive(Debug, Clone)]
pub enum LossProfile {
    SingleStage(MultiBoxLoss),
    Refine(RefineMultiBoxLoss),
}

impl LossProfile {
    pub fn from_config(
        config: &LossConfig,
        num_classes: usize,
        transform: BoxTransform<f32>,
    ) -> Result<Self> {
        let profile = match *config {
            LossConfig::SingleStage {
                overlap_thresh,
                neg_pos_ratio,
            } => Self::SingleStage(
                MultiBoxLossInit {
                    num_classes,
                    overlap_thresh: overlap_thresh.raw() as f32,
                    neg_pos_ratio,
                    transform,
                }
                .build()?,
            ),
            LossConfig::Refine {
                arm_overlap_thresh,
                odm_overlap_thresh,
                neg_pos_ratio,
                neg_anchor_thresh_train,
                ..
            } => Self::Refine(
                RefineMultiBoxLossInit {
                    num_classes,
                    arm_overlap_thresh: arm_overlap_thresh.raw() as f32,
                    odm_overlap_thresh: odm_overlap_thresh.raw() as f32,
                    neg_pos_ratio,
                    neg_anchor_thresh: neg_anchor_thresh_train.raw() as f32,
                    transform,
                }
                .build()?,
            ),
        };
        Ok(profile)
    }

    /// Total batch loss under this profile. The prediction variant must
    /// match the profile; a mismatch is a configuration error.
    pub fn forward_batch(
        &self,
        predictions: &Predictions,
        anchors: &[CyCxHw<f32>],
        targets: &[Vec<GroundTruth>],
    ) -> Result<BatchLoss> {
        match (self, predictions) {
            (Self::SingleStage(loss), Predictions::SingleStage(outputs)) => Ok(
                BatchLoss::SingleStage(loss.forward_batch(outputs, anchors, targets)?),
            ),
            (Self::Refine(loss), Predictions::Refine(outputs)) => Ok(BatchLoss::Refine(
                loss.forward_batch(outputs, anchors, targets)?,
            )),
            (Self::SingleStage(_), Predictions::Refine(_)) => {
                bail!("the single-stage loss profile got refine predictions")
            }
            (Self::Refine(_), Predictions::SingleStage(_)) => {
                bail!("the refine loss profile got single-stage predictions")
            }
        }
    }
}

/// Loss terms of one batch, kept separate for logging and summed for
/// the optimizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BatchLoss {
    SingleStage(LossOutput),
    Refine(RefineLossOutput),
}

impl BatchLoss {
    pub fn total(&self) -> f32 {
        match self {
            Self::SingleStage(output) => output.total(),
            Self::Refine(output) => output.total(),
        }
    }

    fn accumulate(&mut self, other: &Self) {
        match (self, other) {
            (Self::SingleStage(acc), Self::SingleStage(term)) => {
                acc.loc_loss += term.loc_loss;
                acc.conf_loss += term.conf_loss;
            }
            (Self::Refine(acc), Self::Refine(term)) => {
                acc.arm.loc_loss += term.arm.loc_loss;
                acc.arm.conf_loss += term.arm.conf_loss;
                acc.odm.loc_loss += term.odm.loc_loss;
                acc.odm.conf_loss += term.odm.conf_loss;
            }
            _ => unreachable!("the profile is fixed for a run"),
        }
    }

    fn scaled(&self, factor: f32) -> Self {
        match *self {
            Self::SingleStage(output) => Self::SingleStage(LossOutput {
                loc_loss: output.loc_loss * factor,
                conf_loss: output.conf_loss * factor,
            }),
            Self::Refine(output) => Self::Refine(RefineLossOutput {
                arm: LossOutput {
                    loc_loss: output.arm.loc_loss * factor,
                    conf_loss: output.arm.conf_loss * factor,
                },
                odm: LossOutput {
                    loc_loss: output.odm.loc_loss * factor,
                    conf_loss: output.odm.conf_loss * factor,
                },
            }),
        }
    }

    fn zero_like(&self) -> Self {
        self.scaled(0.0)
    }
}

impl fmt::Display for BatchLoss {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleStage(output) => write!(
                formatter,
                "loc {:.4} conf {:.4}",
                output.loc_loss, output.conf_loss
            ),
            Self::Refine(output) => write!(
                formatter,
                "arm_loc {:.4} arm_conf {:.4} odm_loc {:.4} odm_conf {:.4}",
                output.arm.loc_loss,
                output.arm.conf_loss,
                output.odm.loc_loss,
                output.odm.conf_loss
            ),
        }
    }
}

/// Evaluation settings in effect during training.
#[derive(Debug, Clone)]
pub struct EvalSettings {
    pub epochs_per_eval: usize,
    pub decoder: DetectionDecoder,
    pub ap_calculator: ApCalculator,
    /// When set, each evaluation's detection table is serialized here.
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TrainingLoopInit {
    pub num_classes: usize,
    pub anchors: Vec<CyCxHw<f32>>,
    pub batch_size: usize,
    pub epochs: usize,
    pub initial_lr: f64,
    pub lr_decay_gamma: f64,
    pub lr_decay_epochs: usize,
    pub log_steps: usize,
    pub save_checkpoint_steps: Option<usize>,
    pub override_initial_step: Option<usize>,
    pub loss: LossConfig,
    pub eval: Option<EvalSettings>,
    pub dataset_name: String,
}

impl TrainingLoopInit {
    pub fn build(self) -> Result<TrainingLoop> {
        let Self {
            num_classes,
            anchors,
            batch_size,
            epochs,
            initial_lr,
            lr_decay_gamma,
            lr_decay_epochs,
            log_steps,
            save_checkpoint_steps,
            override_initial_step,
            loss,
            eval,
            dataset_name,
        } = self;

        ensure!(batch_size > 0, "batch_size must be positive");
        ensure!(epochs > 0, "epochs must be positive");
        ensure!(initial_lr > 0.0, "initial_lr must be positive");
        ensure!(
            lr_decay_gamma > 0.0 && lr_decay_gamma <= 1.0,
            "lr_decay_gamma must be in (0, 1]"
        );
        ensure!(lr_decay_epochs > 0, "lr_decay_epochs must be positive");
        ensure!(log_steps > 0, "log_steps must be positive");
        ensure!(!anchors.is_empty(), "the anchor set is empty");
        if let Some(steps) = save_checkpoint_steps {
            ensure!(steps > 0, "save_checkpoint_steps must be positive");
        }
        if let Some(eval) = &eval {
            ensure!(
                eval.epochs_per_eval > 0,
                "epochs_per_eval must be positive"
            );
        }

        let profile = LossProfile::from_config(&loss, num_classes, BoxTransform::default())?;

        Ok(TrainingLoop {
            num_classes,
            anchors,
            batch_size,
            epochs,
            initial_lr,
            lr_decay_gamma,
            lr_decay_epochs,
            log_steps,
            save_checkpoint_steps,
            override_initial_step,
            profile,
            eval,
            dataset_name,
        })
    }
}

/// What a finished run reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub iterations_run: usize,
    pub epochs_run: usize,
    pub final_lr: f64,
    /// (epoch, mean AP) per evaluation performed.
    pub evaluations: Vec<(usize, R64)>,
}

#[derive(Debug)]
pub struct TrainingLoop {
    num_classes: usize,
    anchors: Vec<CyCxHw<f32>>,
    batch_size: usize,
    epochs: usize,
    initial_lr: f64,
    lr_decay_gamma: f64,
    lr_decay_epochs: usize,
    log_steps: usize,
    save_checkpoint_steps: Option<usize>,
    override_initial_step: Option<usize>,
    profile: LossProfile,
    eval: Option<EvalSettings>,
    dataset_name: String,
}

impl TrainingLoop {
    pub fn anchors(&self) -> &[CyCxHw<f32>] {
        &self.anchors
    }

    /// Run to completion. Batches are strictly sequential: the
    /// optimizer trigger for one batch happens before the next batch is
    /// fetched.
    pub fn run(
        &self,
        model: &mut dyn Detector,
        optimizer: &mut dyn Optimizer,
        train_data: &mut dyn BatchSource,
        mut val_data: Option<&mut dyn BatchSource>,
        checkpoints: &mut dyn CheckpointStore,
    ) -> Result<TrainingSummary> {
        ensure!(
            model.num_classes() == self.num_classes,
            "model emits {} classes but the loop is configured for {}",
            model.num_classes(),
            self.num_classes
        );
        let epoch_size = train_data.num_images() / self.batch_size;
        ensure!(
            epoch_size > 0,
            "batch_size {} exceeds the dataset size {}",
            self.batch_size,
            train_data.num_images()
        );

        let max_iter = self.epochs * epoch_size;
        let start_iter = self.override_initial_step.unwrap_or(0);
        let mut epoch = start_iter / epoch_size;
        let mut lr = self.decayed_lr(epoch);
        optimizer.set_lr(lr);

        let mut running: Option<BatchLoss> = None;
        let mut running_count = 0usize;
        let mut evaluations = Vec::new();

        info!(
            "training '{}' for {} iterations ({} epochs of {} steps)",
            self.dataset_name, max_iter, self.epochs, epoch_size
        );

        for iteration in start_iter..max_iter {
            // epoch boundary: learning-rate decay, then evaluation
            if iteration != 0 && iteration % epoch_size == 0 {
                epoch += 1;
                lr = self.decayed_lr(epoch);
                optimizer.set_lr(lr);

                if let (Some(eval), Some(val)) = (&self.eval, val_data.as_deref_mut()) {
                    if epoch % eval.epochs_per_eval == 0 {
                        let mean_ap = self.run_evaluation(model, val, eval, epoch)?;
                        evaluations.push((epoch, mean_ap));
                    }
                }
            }

            // the feed restarts transparently when exhausted
            let batch = match train_data.next_batch(self.batch_size) {
                Some(batch) => batch,
                None => {
                    train_data.restart();
                    train_data
                        .next_batch(self.batch_size)
                        .ok_or_else(|| format_err!("the batch source yields no batches"))?
                }
            };

            let predictions = model.forward(&batch)?;
            let loss = self
                .profile
                .forward_batch(&predictions, &self.anchors, &batch.targets)?;
            optimizer.step(loss.total() as f64)?;

            match &mut running {
                Some(acc) => acc.accumulate(&loss),
                None => running = Some(loss),
            }
            running_count += 1;
            if iteration % self.log_steps == 0 {
                if let Some(acc) = running.take() {
                    let mean = acc.scaled(1.0 / running_count as f32);
                    info!(
                        "iter {} || loss: {:.4} || {} || lr {:e}",
                        iteration,
                        mean.total(),
                        mean,
                        lr
                    );
                    running = Some(mean.zero_like());
                    running_count = 0;
                }
            }

            if let Some(steps) = self.save_checkpoint_steps {
                if iteration != 0 && iteration % steps == 0 {
                    checkpoints.save(&CheckpointKey::Iteration(iteration), &model.parameters())?;
                }
            }
        }

        checkpoints.save(
            &CheckpointKey::Tag(self.dataset_name.clone()),
            &model.parameters(),
        )?;

        Ok(TrainingSummary {
            iterations_run: max_iter.saturating_sub(start_iter),
            epochs_run: epoch + 1,
            final_lr: lr,
            evaluations,
        })
    }

    fn decayed_lr(&self, epoch: usize) -> f64 {
        let step = (epoch / self.lr_decay_epochs) as i32;
        self.initial_lr * self.lr_decay_gamma.powi(step)
    }

    /// Decode and score the whole validation set on an independent
    /// evaluation instance of the model.
    fn run_evaluation(
        &self,
        model: &dyn Detector,
        val_data: &mut dyn BatchSource,
        eval: &EvalSettings,
        epoch: usize,
    ) -> Result<R64> {
        info!("starting evaluation at epoch {}", epoch);
        let eval_model = model.eval_instance();

        val_data.restart();
        let mut table = DetectionTable::new();
        let mut truth_by_image: HashMap<usize, Vec<GroundTruth>> = HashMap::new();

        while let Some(batch) = val_data.next_batch(self.batch_size) {
            let predictions = eval_model.forward(&batch)?;

            let per_image: Vec<Vec<Vec<Detection>>> = match &predictions {
                Predictions::SingleStage(outputs) => {
                    ensure!(
                        outputs.len() == batch.len(),
                        "prediction/batch length mismatch"
                    );
                    outputs
                        .iter()
                        .zip(batch.images.iter())
                        .map(|(output, image)| {
                            eval.decoder
                                .decode(output, &self.anchors, image.height, image.width)
                        })
                        .try_collect()?
                }
                Predictions::Refine(outputs) => {
                    ensure!(
                        outputs.len() == batch.len(),
                        "prediction/batch length mismatch"
                    );
                    outputs
                        .iter()
                        .zip(batch.images.iter())
                        .map(|(output, image)| {
                            eval.decoder.decode_refine(
                                output,
                                &self.anchors,
                                image.height,
                                image.width,
                            )
                        })
                        .try_collect()?
                }
            };

            for (image, (per_class, targets)) in batch
                .images
                .iter()
                .zip(per_image.into_iter().zip(batch.targets.iter()))
            {
                for (class, detections) in per_class.into_iter().enumerate().skip(1) {
                    table.insert(class, image.index, detections);
                }
                truth_by_image.insert(image.index, targets.clone());
            }
        }

        let num_images = truth_by_image.keys().max().map(|&ix| ix + 1).unwrap_or(0);
        let mut ground_truth = vec![Vec::new(); num_images];
        for (image, targets) in truth_by_image {
            ground_truth[image] = targets;
        }

        let report = eval
            .ap_calculator
            .evaluate(&table, &ground_truth, self.num_classes);
        for (class, ap) in report.per_class.iter().enumerate().skip(1) {
            if let Some(ap) = ap {
                info!("epoch {} class {} AP {:.4}", epoch, class, ap.raw());
            }
        }
        info!("epoch {} mean AP {:.4}", epoch, report.mean_ap.raw());

        if let Some(dir) = &eval.output_dir {
            fs::create_dir_all(dir)?;
            let path = dir.join(format!("detections_epoch_{:04}.json", epoch));
            fs::write(&path, serde_json::to_string_pretty(&table)?)?;
            info!("wrote detection table {}", path.display());
        }

        Ok(report.mean_ap)
    }
}

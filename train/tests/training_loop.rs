use anyhow::Result;
use approx::assert_abs_diff_eq;
use bbox::Tlbr;
use ssd_dl::{
    anchor::{AnchorGeneratorInit, LevelConfig},
    decode::DetectionDecoderInit,
    label::GroundTruth,
    loss::ApCalculatorInit,
};
use train::{
    config::LossConfig,
    data::{BatchSource, ImageInfo, TrainingBatch},
    model::{BaselineDetector, BaselineOptimizer, Optimizer, ProfileKind},
    train_loop::{EvalSettings, TrainingLoopInit},
    utils::{CheckpointKey, CheckpointStore, ParameterBlob},
};

fn noisy(value: f64) -> noisy_float::types::R64 {
    noisy_float::types::r64(value)
}

/// Fixed in-memory batch source counting its restarts.
struct MemorySource {
    images: Vec<ImageInfo>,
    targets: Vec<Vec<GroundTruth>>,
    cursor: usize,
    restarts: usize,
}

impl MemorySource {
    fn new(num_images: usize) -> Self {
        let images = (0..num_images)
            .map(|index| ImageInfo {
                index,
                height: 300,
                width: 300,
            })
            .collect();
        let targets = (0..num_images)
            .map(|index| {
                if index % 2 == 0 {
                    vec![GroundTruth::try_new(
                        Tlbr::try_new(0.4_f32, 0.4, 0.6, 0.6).unwrap(),
                        1,
                    )
                    .unwrap()]
                } else {
                    Vec::new()
                }
            })
            .collect();
        Self {
            images,
            targets,
            cursor: 0,
            restarts: 0,
        }
    }
}

impl BatchSource for MemorySource {
    fn num_images(&self) -> usize {
        self.images.len()
    }

    fn next_batch(&mut self, batch_size: usize) -> Option<TrainingBatch> {
        if self.cursor >= self.images.len() {
            return None;
        }
        let end = (self.cursor + batch_size).min(self.images.len());
        let batch = TrainingBatch {
            images: self.images[self.cursor..end].to_vec(),
            targets: self.targets[self.cursor..end].to_vec(),
        };
        self.cursor = end;
        Some(batch)
    }

    fn restart(&mut self) {
        self.cursor = 0;
        self.restarts += 1;
    }
}

/// Checkpoint store recording every save in memory.
#[derive(Default)]
struct MemoryCheckpointStore {
    saves: Vec<CheckpointKey>,
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&mut self, key: &CheckpointKey, _blob: &ParameterBlob) -> Result<()> {
        self.saves.push(key.clone());
        Ok(())
    }

    fn load_recent(&mut self) -> Result<Option<ParameterBlob>> {
        Ok(None)
    }
}

/// Optimizer capturing the full learning-rate history.
#[derive(Default)]
struct RecordingOptimizer {
    lr_history: Vec<f64>,
    steps: usize,
}

impl Optimizer for RecordingOptimizer {
    fn step(&mut self, _total_loss: f64) -> Result<()> {
        self.steps += 1;
        Ok(())
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr_history.push(lr);
    }
}

fn tiny_anchors() -> Vec<bbox::CyCxHw<f32>> {
    AnchorGeneratorInit {
        image_size: 300,
        levels: vec![LevelConfig {
            feature_size: 2,
            step: 150,
            min_size: 100.0,
            max_size: None,
            aspect_ratios: vec![],
        }],
        clip: true,
    }
    .build()
    .unwrap()
    .generate()
}

fn loop_init(epochs: usize) -> TrainingLoopInit {
    TrainingLoopInit {
        num_classes: 3,
        anchors: tiny_anchors(),
        batch_size: 2,
        epochs,
        initial_lr: 1e-3,
        lr_decay_gamma: 0.5,
        lr_decay_epochs: 2,
        log_steps: 10,
        save_checkpoint_steps: None,
        override_initial_step: None,
        loss: LossConfig::SingleStage {
            overlap_thresh: noisy(0.5),
            neg_pos_ratio: 3,
        },
        eval: None,
        dataset_name: "memory".into(),
    }
}

#[test]
fn runs_the_configured_iteration_count() {
    let training_loop = loop_init(4).build().unwrap();
    let mut model = BaselineDetector::new(4, 3, ProfileKind::SingleStage).unwrap();
    let mut optimizer = BaselineOptimizer::new();
    let mut source = MemorySource::new(6);
    let mut checkpoints = MemoryCheckpointStore::default();

    let summary = training_loop
        .run(&mut model, &mut optimizer, &mut source, None, &mut checkpoints)
        .unwrap();

    // 4 epochs of 3 steps each
    assert_eq!(summary.iterations_run, 12);
    assert_eq!(optimizer.steps(), 12);
    // every pass after the first restarts the feed
    assert_eq!(source.restarts, 3);
    // the final dataset-tagged checkpoint is always written
    assert_eq!(checkpoints.saves, vec![CheckpointKey::Tag("memory".into())]);
}

#[test]
fn learning_rate_decays_stepwise() {
    let training_loop = loop_init(5).build().unwrap();
    let mut model = BaselineDetector::new(4, 3, ProfileKind::SingleStage).unwrap();
    let mut optimizer = RecordingOptimizer::default();
    let mut source = MemorySource::new(6);
    let mut checkpoints = MemoryCheckpointStore::default();

    training_loop
        .run(&mut model, &mut optimizer, &mut source, None, &mut checkpoints)
        .unwrap();

    // one initial value plus one per epoch boundary
    assert_eq!(optimizer.lr_history.len(), 5);
    let expected = [1e-3, 1e-3, 5e-4, 5e-4, 2.5e-4];
    for (actual, expected) in optimizer.lr_history.iter().zip(expected) {
        assert_abs_diff_eq!(*actual, expected, epsilon = 1e-12);
    }
}

#[test]
fn checkpoints_follow_the_cadence() {
    let mut init = loop_init(4);
    init.save_checkpoint_steps = Some(4);
    let training_loop = init.build().unwrap();
    let mut model = BaselineDetector::new(4, 3, ProfileKind::SingleStage).unwrap();
    let mut optimizer = BaselineOptimizer::new();
    let mut source = MemorySource::new(6);
    let mut checkpoints = MemoryCheckpointStore::default();

    training_loop
        .run(&mut model, &mut optimizer, &mut source, None, &mut checkpoints)
        .unwrap();

    assert_eq!(
        checkpoints.saves,
        vec![
            CheckpointKey::Iteration(4),
            CheckpointKey::Iteration(8),
            CheckpointKey::Tag("memory".into()),
        ]
    );
}

#[test]
fn evaluation_runs_at_epoch_boundaries() {
    let mut init = loop_init(3);
    init.eval = Some(EvalSettings {
        epochs_per_eval: 1,
        decoder: DetectionDecoderInit::new(3).build().unwrap(),
        ap_calculator: ApCalculatorInit::default().build().unwrap(),
        output_dir: None,
    });
    let training_loop = init.build().unwrap();
    let mut model = BaselineDetector::new(4, 3, ProfileKind::SingleStage).unwrap();
    let mut optimizer = BaselineOptimizer::new();
    let mut source = MemorySource::new(6);
    let mut val = MemorySource::new(4);
    let mut checkpoints = MemoryCheckpointStore::default();

    let summary = training_loop
        .run(
            &mut model,
            &mut optimizer,
            &mut source,
            Some(&mut val as &mut dyn BatchSource),
            &mut checkpoints,
        )
        .unwrap();

    // boundaries at epochs 1 and 2; the loop ends before a third
    assert_eq!(summary.evaluations.len(), 2);
    for (_epoch, mean_ap) in &summary.evaluations {
        assert!(*mean_ap >= noisy(0.0) && *mean_ap <= noisy(1.0));
    }
    // evaluation drains the validation source from the start each time
    assert_eq!(val.restarts, 2);
}

#[test]
fn profile_and_predictions_must_agree() {
    let mut init = loop_init(1);
    init.loss = LossConfig::Refine {
        arm_overlap_thresh: noisy(0.5),
        odm_overlap_thresh: noisy(0.5),
        neg_pos_ratio: 3,
        neg_anchor_thresh_train: noisy(0.99),
        neg_anchor_thresh_infer: noisy(0.99),
    };
    let training_loop = init.build().unwrap();
    // the model produces single-stage predictions
    let mut model = BaselineDetector::new(4, 3, ProfileKind::SingleStage).unwrap();
    let mut optimizer = BaselineOptimizer::new();
    let mut source = MemorySource::new(6);
    let mut checkpoints = MemoryCheckpointStore::default();

    let result = training_loop.run(
        &mut model,
        &mut optimizer,
        &mut source,
        None,
        &mut checkpoints,
    );
    assert!(result.is_err());
}

#[test]
fn refine_profile_trains_end_to_end() {
    let mut init = loop_init(2);
    init.loss = LossConfig::Refine {
        arm_overlap_thresh: noisy(0.5),
        odm_overlap_thresh: noisy(0.5),
        neg_pos_ratio: 3,
        neg_anchor_thresh_train: noisy(0.99),
        neg_anchor_thresh_infer: noisy(0.99),
    };
    let training_loop = init.build().unwrap();
    let mut model = BaselineDetector::new(4, 3, ProfileKind::Refine).unwrap();
    let mut optimizer = BaselineOptimizer::new();
    let mut source = MemorySource::new(6);
    let mut checkpoints = MemoryCheckpointStore::default();

    let summary = training_loop
        .run(&mut model, &mut optimizer, &mut source, None, &mut checkpoints)
        .unwrap();
    assert_eq!(summary.iterations_run, 6);
    assert_eq!(optimizer.steps(), 6);
}

//! Training loop
//!
//! Each epoch runs a training pass with gradient updates and a validation
//! pass on the inner backend, closes both phases in the [`LossStore`], logs
//! the progress line, and snapshots the model whenever the aggregate
//! validation loss improves.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use burn::data::dataloader::DataLoaderBuilder;
use burn::data::dataset::Dataset;
use burn::module::AutodiffModule;
use burn::optim::{
    AdamConfig, AdamWConfig, GradientsParams, Optimizer, RmsPropConfig, SgdConfig,
};
use burn::tensor::backend::{AutodiffBackend, Backend};

use super::checkpoint::{BestWeights, RunDir, SaveStrategy};
use super::criterion::{Criterion, CriterionContext, CriterionKind};
use super::curves::save_learning_curves;
use super::loss_store::{LossStore, Phase};
use super::report::log_epoch_loss;
use crate::data::{ClinicalBatch, ClinicalBatcher, ClinicalDataset};
use crate::model::{ClinicalModel, ImageShape, WeightNorms};
use crate::{Config, NervusError, Result, TaskKind, TaskSet};

/// Optimizer names accepted in the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Adam,
    AdamW,
    Sgd,
    RmsProp,
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptimizerKind::Adam => "Adam",
            OptimizerKind::AdamW => "AdamW",
            OptimizerKind::Sgd => "SGD",
            OptimizerKind::RmsProp => "RMSprop",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for OptimizerKind {
    type Err = NervusError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Adam" => Ok(OptimizerKind::Adam),
            "AdamW" => Ok(OptimizerKind::AdamW),
            "SGD" => Ok(OptimizerKind::Sgd),
            "RMSprop" => Ok(OptimizerKind::RmsProp),
            other => Err(NervusError::Configuration(format!(
                "No specified optimizer: {}",
                other
            ))),
        }
    }
}

/// Validated training options
#[derive(Debug, Clone)]
pub struct TrainerSettings {
    pub kind: TaskKind,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub criterion: CriterionKind,
    pub optimizer: OptimizerKind,
    pub save_weight: SaveStrategy,
    pub seed: u64,
}

impl TrainerSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let training = &config.training;
        let criterion: CriterionKind = training.criterion.parse()?;
        criterion.check_task(config.task.kind)?;

        if training.batch_size == 0 {
            return Err(NervusError::Configuration(
                "batch_size must be at least 1".to_string(),
            ));
        }

        Ok(TrainerSettings {
            kind: config.task.kind,
            epochs: training.epochs,
            batch_size: training.batch_size,
            learning_rate: training.learning_rate,
            criterion,
            optimizer: training.optimizer.parse()?,
            save_weight: training.save_weight.parse()?,
            seed: training.seed,
        })
    }
}

/// Result of a training run
pub struct TrainingOutcome<B: AutodiffBackend> {
    /// Model after the last epoch
    pub model: ClinicalModel<B>,
    pub best: BestWeights<B, ClinicalModel<B>>,
    pub losses: LossStore,
}

impl<B: AutodiffBackend> TrainingOutcome<B> {
    /// Write the best weights and the learning curves into the run directory
    pub fn save(&self, run: &RunDir) -> Result<()> {
        let weights = self.best.save(&run.weights(), true)?;
        let curves = save_learning_curves(&self.losses, &run.learning_curves())?;
        log::info!(
            "Best weights: {}; {} learning curves in {}",
            weights.display(),
            curves.len(),
            run.learning_curves().display()
        );
        Ok(())
    }
}

/// Criterion inputs for one batch; survival needs the elapsed time and the
/// network being trained
fn criterion_context<'a, B: Backend>(
    kind: TaskKind,
    batch: &ClinicalBatch<B>,
    network: &'a dyn WeightNorms<B>,
) -> Result<CriterionContext<'a, B>> {
    if !kind.is_survival() {
        return Ok(CriterionContext::empty());
    }
    let period = batch.period.clone().ok_or_else(|| {
        NervusError::MissingData("survival batch without elapsed time".to_string())
    })?;
    Ok(CriterionContext::survival(period, network))
}

/// Trainer for a clinical multi-task model
pub struct Trainer<B: AutodiffBackend> {
    model: ClinicalModel<B>,
    settings: TrainerSettings,
    tasks: TaskSet,
    image_shape: ImageShape,
    /// Where `each` snapshots are written during training
    weights_dir: Option<PathBuf>,
    device: B::Device,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(
        model: ClinicalModel<B>,
        settings: TrainerSettings,
        tasks: TaskSet,
        image_shape: ImageShape,
        device: B::Device,
    ) -> Self {
        Trainer {
            model,
            settings,
            tasks,
            image_shape,
            weights_dir: None,
            device,
        }
    }

    pub fn with_weights_dir(mut self, dir: PathBuf) -> Self {
        self.weights_dir = Some(dir);
        self
    }

    /// Train with the configured optimizer
    pub fn train(
        self,
        train_dataset: ClinicalDataset,
        val_dataset: ClinicalDataset,
    ) -> Result<TrainingOutcome<B>> {
        match self.settings.optimizer {
            OptimizerKind::Adam => {
                let optimizer = AdamConfig::new().init();
                self.fit(optimizer, train_dataset, val_dataset)
            }
            OptimizerKind::AdamW => {
                let optimizer = AdamWConfig::new().init();
                self.fit(optimizer, train_dataset, val_dataset)
            }
            OptimizerKind::Sgd => {
                let optimizer = SgdConfig::new().init();
                self.fit(optimizer, train_dataset, val_dataset)
            }
            OptimizerKind::RmsProp => {
                let optimizer = RmsPropConfig::new().init();
                self.fit(optimizer, train_dataset, val_dataset)
            }
        }
    }

    /// Train with a given optimizer
    pub fn fit<O: Optimizer<ClinicalModel<B>, B>>(
        mut self,
        mut optimizer: O,
        train_dataset: ClinicalDataset,
        val_dataset: ClinicalDataset,
    ) -> Result<TrainingOutcome<B>> {
        let train_size = train_dataset.len();
        let val_size = val_dataset.len();

        let batcher_train =
            ClinicalBatcher::<B>::new(self.device.clone(), &self.tasks, self.image_shape);
        let batcher_val = ClinicalBatcher::<B::InnerBackend>::new(
            self.device.clone(),
            &self.tasks,
            self.image_shape,
        );

        let train_loader = DataLoaderBuilder::new(batcher_train)
            .batch_size(self.settings.batch_size)
            .shuffle(self.settings.seed)
            .build(train_dataset);

        let val_loader = DataLoaderBuilder::new(batcher_val)
            .batch_size(self.settings.batch_size)
            .build(val_dataset);

        let criterion = self.settings.criterion.build::<B>();
        let val_criterion = self.settings.criterion.build::<B::InnerBackend>();

        let mut losses = LossStore::new(&self.tasks);
        let mut best = BestWeights::new();

        log::info!(
            "Starting training for {} epochs ({} train / {} val samples, {}, {})",
            self.settings.epochs,
            train_size,
            val_size,
            self.settings.criterion,
            self.settings.optimizer
        );

        for epoch in 0..self.settings.epochs {
            for batch in train_loader.iter() {
                self.train_step(&mut optimizer, &batch, criterion.as_ref(), &mut losses)?;
            }
            losses.finalize_epoch(epoch, Phase::Train, Some(train_size))?;

            let model = self.model.valid();
            for batch in val_loader.iter() {
                let outputs = model.forward(batch.inputs())?;
                let context = criterion_context(self.settings.kind, &batch, &model)?;
                losses.compute_batch_loss(
                    &outputs,
                    &batch.labels,
                    val_criterion.as_ref(),
                    &context,
                )?;
                losses.accumulate_running_loss(Some(batch.size))?;
            }
            losses.finalize_epoch(epoch, Phase::Validation, Some(val_size))?;

            log_epoch_loss(&losses, self.settings.epochs, epoch)?;

            if losses.is_total_val_loss_updated() {
                best.store(&self.model, epoch);
                if let (SaveStrategy::Each, Some(dir)) =
                    (self.settings.save_weight, &self.weights_dir)
                {
                    best.save(dir, false)?;
                }
            }
        }

        Ok(TrainingOutcome {
            model: self.model,
            best,
            losses,
        })
    }

    /// Forward, loss, backward and optimizer step for one batch
    fn train_step<O: Optimizer<ClinicalModel<B>, B>>(
        &mut self,
        optimizer: &mut O,
        batch: &ClinicalBatch<B>,
        criterion: &dyn Criterion<B>,
        losses: &mut LossStore,
    ) -> Result<()> {
        let outputs = self.model.forward(batch.inputs())?;
        let context = criterion_context(self.settings.kind, batch, &self.model)?;
        let loss = losses.compute_batch_loss(&outputs, &batch.labels, criterion, &context)?;

        // Backward pass
        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &self.model);

        // Update weights
        self.model = optimizer.step(self.settings.learning_rate, self.model.clone(), grads);

        losses.accumulate_running_loss(Some(batch.size))
    }

    /// Get the current model
    pub fn model(&self) -> &ClinicalModel<B> {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{synthetic_samples, SyntheticConfig};
    use crate::model::{build_model, ModelSpec};
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray<f32>>;

    const SHAPE: ImageShape = ImageShape {
        channels: 1,
        size: 16,
    };

    fn settings(kind: TaskKind, criterion: CriterionKind) -> TrainerSettings {
        TrainerSettings {
            kind,
            epochs: 2,
            batch_size: 8,
            learning_rate: 1e-3,
            criterion,
            optimizer: OptimizerKind::Adam,
            save_weight: SaveStrategy::Best,
            seed: 1,
        }
    }

    fn datasets(kind: TaskKind, tasks: &TaskSet) -> (ClinicalDataset, ClinicalDataset) {
        let config = SyntheticConfig {
            num_samples: 40,
            num_inputs: 5,
            image: None,
            kind,
            seed: 11,
        };
        ClinicalDataset::new(synthetic_samples(&config, tasks), tasks)
            .unwrap()
            .split(0.75, 2)
    }

    fn trainer(kind: TaskKind, criterion: CriterionKind, tasks: &TaskSet) -> Trainer<TestBackend> {
        let device = Default::default();
        let spec = ModelSpec::parse("MLP").unwrap();
        let model = build_model(&device, kind, &spec, tasks, 5, SHAPE).unwrap();
        Trainer::new(model, settings(kind, criterion), tasks.clone(), SHAPE, device)
    }

    #[test]
    fn test_optimizer_names() {
        for name in ["Adam", "AdamW", "SGD", "RMSprop"] {
            assert_eq!(name.parse::<OptimizerKind>().unwrap().to_string(), name);
        }
        assert!("Adadelta".parse::<OptimizerKind>().is_err());
    }

    #[test]
    fn test_settings_reject_mismatched_criterion() {
        let mut config = Config::default();
        config.training.criterion = "NLL".to_string();
        assert!(matches!(
            TrainerSettings::from_config(&config),
            Err(NervusError::Configuration(_))
        ));

        config.training.criterion = "CEL".to_string();
        let settings = TrainerSettings::from_config(&config).unwrap();
        assert_eq!(settings.optimizer, OptimizerKind::Adam);
        assert_eq!(settings.save_weight, SaveStrategy::Best);
    }

    #[test]
    fn test_classification_training_records_every_epoch() {
        let tasks = TaskSet::from_pairs([("grade", 3), ("malignant", 2)]).unwrap();
        let (train, val) = datasets(TaskKind::Classification, &tasks);

        let outcome = trainer(TaskKind::Classification, CriterionKind::CrossEntropy, &tasks)
            .train(train, val)
            .unwrap();

        let total = outcome.losses.total();
        assert_eq!(total.history(Phase::Train).len(), 2);
        assert_eq!(total.history(Phase::Validation).len(), 2);
        assert_eq!(outcome.best.epoch(), total.best_epoch());
        assert!(outcome.best.model().is_some());
    }

    #[test]
    fn test_survival_training_and_saving() {
        let tasks = TaskSet::from_pairs([("death", 1)]).unwrap();
        let (train, val) = datasets(TaskKind::Survival, &tasks);
        let dir = tempfile::tempdir().unwrap();

        let mut trainer = trainer(
            TaskKind::Survival,
            CriterionKind::NegativeLogLikelihood,
            &tasks,
        );
        trainer.settings.save_weight = SaveStrategy::Each;
        trainer.settings.optimizer = OptimizerKind::Sgd;
        let run = RunDir::at(dir.path().join("run")).unwrap();
        let outcome = trainer
            .with_weights_dir(run.weights())
            .train(train, val)
            .unwrap();

        outcome.save(&run).unwrap();
        let best_epoch = outcome.losses.total().display_best_epoch().unwrap();
        let best_file = run
            .weights()
            .join(format!("weight_epoch-{:03}_best.mpk", best_epoch));
        assert!(best_file.exists());
        assert_eq!(std::fs::read_dir(run.learning_curves()).unwrap().count(), 2);
    }

    #[test]
    fn test_empty_validation_set_is_reported() {
        let tasks = TaskSet::from_pairs([("grade", 3)]).unwrap();
        let (train, _) = datasets(TaskKind::Classification, &tasks);
        let empty = ClinicalDataset::new(Vec::new(), &tasks).unwrap();

        let result = trainer(TaskKind::Classification, CriterionKind::CrossEntropy, &tasks)
            .train(train, empty);
        assert!(matches!(result, Err(NervusError::MissingData(_))));
    }
}

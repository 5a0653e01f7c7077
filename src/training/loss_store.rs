//! Per-task loss bookkeeping
//!
//! Losses flow through three stages. A batch loss is computed per task, the
//! running loss accumulates it weighted by batch size, and at the end of each
//! phase the epoch loss divides by the dataset size. Validation epochs also
//! update the best epoch of every task and of the aggregate `total`.

use std::fmt;
use std::str::FromStr;

use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor};

use super::criterion::{Criterion, CriterionContext};
use crate::data::TaskLabels;
use crate::model::TaskOutputs;
use crate::{NervusError, Result, TaskSet, TOTAL_KEY};

/// Phase of an epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Validation,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Train => write!(f, "train"),
            Phase::Validation => write!(f, "val"),
        }
    }
}

impl FromStr for Phase {
    type Err = NervusError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(Phase::Train),
            "val" | "validation" => Ok(Phase::Validation),
            other => Err(NervusError::UnknownPhase(other.to_string())),
        }
    }
}

/// Loss history and best validation epoch of one task (or `total`)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpochLoss {
    train: Vec<f64>,
    val: Vec<f64>,
    best_val_loss: Option<f64>,
    /// 0-based
    best_epoch: Option<usize>,
    updated: bool,
}

impl EpochLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self, phase: Phase) -> &[f64] {
        match phase {
            Phase::Train => &self.train,
            Phase::Validation => &self.val,
        }
    }

    pub fn latest(&self, phase: Phase) -> Option<f64> {
        self.history(phase).last().copied()
    }

    pub fn best_val_loss(&self) -> Option<f64> {
        self.best_val_loss
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    /// Best epoch counted from 1, as shown to users and in file names
    pub fn display_best_epoch(&self) -> Option<usize> {
        self.best_epoch.map(|e| e + 1)
    }

    /// Whether the latest validation epoch improved the best loss
    pub fn is_updated(&self) -> bool {
        self.updated
    }

    fn append(&mut self, phase: Phase, loss: f64) {
        match phase {
            Phase::Train => self.train.push(loss),
            Phase::Validation => self.val.push(loss),
        }
    }

    /// Compare the latest validation loss with the best so far.
    ///
    /// The first epoch always becomes the best; later epochs must be strictly
    /// lower to replace it. A NaN loss never does, and any number replaces a
    /// NaN best.
    fn check_best(&mut self, epoch: usize) {
        let Some(latest) = self.latest(Phase::Validation) else {
            return;
        };
        let improved = match self.best_val_loss {
            Some(best) if epoch > 0 => latest < best || (best.is_nan() && !latest.is_nan()),
            _ => true,
        };
        if improved {
            self.best_val_loss = Some(latest);
            self.best_epoch = Some(epoch);
        }
        self.updated = improved;
    }
}

/// Batch, running and epoch losses for every task of a run
#[derive(Debug, Clone)]
pub struct LossStore {
    tasks: Vec<String>,
    batch: Vec<Option<f64>>,
    batch_total: Option<f64>,
    running: Vec<f64>,
    running_total: f64,
    epoch: Vec<EpochLoss>,
    epoch_total: EpochLoss,
}

impl LossStore {
    pub fn new(tasks: &TaskSet) -> Self {
        let n = tasks.len();
        LossStore {
            tasks: tasks.names().map(String::from).collect(),
            batch: vec![None; n],
            batch_total: None,
            running: vec![0.0; n],
            running_total: 0.0,
            epoch: vec![EpochLoss::new(); n],
            epoch_total: EpochLoss::new(),
        }
    }

    pub fn tasks(&self) -> &[String] {
        &self.tasks
    }

    /// Evaluate the criterion for every task and keep the per-task values.
    ///
    /// Returns the sum over tasks, which is what gets backpropagated. Nothing
    /// is stored unless every task has a prediction, a label and a loss.
    pub fn compute_batch_loss<B: Backend>(
        &mut self,
        outputs: &TaskOutputs<B>,
        labels: &TaskLabels<B>,
        criterion: &dyn Criterion<B>,
        context: &CriterionContext<'_, B>,
    ) -> Result<Tensor<B, 1>> {
        let mut losses = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let prediction = outputs.for_task(task).ok_or_else(|| {
                NervusError::MissingData(format!("no prediction for task '{}'", task))
            })?;
            let label = labels
                .get(task)
                .ok_or_else(|| NervusError::MissingData(format!("no label for task '{}'", task)))?;
            losses.push(criterion.loss(prediction.clone(), label.clone(), context)?);
        }

        let values: Vec<f64> = losses
            .iter()
            .map(|loss| loss.clone().into_scalar().elem::<f64>())
            .collect();
        let total = losses
            .into_iter()
            .reduce(|acc, loss| acc + loss)
            .ok_or_else(|| NervusError::MissingData("no tasks to compute loss for".to_string()))?;

        self.batch_total = Some(values.iter().sum());
        self.batch = values.into_iter().map(Some).collect();
        Ok(total)
    }

    /// Add the current batch losses, weighted by `batch_size`.
    ///
    /// `running_total` re-adds each task's cumulative running value on every
    /// call. It is kept for inspection only; epoch totals are recomputed
    /// from the per-task values.
    pub fn accumulate_running_loss(&mut self, batch_size: Option<usize>) -> Result<()> {
        let batch_size = batch_size.ok_or_else(|| {
            NervusError::MissingData("Invalid batch_size: batch_size=None".to_string())
        })?;
        let batch: Vec<f64> = self
            .tasks
            .iter()
            .zip(&self.batch)
            .map(|(task, loss)| {
                loss.ok_or_else(|| {
                    NervusError::MissingData(format!("no batch loss for task '{}'", task))
                })
            })
            .collect::<Result<_>>()?;

        for (running, loss) in self.running.iter_mut().zip(batch) {
            *running += loss * batch_size as f64;
            self.running_total += *running;
        }
        Ok(())
    }

    /// Close a phase: append per-task epoch losses and their mean as `total`,
    /// update best epochs after validation, then reset batch and running loss.
    pub fn finalize_epoch(
        &mut self,
        epoch: usize,
        phase: Phase,
        dataset_size: Option<usize>,
    ) -> Result<()> {
        let dataset_size = match dataset_size {
            Some(0) | None => {
                return Err(NervusError::MissingData(format!(
                    "Invalid dataset_size: {:?}",
                    dataset_size
                )))
            }
            Some(n) => n as f64,
        };

        let mut sum = 0.0;
        for (epoch_loss, running) in self.epoch.iter_mut().zip(&self.running) {
            let loss = running / dataset_size;
            epoch_loss.append(phase, loss);
            sum += loss;
        }
        self.epoch_total.append(phase, sum / self.tasks.len() as f64);

        if phase == Phase::Validation {
            for epoch_loss in self.epoch.iter_mut() {
                epoch_loss.check_best(epoch);
            }
            self.epoch_total.check_best(epoch);
        }

        self.reset();
        Ok(())
    }

    fn reset(&mut self) {
        self.batch.iter_mut().for_each(|b| *b = None);
        self.batch_total = None;
        self.running.iter_mut().for_each(|r| *r = 0.0);
        self.running_total = 0.0;
    }

    fn index(&self, task: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t == task)
    }

    /// Latest batch loss of a task or of `total`
    pub fn batch_loss(&self, key: &str) -> Option<f64> {
        if key == TOTAL_KEY {
            return self.batch_total;
        }
        self.index(key).and_then(|i| self.batch[i])
    }

    pub fn running_loss(&self, task: &str) -> Option<f64> {
        self.index(task).map(|i| self.running[i])
    }

    pub fn running_total(&self) -> f64 {
        self.running_total
    }

    /// Epoch history of a task or of `total`
    pub fn epoch_loss(&self, key: &str) -> Option<&EpochLoss> {
        if key == TOTAL_KEY {
            return Some(&self.epoch_total);
        }
        self.index(key).map(|i| &self.epoch[i])
    }

    pub fn total(&self) -> &EpochLoss {
        &self.epoch_total
    }

    pub fn is_total_val_loss_updated(&self) -> bool {
        self.epoch_total.is_updated()
    }

    /// Every task in order, then `total`
    pub fn iter(&self) -> impl Iterator<Item = (&str, &EpochLoss)> {
        self.tasks
            .iter()
            .map(String::as_str)
            .zip(self.epoch.iter())
            .chain(std::iter::once((TOTAL_KEY, &self.epoch_total)))
    }
}

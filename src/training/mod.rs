//! Model training
//!
//! Criteria, per-task loss bookkeeping, the training loop, and the files a
//! run leaves behind (weights and learning curves).

pub mod checkpoint;
pub mod criterion;
pub mod curves;
pub mod loss_store;
pub mod report;
pub mod trainer;

pub use checkpoint::{BestWeights, RunDir, SaveStrategy};
pub use criterion::{Criterion, CriterionContext, CriterionKind};
pub use loss_store::{EpochLoss, LossStore, Phase};
pub use report::{format_epoch_loss, log_epoch_loss};
pub use trainer::{OptimizerKind, Trainer, TrainerSettings, TrainingOutcome};

//! Per-sample likelihood export
//!
//! Runs a trained model over labelled samples and keeps, for every sample,
//! its split, its labels and each head's output. Classification heads are
//! reported as softmax probabilities (`pred_<task>_<class>`); regression and
//! survival heads as the raw value (`pred_<task>`).

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use burn::data::dataloader::batcher::Batcher;
use burn::tensor::activation::softmax;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use csv::WriterBuilder;

use super::roc::{roc_curve, RocCurve};
use crate::data::{ClinicalBatcher, ClinicalDataset};
use crate::model::{ClinicalModel, ImageShape};
use crate::training::checkpoint::load_weights;
use crate::{NervusError, Result, TaskKind, TaskSet};

/// Dataset split a likelihood row came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Validation => write!(f, "val"),
            Split::Test => write!(f, "test"),
        }
    }
}

impl FromStr for Split {
    type Err = NervusError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(Split::Train),
            "val" | "validation" => Ok(Split::Validation),
            "test" => Ok(Split::Test),
            other => Err(NervusError::Configuration(format!(
                "Invalid split: {} (expected train, val or test)",
                other
            ))),
        }
    }
}

/// Model output for one sample
#[derive(Debug, Clone, PartialEq)]
pub struct LikelihoodRow {
    pub split: Split,
    /// Position within its split
    pub sample: usize,
    /// One label per task, in task order
    pub labels: Vec<f32>,
    pub period: Option<f32>,
    /// One output vector per task, in task order
    pub predictions: Vec<Vec<f32>>,
}

/// Likelihood table of one evaluation
#[derive(Debug, Clone)]
pub struct Likelihood {
    kind: TaskKind,
    tasks: TaskSet,
    rows: Vec<LikelihoodRow>,
}

impl Likelihood {
    pub fn new(kind: TaskKind, tasks: &TaskSet) -> Self {
        Likelihood {
            kind,
            tasks: tasks.clone(),
            rows: Vec::new(),
        }
    }

    pub fn extend(&mut self, rows: Vec<LikelihoodRow>) {
        self.rows.extend(rows);
    }

    pub fn rows(&self) -> &[LikelihoodRow] {
        &self.rows
    }

    /// `split,sample,label_<task>...,[period,]pred_...`
    pub fn header(&self) -> Vec<String> {
        let mut header = vec!["split".to_string(), "sample".to_string()];
        header.extend(self.tasks.names().map(|t| format!("label_{}", t)));
        if self.kind.is_survival() {
            header.push("period".to_string());
        }
        for task in self.tasks.iter() {
            match self.kind {
                TaskKind::Classification => header
                    .extend((0..task.num_outputs).map(|c| format!("pred_{}_{}", task.name, c))),
                TaskKind::Regression | TaskKind::Survival => {
                    header.push(format!("pred_{}", task.name))
                }
            }
        }
        header
    }

    fn record(&self, row: &LikelihoodRow) -> Vec<String> {
        let mut record = vec![row.split.to_string(), row.sample.to_string()];
        record.extend(row.labels.iter().map(|l| l.to_string()));
        if self.kind.is_survival() {
            record.push(row.period.map(|p| p.to_string()).unwrap_or_default());
        }
        for prediction in &row.predictions {
            record.extend(prediction.iter().map(|p| p.to_string()));
        }
        record
    }

    /// Write the table as CSV
    pub fn save(&self, path: &Path) -> Result<PathBuf> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        writer.write_record(self.header())?;
        for row in &self.rows {
            writer.write_record(self.record(row))?;
        }
        writer.flush()?;
        log::info!("Saved {} likelihood rows to {}", self.rows.len(), path.display());
        Ok(path.to_path_buf())
    }

    /// ROC of a binary classification task on one split, scored by the
    /// probability of class 1. `None` when the split lacks either class.
    pub fn roc(&self, task: &str, split: Split) -> Result<Option<RocCurve>> {
        let position = self
            .tasks
            .position(task)
            .ok_or_else(|| NervusError::MissingData(format!("no task '{}'", task)))?;
        let binary = self.kind == TaskKind::Classification
            && self.tasks.get(task).is_some_and(|t| t.num_outputs == 2);
        if !binary {
            return Err(NervusError::Configuration(format!(
                "ROC needs a binary classification task, '{}' is not",
                task
            )));
        }

        let scores = self
            .rows
            .iter()
            .filter(|row| row.split == split)
            .filter_map(|row| {
                let score = row.predictions.get(position)?.get(1)?;
                let label = row.labels.get(position)?;
                Some((*score as f64, *label >= 0.5))
            });
        Ok(roc_curve(scores))
    }

    /// Names of the tasks an ROC can be drawn for
    pub fn binary_tasks(&self) -> Vec<&str> {
        if self.kind != TaskKind::Classification {
            return Vec::new();
        }
        self.tasks
            .iter()
            .filter(|t| t.num_outputs == 2)
            .map(|t| t.name.as_str())
            .collect()
    }
}

/// Runs a trained model over datasets to fill a [`Likelihood`]
pub struct Predictor<B: Backend> {
    model: ClinicalModel<B>,
    kind: TaskKind,
    tasks: TaskSet,
    image_shape: ImageShape,
    batch_size: usize,
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    pub fn new(
        model: ClinicalModel<B>,
        kind: TaskKind,
        tasks: TaskSet,
        image_shape: ImageShape,
        batch_size: usize,
        device: B::Device,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(NervusError::Configuration(
                "batch_size must be at least 1".to_string(),
            ));
        }
        Ok(Predictor {
            model,
            kind,
            tasks,
            image_shape,
            batch_size,
            device,
        })
    }

    /// Load saved weights into `model`, a freshly built model of the same
    /// architecture
    pub fn load(
        model: ClinicalModel<B>,
        weights: &Path,
        kind: TaskKind,
        tasks: TaskSet,
        image_shape: ImageShape,
        batch_size: usize,
        device: B::Device,
    ) -> Result<Self> {
        let model = load_weights(model, weights, &device)?;
        log::info!("Loaded weights from {}", weights.display());
        Self::new(model, kind, tasks, image_shape, batch_size, device)
    }

    pub fn model(&self) -> &ClinicalModel<B> {
        &self.model
    }

    /// Predict every sample of `dataset`, in dataset order
    pub fn predict(&self, dataset: &ClinicalDataset, split: Split) -> Result<Vec<LikelihoodRow>> {
        let batcher = ClinicalBatcher::<B>::new(self.device.clone(), &self.tasks, self.image_shape);
        let mut rows = Vec::with_capacity(dataset.samples().len());

        for chunk in dataset.samples().chunks(self.batch_size) {
            let batch = batcher.batch(chunk.to_vec(), &self.device);
            let outputs = self.model.forward(batch.inputs())?;

            let mut labels = Vec::with_capacity(self.tasks.len());
            let mut predictions = Vec::with_capacity(self.tasks.len());
            for task in self.tasks.iter() {
                let label = batch.labels.get(&task.name).ok_or_else(|| {
                    NervusError::MissingData(format!("no label for task '{}'", task.name))
                })?;
                let output = outputs.for_task(&task.name).ok_or_else(|| {
                    NervusError::MissingData(format!("no prediction for task '{}'", task.name))
                })?;
                labels.push(values(label.clone()));
                predictions.push(self.per_sample(output.clone()));
            }
            let periods = batch.period.map(values);

            for i in 0..batch.size {
                rows.push(LikelihoodRow {
                    split,
                    sample: rows.len(),
                    labels: labels.iter().map(|l| l[i]).collect(),
                    period: periods.as_ref().map(|p| p[i]),
                    predictions: predictions.iter().map(|p| p[i].clone()).collect(),
                });
            }
        }

        log::debug!("Predicted {} {} samples", rows.len(), split);
        Ok(rows)
    }

    /// Split a [batch, k] head output into one vector per sample
    fn per_sample(&self, output: Tensor<B, 2>) -> Vec<Vec<f32>> {
        let [_, width] = output.dims();
        let output = match self.kind {
            TaskKind::Classification => softmax(output, 1),
            TaskKind::Regression | TaskKind::Survival => output,
        };
        let flat: Vec<f32> = output.into_data().iter::<f32>().collect();
        flat.chunks(width).map(<[f32]>::to_vec).collect()
    }
}

fn values<B: Backend>(tensor: Tensor<B, 1>) -> Vec<f32> {
    tensor.into_data().iter::<f32>().collect()
}

//! Burn Dataset implementation for clinical samples

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::model::{ImageShape, ModelInputs};
use crate::{NervusError, Result, TaskSet};

/// One patient record
#[derive(Debug, Clone, PartialEq)]
pub struct ClinicalSample {
    /// Tabular inputs; empty for image-only data
    pub tabular: Vec<f32>,
    /// Image in CHW order, flattened
    pub image: Option<Vec<f32>>,
    /// One label per task, in task order: class index, target value or
    /// event indicator
    pub labels: Vec<f32>,
    /// Time to event or censoring (survival only)
    pub period: Option<f32>,
}

/// In-memory dataset of clinical samples
#[derive(Debug, Clone)]
pub struct ClinicalDataset {
    samples: Vec<ClinicalSample>,
}

impl ClinicalDataset {
    /// Build a dataset, checking that every sample carries one label per task
    pub fn new(samples: Vec<ClinicalSample>, tasks: &TaskSet) -> Result<Self> {
        if let Some((i, sample)) = samples
            .iter()
            .enumerate()
            .find(|(_, s)| s.labels.len() != tasks.len())
        {
            return Err(NervusError::MissingData(format!(
                "sample #{} has {} labels for {} tasks",
                i,
                sample.labels.len(),
                tasks.len()
            )));
        }
        Ok(ClinicalDataset { samples })
    }

    pub fn samples(&self) -> &[ClinicalSample] {
        &self.samples
    }

    /// Shuffle with a seed and split into (train, val)
    pub fn split(self, train_ratio: f32, seed: u64) -> (Self, Self) {
        let mut samples = self.samples;
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        samples.shuffle(&mut rng);

        let split_idx = (samples.len() as f32 * train_ratio) as usize;
        let val_samples = samples.split_off(split_idx);

        log::info!(
            "Split {} samples: train={}, val={}",
            samples.len() + val_samples.len(),
            samples.len(),
            val_samples.len()
        );

        (
            ClinicalDataset { samples },
            ClinicalDataset {
                samples: val_samples,
            },
        )
    }
}

impl Dataset<ClinicalSample> for ClinicalDataset {
    fn get(&self, index: usize) -> Option<ClinicalSample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Labels of one batch keyed by task name, in task order
#[derive(Debug, Clone)]
pub struct TaskLabels<B: Backend> {
    labels: Vec<(String, Tensor<B, 1>)>,
}

impl<B: Backend> TaskLabels<B> {
    pub fn new(labels: Vec<(String, Tensor<B, 1>)>) -> Self {
        TaskLabels { labels }
    }

    pub fn get(&self, task: &str) -> Option<&Tensor<B, 1>> {
        self.labels.iter().find(|(t, _)| t == task).map(|(_, l)| l)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor<B, 1>)> {
        self.labels.iter().map(|(t, l)| (t.as_str(), l))
    }
}

/// Batch of clinical samples
#[derive(Debug, Clone)]
pub struct ClinicalBatch<B: Backend> {
    /// [batch, num_inputs]
    pub tabular: Option<Tensor<B, 2>>,
    /// [batch, channels, size, size]
    pub image: Option<Tensor<B, 4>>,
    pub labels: TaskLabels<B>,
    /// [batch]
    pub period: Option<Tensor<B, 1>>,
    pub size: usize,
}

impl<B: Backend> ClinicalBatch<B> {
    pub fn inputs(&self) -> ModelInputs<B> {
        ModelInputs {
            tabular: self.tabular.clone(),
            image: self.image.clone(),
        }
    }
}

/// Batcher for creating training batches
#[derive(Clone)]
pub struct ClinicalBatcher<B: Backend> {
    device: B::Device,
    tasks: Vec<String>,
    image_shape: ImageShape,
}

impl<B: Backend> ClinicalBatcher<B> {
    pub fn new(device: B::Device, tasks: &TaskSet, image_shape: ImageShape) -> Self {
        ClinicalBatcher {
            device,
            tasks: tasks.names().map(String::from).collect(),
            image_shape,
        }
    }
}

impl<B: Backend> Batcher<B, ClinicalSample, ClinicalBatch<B>> for ClinicalBatcher<B> {
    fn batch(&self, items: Vec<ClinicalSample>, _device: &B::Device) -> ClinicalBatch<B> {
        let batch_size = items.len();
        let num_inputs = items.first().map(|s| s.tabular.len()).unwrap_or(0);
        let ImageShape { channels, size } = self.image_shape;

        let mut tabular_data = Vec::with_capacity(batch_size * num_inputs);
        let mut image_data = Vec::with_capacity(batch_size * channels * size * size);
        let mut label_data = vec![Vec::with_capacity(batch_size); self.tasks.len()];
        let mut period_data = Vec::with_capacity(batch_size);
        let mut has_image = batch_size > 0;
        let mut has_period = batch_size > 0;

        for sample in &items {
            tabular_data.extend_from_slice(&sample.tabular);
            match &sample.image {
                Some(image) => image_data.extend_from_slice(image),
                None => has_image = false,
            }
            match sample.period {
                Some(period) => period_data.push(period),
                None => has_period = false,
            }
            for (column, label) in label_data.iter_mut().zip(&sample.labels) {
                column.push(*label);
            }
        }

        let tabular = (num_inputs > 0).then(|| {
            Tensor::<B, 1>::from_floats(tabular_data.as_slice(), &self.device)
                .reshape([batch_size, num_inputs])
        });

        let image = has_image.then(|| {
            Tensor::<B, 1>::from_floats(image_data.as_slice(), &self.device)
                .reshape([batch_size, channels, size, size])
        });

        let period = has_period
            .then(|| Tensor::<B, 1>::from_floats(period_data.as_slice(), &self.device));

        let labels = self
            .tasks
            .iter()
            .zip(label_data)
            .map(|(task, column)| {
                (
                    task.clone(),
                    Tensor::<B, 1>::from_floats(column.as_slice(), &self.device),
                )
            })
            .collect();

        ClinicalBatch {
            tabular,
            image,
            labels: TaskLabels::new(labels),
            period,
            size: batch_size,
        }
    }
}

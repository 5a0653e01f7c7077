//! Multi-task network composed from a single-output backbone
//!
//! The backbone's projection is detached and replaced by one head per task.
//! Heads are built in task order and named `<prefix><task>`, where the prefix
//! depends on where the backbone kept its projection.

use burn::module::{Ignored, Module};
use burn::nn::{Dropout, DropoutConfig, LayerNorm, Linear, LinearConfig};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::backbone::{linear_norm, Backbone, BackboneInput, HeadLayout, WeightNorms};
use crate::{NervusError, Result, TaskSet};

/// Per-task output stage: optional dropout then projection
#[derive(Module, Debug)]
pub struct TaskHead<B: Backend> {
    dropout: Option<Dropout>,
    fc: Linear<B>,
}

impl<B: Backend> TaskHead<B> {
    pub fn new(device: &B::Device, layout: &HeadLayout<B>, num_outputs: usize) -> Self {
        TaskHead {
            dropout: layout.dropout.map(|p| DropoutConfig::new(p).init()),
            fc: LinearConfig::new(layout.input_dim, num_outputs).init(device),
        }
    }

    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = match &self.dropout {
            Some(dropout) => dropout.forward(features),
            None => features,
        };
        self.fc.forward(x)
    }

    pub fn num_outputs(&self) -> usize {
        self.fc.weight.val().dims()[1]
    }
}

/// One head's prediction
#[derive(Debug, Clone)]
pub struct TaskOutput<B: Backend> {
    pub task: String,
    pub head: String,
    /// [batch, num_outputs]
    pub prediction: Tensor<B, 2>,
}

/// Predictions of every head, in task order
#[derive(Debug, Clone)]
pub struct TaskOutputs<B: Backend> {
    outputs: Vec<TaskOutput<B>>,
}

impl<B: Backend> TaskOutputs<B> {
    pub fn new(outputs: Vec<TaskOutput<B>>) -> Self {
        TaskOutputs { outputs }
    }

    /// Prediction by head name, e.g. `fc_grade`
    pub fn get(&self, head: &str) -> Option<&Tensor<B, 2>> {
        self.outputs
            .iter()
            .find(|o| o.head == head)
            .map(|o| &o.prediction)
    }

    /// Prediction by task name, e.g. `grade`
    pub fn for_task(&self, task: &str) -> Option<&Tensor<B, 2>> {
        self.outputs
            .iter()
            .find(|o| o.task == task)
            .map(|o| &o.prediction)
    }

    pub fn head_names(&self) -> Vec<&str> {
        self.outputs.iter().map(|o| o.head.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskOutput<B>> {
        self.outputs.iter()
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

/// Shared backbone with one head per task
#[derive(Module, Debug)]
pub struct MultiTaskNet<B: Backend> {
    backbone: Backbone<B>,
    /// Evaluated once per forward, ahead of every head
    shared_prefix: Option<LayerNorm<B>>,
    heads: Vec<TaskHead<B>>,
    tasks: Ignored<Vec<String>>,
    head_names: Ignored<Vec<String>>,
}

impl<B: Backend> MultiTaskNet<B> {
    /// Detach the backbone's projection and attach one head per task
    pub fn compose(device: &B::Device, mut backbone: Backbone<B>, tasks: &TaskSet) -> Result<Self> {
        if tasks.is_empty() {
            return Err(NervusError::Configuration(
                "cannot compose a multi-task network without tasks".to_string(),
            ));
        }

        let layout = backbone.detach_head()?;
        let heads = tasks
            .iter()
            .map(|task| TaskHead::new(device, &layout, task.num_outputs))
            .collect();
        let head_names = tasks.names().map(|t| layout.kind.head_name(t)).collect();

        log::debug!(
            "Composed {:?} backbone ({} features) into {} heads",
            layout.kind,
            layout.input_dim,
            tasks.len()
        );

        Ok(MultiTaskNet {
            backbone,
            shared_prefix: layout.shared_prefix,
            heads,
            tasks: Ignored(tasks.names().map(String::from).collect()),
            head_names: Ignored(head_names),
        })
    }

    pub fn backbone(&self) -> &Backbone<B> {
        &self.backbone
    }

    pub fn head_names(&self) -> &[String] {
        &self.head_names
    }

    pub fn task_names(&self) -> &[String] {
        &self.tasks
    }

    pub fn head(&self, name: &str) -> Option<&TaskHead<B>> {
        self.head_names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.heads[i])
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `input` - tabular [batch, num_inputs] or image [batch, C, H, W]
    ///
    /// # Returns
    /// One [batch, num_outputs] prediction per head, in task order
    pub fn forward(&self, input: BackboneInput<B>) -> Result<TaskOutputs<B>> {
        let features = self.backbone.forward(input)?;
        let features = match &self.shared_prefix {
            Some(norm) => norm.forward(features),
            None => features,
        };

        let outputs = self
            .heads
            .iter()
            .zip(self.tasks.iter().zip(self.head_names.iter()))
            .map(|(head, (task, name))| TaskOutput {
                task: task.clone(),
                head: name.clone(),
                prediction: head.forward(features.clone()),
            })
            .collect();

        Ok(TaskOutputs::new(outputs))
    }
}

impl<B: Backend> WeightNorms<B> for MultiTaskNet<B> {
    fn weight_norms(&self) -> Vec<Tensor<B, 1>> {
        let mut norms = self.backbone.weight_norms();
        norms.extend(self.heads.iter().map(|h| linear_norm(&h.fc)));
        norms
    }
}

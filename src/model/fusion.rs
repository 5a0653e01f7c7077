//! Tabular + image fusion
//!
//! An auxiliary binary image model scores each sample; its positive-class
//! column is min-max normalized over the batch and appended to the tabular
//! features as one extra input of the multi-task MLP.
//!
//! The column is the raw output of the image model. No softmax is applied
//! before normalizing, so the "likelihood" is a logit.

use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::backbone::{Backbone, BackboneInput, ImageShape, NetName, WeightNorms};
use super::multitask::{MultiTaskNet, TaskOutputs};
use crate::{Result, TaskSet};

/// Output width of the auxiliary image model
const AUX_CLASSES: usize = 2;
/// Column used as the image-derived feature
const POSITIVE_CLASS: usize = 1;

#[derive(Module, Debug)]
pub struct FusionNet<B: Backend> {
    /// Single-task image model, projection attached
    image: Backbone<B>,
    /// Multi-task MLP over `num_inputs + 1` features
    mlp: MultiTaskNet<B>,
}

impl<B: Backend> FusionNet<B> {
    pub fn new(
        device: &B::Device,
        net: NetName,
        shape: ImageShape,
        num_inputs: usize,
        tasks: &TaskSet,
    ) -> Result<Self> {
        let image = Backbone::image(device, net, shape, AUX_CLASSES)?;
        let mlp = MultiTaskNet::compose(device, Backbone::mlp(device, num_inputs + 1, 1), tasks)?;
        Ok(FusionNet { image, mlp })
    }

    pub fn head_names(&self) -> &[String] {
        self.mlp.head_names()
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `tabular` - [batch, num_inputs]
    /// * `images` - [batch, channels, height, width]
    pub fn forward(&self, tabular: Tensor<B, 2>, images: Tensor<B, 4>) -> Result<TaskOutputs<B>> {
        let features = Tensor::cat(vec![tabular, self.image_feature(images)?], 1);
        self.mlp.forward(BackboneInput::Tabular(features))
    }

    /// Normalized positive-class logit of the image model: [batch, 1]
    pub fn image_feature(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
        let scores = self.image.forward(BackboneInput::Image(images))?;
        let [batch, _] = scores.dims();
        let positive = scores.slice([0..batch, POSITIVE_CLASS..POSITIVE_CLASS + 1]);
        Ok(min_max_normalize(positive))
    }
}

impl<B: Backend> WeightNorms<B> for FusionNet<B> {
    fn weight_norms(&self) -> Vec<Tensor<B, 1>> {
        let mut norms = self.image.weight_norms();
        norms.extend(self.mlp.weight_norms());
        norms
    }
}

/// Scale to [0, 1] over the whole batch; a constant batch maps to zeros
pub fn min_max_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let min = x.clone().min();
    let range = x.clone().max() - min.clone();
    let range = range.clone().mask_fill(range.equal_elem(0.0), 1.0);
    (x - min.unsqueeze::<2>()) / range.unsqueeze::<2>()
}

//! Tabular MLP backbone
//!
//! Architecture: Input → [Linear → ReLU → Dropout] × 3 (256 wide) → fc

use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::backbone::{linear_norm, WeightNorms};

/// Configuration for the MLP backbone
#[derive(Debug, Clone)]
pub struct MlpConfig {
    /// Number of tabular inputs
    pub num_inputs: usize,
    /// Hidden layer widths
    pub hidden_dims: Vec<usize>,
    /// Dropout after every hidden layer
    pub dropout: f64,
    /// Width of the output projection
    pub num_outputs: usize,
}

impl MlpConfig {
    pub fn new(num_inputs: usize, num_outputs: usize) -> Self {
        MlpConfig {
            num_inputs,
            hidden_dims: vec![256, 256, 256],
            dropout: 0.2,
            num_outputs,
        }
    }
}

/// A single hidden layer block: Linear → ReLU → Dropout
#[derive(Module, Debug)]
pub struct HiddenBlock<B: Backend> {
    linear: Linear<B>,
    dropout: Dropout,
}

impl<B: Backend> HiddenBlock<B> {
    pub fn new(device: &B::Device, in_dim: usize, out_dim: usize, dropout: f64) -> Self {
        HiddenBlock {
            linear: LinearConfig::new(in_dim, out_dim).init(device),
            dropout: DropoutConfig::new(dropout).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.linear.forward(x);
        let x = relu(x);
        self.dropout.forward(x)
    }
}

/// Multi-layer perceptron with a removable output layer
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    hidden: Vec<HiddenBlock<B>>,
    pub(crate) fc: Option<Linear<B>>,
}

impl<B: Backend> Mlp<B> {
    pub fn new(device: &B::Device, config: MlpConfig) -> Self {
        let mut hidden = Vec::with_capacity(config.hidden_dims.len());
        let mut in_dim = config.num_inputs;
        for &out_dim in &config.hidden_dims {
            hidden.push(HiddenBlock::new(device, in_dim, out_dim, config.dropout));
            in_dim = out_dim;
        }

        Mlp {
            hidden,
            fc: Some(LinearConfig::new(in_dim, config.num_outputs).init(device)),
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `inputs` - Normalized tabular inputs [batch, num_inputs]
    ///
    /// # Returns
    /// Logits [batch, num_outputs], or hidden features once `fc` is detached
    pub fn forward(&self, inputs: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut x = inputs;
        for block in &self.hidden {
            x = block.forward(x);
        }
        match &self.fc {
            Some(fc) => fc.forward(x),
            None => x,
        }
    }
}

impl<B: Backend> WeightNorms<B> for Mlp<B> {
    fn weight_norms(&self) -> Vec<Tensor<B, 1>> {
        self.hidden
            .iter()
            .map(|block| linear_norm(&block.linear))
            .chain(self.fc.iter().map(linear_norm))
            .collect()
    }
}

//! Densely connected CNN backbone (DenseNet family)
//!
//! Each dense layer appends `growth_rate` channels to its input; transitions
//! halve both channels and resolution. The projection lives under `classifier`.

use burn::module::Module;
use burn::nn::conv::Conv2d;
use burn::nn::pool::{AvgPool2d, AvgPool2dConfig};
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::backbone::{linear_norm, ImageShape, NetName, WeightNorms};
use super::layers::{check_image_size, conv2d, conv_norm, global_avg_pool};
use crate::Result;

#[derive(Debug, Clone)]
pub struct DenseNetConfig {
    pub in_channels: usize,
    pub growth_rate: usize,
    /// Dense layers per block
    pub block_layers: Vec<usize>,
    pub num_outputs: usize,
}

impl DenseNetConfig {
    /// Every transition halves the resolution with 2x2 pooling, so the image
    /// side must be at least `2^transitions`.
    pub fn new(shape: ImageShape, num_outputs: usize) -> Result<Self> {
        let block_layers = vec![3, 3, 3];
        check_image_size(NetName::DenseNet, shape.size, 1 << (block_layers.len() - 1))?;
        Ok(DenseNetConfig {
            in_channels: shape.channels,
            growth_rate: 12,
            block_layers,
            num_outputs,
        })
    }
}

#[derive(Module, Debug)]
pub struct DenseLayer<B: Backend> {
    conv: Conv2d<B>,
}

impl<B: Backend> DenseLayer<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let new_features = self.conv.forward(relu(x.clone()));
        Tensor::cat(vec![x, new_features], 1)
    }
}

/// 1x1 conv halving the channels, then 2x2 average pooling
#[derive(Module, Debug)]
pub struct Transition<B: Backend> {
    conv: Conv2d<B>,
    pool: AvgPool2d,
}

impl<B: Backend> Transition<B> {
    pub fn new(device: &B::Device, channels: usize) -> Self {
        Transition {
            conv: conv2d(device, [channels, channels / 2], 1, 1, 0),
            pool: AvgPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.pool.forward(self.conv.forward(relu(x)))
    }
}

#[derive(Module, Debug)]
pub struct DenseBlock<B: Backend> {
    layers: Vec<DenseLayer<B>>,
    transition: Option<Transition<B>>,
}

impl<B: Backend> DenseBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = x;
        for layer in &self.layers {
            x = layer.forward(x);
        }
        match &self.transition {
            Some(transition) => transition.forward(x),
            None => x,
        }
    }

    fn weight_norms(&self) -> Vec<Tensor<B, 1>> {
        self.layers
            .iter()
            .map(|l| conv_norm(&l.conv))
            .chain(self.transition.iter().map(|t| conv_norm(&t.conv)))
            .collect()
    }
}

#[derive(Module, Debug)]
pub struct DenseNet<B: Backend> {
    stem: Conv2d<B>,
    blocks: Vec<DenseBlock<B>>,
    pub(crate) classifier: Option<Linear<B>>,
}

impl<B: Backend> DenseNet<B> {
    pub fn new(device: &B::Device, config: DenseNetConfig) -> Self {
        let mut channels = config.growth_rate * 2;
        let stem = conv2d(device, [config.in_channels, channels], 3, 1, 1);

        let num_blocks = config.block_layers.len();
        let mut blocks = Vec::with_capacity(num_blocks);
        for (i, &count) in config.block_layers.iter().enumerate() {
            let mut layers = Vec::with_capacity(count);
            for _ in 0..count {
                layers.push(DenseLayer {
                    conv: conv2d(device, [channels, config.growth_rate], 3, 1, 1),
                });
                channels += config.growth_rate;
            }
            let transition = if i + 1 < num_blocks {
                let t = Transition::new(device, channels);
                channels /= 2;
                Some(t)
            } else {
                None
            };
            blocks.push(DenseBlock { layers, transition });
        }

        DenseNet {
            stem,
            blocks,
            classifier: Some(LinearConfig::new(channels, config.num_outputs).init(device)),
        }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = self.stem.forward(images);
        for block in &self.blocks {
            x = block.forward(x);
        }
        let features = global_avg_pool(relu(x));
        match &self.classifier {
            Some(fc) => fc.forward(features),
            None => features,
        }
    }
}

impl<B: Backend> WeightNorms<B> for DenseNet<B> {
    fn weight_norms(&self) -> Vec<Tensor<B, 1>> {
        let mut norms = vec![conv_norm(&self.stem)];
        for block in &self.blocks {
            norms.extend(block.weight_norms());
        }
        norms.extend(self.classifier.iter().map(linear_norm));
        norms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_densenet_output_shape() {
        let device = Default::default();
        let shape = ImageShape {
            channels: 1,
            size: 16,
        };
        let model = DenseNet::<TestBackend>::new(&device, DenseNetConfig::new(shape, 2).unwrap());

        let x = Tensor::random(
            [2, 1, 16, 16],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        assert_eq!(model.forward(x).dims(), [2, 2]);
    }

    #[test]
    fn test_rejects_images_smaller_than_transitions_allow() {
        let shape = |size| ImageShape { channels: 1, size };
        assert!(DenseNetConfig::new(shape(4), 2).is_ok());
        assert!(DenseNetConfig::new(shape(2), 2).is_err());
    }

    #[test]
    fn test_transition_halves_resolution() {
        let device = Default::default();
        let transition = Transition::<TestBackend>::new(&device, 4);
        let x = Tensor::ones([1, 4, 6, 6], &device);
        assert_eq!(transition.forward(x).dims(), [1, 2, 3, 3]);
    }
}

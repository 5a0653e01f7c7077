//! ConvNeXt backbone
//!
//! Patchify stem → stages of (depthwise 7x7 → LayerNorm → MLP) residual blocks
//! with strided downsampling between stages → global pool → classifier.
//! The classifier is LayerNorm then projection; the norm carries no
//! task-specific state, so composed networks share one copy of it.

use burn::module::Module;
use burn::nn::conv::Conv2d;
use burn::nn::{LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::tensor::activation::gelu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::backbone::{linear_norm, ImageShape, NetName, WeightNorms};
use super::layers::{check_image_size, conv2d, conv_norm, depthwise_conv2d, global_avg_pool};
use crate::Result;

#[derive(Debug, Clone)]
pub struct ConvNeXtConfig {
    pub in_channels: usize,
    pub depths: [usize; 4],
    pub dims: [usize; 4],
    pub num_outputs: usize,
}

impl ConvNeXtConfig {
    /// Each stage halves the resolution with an unpadded 2x2 conv, so the
    /// image side must be at least `2^stages`.
    pub fn for_net(net: NetName, shape: ImageShape, num_outputs: usize) -> Result<Self> {
        let (depths, dims) = match net {
            NetName::ConvNeXtSmall => ([1, 1, 6, 1], [16, 32, 64, 128]),
            NetName::ConvNeXtBase => ([1, 1, 6, 1], [24, 48, 96, 192]),
            NetName::ConvNeXtLarge => ([1, 1, 6, 1], [32, 64, 128, 256]),
            _ => ([1, 1, 3, 1], [16, 32, 64, 128]),
        };
        check_image_size(net, shape.size, 1 << depths.len())?;
        Ok(ConvNeXtConfig {
            in_channels: shape.channels,
            depths,
            dims,
            num_outputs,
        })
    }
}

#[derive(Module, Debug)]
pub struct ConvNeXtBlock<B: Backend> {
    dwconv: Conv2d<B>,
    norm: LayerNorm<B>,
    pwconv1: Linear<B>,
    pwconv2: Linear<B>,
}

impl<B: Backend> ConvNeXtBlock<B> {
    pub fn new(device: &B::Device, dim: usize) -> Self {
        ConvNeXtBlock {
            dwconv: depthwise_conv2d(device, dim, 7, 1),
            norm: LayerNormConfig::new(dim).init(device),
            pwconv1: LinearConfig::new(dim, dim * 4).init(device),
            pwconv2: LinearConfig::new(dim * 4, dim).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.dwconv.forward(x.clone());
        // Channels-last for the norm and pointwise layers
        let out = out.permute([0, 2, 3, 1]);
        let out = self.norm.forward(out);
        let out = self.pwconv2.forward(gelu(self.pwconv1.forward(out)));
        let out = out.permute([0, 3, 1, 2]);
        x + out
    }
}

#[derive(Module, Debug)]
pub struct ConvNeXtStage<B: Backend> {
    downsample: Conv2d<B>,
    blocks: Vec<ConvNeXtBlock<B>>,
}

/// LayerNorm → projection
#[derive(Module, Debug)]
pub struct ConvNeXtClassifier<B: Backend> {
    pub(crate) norm: LayerNorm<B>,
    pub(crate) fc: Linear<B>,
}

#[derive(Module, Debug)]
pub struct ConvNeXt<B: Backend> {
    stages: Vec<ConvNeXtStage<B>>,
    pub(crate) classifier: Option<ConvNeXtClassifier<B>>,
}

impl<B: Backend> ConvNeXt<B> {
    pub fn new(device: &B::Device, config: ConvNeXtConfig) -> Self {
        let mut stages = Vec::with_capacity(4);
        let mut in_ch = config.in_channels;
        for (&depth, &dim) in config.depths.iter().zip(config.dims.iter()) {
            stages.push(ConvNeXtStage {
                downsample: conv2d(device, [in_ch, dim], 2, 2, 0),
                blocks: (0..depth).map(|_| ConvNeXtBlock::new(device, dim)).collect(),
            });
            in_ch = dim;
        }

        ConvNeXt {
            stages,
            classifier: Some(ConvNeXtClassifier {
                norm: LayerNormConfig::new(in_ch).init(device),
                fc: LinearConfig::new(in_ch, config.num_outputs).init(device),
            }),
        }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = images;
        for stage in &self.stages {
            x = stage.downsample.forward(x);
            for block in &stage.blocks {
                x = block.forward(x);
            }
        }
        let features = global_avg_pool(x);
        match &self.classifier {
            Some(classifier) => classifier.fc.forward(classifier.norm.forward(features)),
            None => features,
        }
    }
}

impl<B: Backend> WeightNorms<B> for ConvNeXt<B> {
    fn weight_norms(&self) -> Vec<Tensor<B, 1>> {
        let mut norms = Vec::new();
        for stage in &self.stages {
            norms.push(conv_norm(&stage.downsample));
            for block in &stage.blocks {
                norms.push(conv_norm(&block.dwconv));
                norms.push(linear_norm(&block.pwconv1));
                norms.push(linear_norm(&block.pwconv2));
            }
        }
        norms.extend(self.classifier.iter().map(|c| linear_norm(&c.fc)));
        norms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_convnext_output_shape() {
        let device = Default::default();
        let shape = ImageShape {
            channels: 3,
            size: 32,
        };
        let config = ConvNeXtConfig::for_net(NetName::ConvNeXtTiny, shape, 2).unwrap();
        let model = ConvNeXt::<TestBackend>::new(&device, config);

        let x = Tensor::random(
            [2, 3, 32, 32],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        assert_eq!(model.forward(x).dims(), [2, 2]);
    }

    #[test]
    fn test_smallest_image_reduces_to_one_pixel() {
        let device = Default::default();
        let shape = ImageShape {
            channels: 1,
            size: 16,
        };
        let config = ConvNeXtConfig::for_net(NetName::ConvNeXtSmall, shape, 1).unwrap();
        let model = ConvNeXt::<TestBackend>::new(&device, config);
        assert_eq!(model.forward(Tensor::zeros([1, 1, 16, 16], &device)).dims(), [1, 1]);

        let too_small = ImageShape {
            channels: 1,
            size: 8,
        };
        assert!(matches!(
            ConvNeXtConfig::for_net(NetName::ConvNeXtSmall, too_small, 1),
            Err(crate::NervusError::Configuration(_))
        ));
    }

    #[test]
    fn test_weight_norms_skip_layer_norm_scales() {
        let device = Default::default();
        let shape = ImageShape {
            channels: 3,
            size: 16,
        };
        let config = ConvNeXtConfig::for_net(NetName::ConvNeXtTiny, shape, 2).unwrap();
        let model = ConvNeXt::<TestBackend>::new(&device, config);
        // Per stage: downsample + (dwconv, pwconv1, pwconv2) per block; then fc
        let blocks: usize = [1, 1, 3, 1].iter().sum();
        assert_eq!(model.weight_norms().len(), 4 + 3 * blocks + 1);
    }

    #[test]
    fn test_block_preserves_shape() {
        let device = Default::default();
        let block = ConvNeXtBlock::<TestBackend>::new(&device, 8);
        let x = Tensor::zeros([1, 8, 4, 4], &device);
        assert_eq!(block.forward(x).dims(), [1, 8, 4, 4]);
    }
}

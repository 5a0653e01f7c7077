//! Residual CNN backbone (ResNet family)
//!
//! Stem conv → four stages of basic residual blocks → global pool → fc.

use burn::module::Module;
use burn::nn::conv::Conv2d;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::backbone::{linear_norm, NetName, WeightNorms};
use super::layers::{conv2d, conv_norm, global_avg_pool};

/// Configuration for the residual network
#[derive(Debug, Clone)]
pub struct ResNetConfig {
    pub in_channels: usize,
    /// Width of the first stage; each following stage doubles it
    pub base_width: usize,
    /// Residual blocks per stage
    pub blocks: [usize; 4],
    pub num_outputs: usize,
}

impl ResNetConfig {
    pub fn for_net(net: NetName, in_channels: usize, num_outputs: usize) -> Self {
        let blocks = match net {
            NetName::ResNet18 => [2, 2, 2, 2],
            _ => [3, 4, 6, 3],
        };
        ResNetConfig {
            in_channels,
            base_width: 16,
            blocks,
            num_outputs,
        }
    }
}

/// conv3x3 → ReLU → conv3x3, plus identity or 1x1 projection shortcut
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    shortcut: Option<Conv2d<B>>,
}

impl<B: Backend> BasicBlock<B> {
    pub fn new(device: &B::Device, in_ch: usize, out_ch: usize, stride: usize) -> Self {
        let shortcut = if stride != 1 || in_ch != out_ch {
            Some(conv2d(device, [in_ch, out_ch], 1, stride, 0))
        } else {
            None
        };
        BasicBlock {
            conv1: conv2d(device, [in_ch, out_ch], 3, stride, 1),
            conv2: conv2d(device, [out_ch, out_ch], 3, 1, 1),
            shortcut,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.shortcut {
            Some(conv) => conv.forward(x.clone()),
            None => x.clone(),
        };
        let out = relu(self.conv1.forward(x));
        let out = self.conv2.forward(out);
        relu(out + identity)
    }

    fn weight_norms(&self) -> Vec<Tensor<B, 1>> {
        let mut norms = vec![conv_norm(&self.conv1), conv_norm(&self.conv2)];
        norms.extend(self.shortcut.iter().map(conv_norm));
        norms
    }
}

#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    stem: Conv2d<B>,
    blocks: Vec<BasicBlock<B>>,
    pub(crate) fc: Option<Linear<B>>,
}

impl<B: Backend> ResNet<B> {
    pub fn new(device: &B::Device, config: ResNetConfig) -> Self {
        let mut blocks = Vec::new();
        let mut in_ch = config.base_width;
        for (stage, &count) in config.blocks.iter().enumerate() {
            let out_ch = config.base_width << stage;
            for i in 0..count {
                let stride = if stage > 0 && i == 0 { 2 } else { 1 };
                blocks.push(BasicBlock::new(device, in_ch, out_ch, stride));
                in_ch = out_ch;
            }
        }

        ResNet {
            stem: conv2d(device, [config.in_channels, config.base_width], 3, 1, 1),
            blocks,
            fc: Some(LinearConfig::new(in_ch, config.num_outputs).init(device)),
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `images` - [batch, channels, height, width]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = relu(self.stem.forward(images));
        for block in &self.blocks {
            x = block.forward(x);
        }
        let features = global_avg_pool(x);
        match &self.fc {
            Some(fc) => fc.forward(features),
            None => features,
        }
    }
}

impl<B: Backend> WeightNorms<B> for ResNet<B> {
    fn weight_norms(&self) -> Vec<Tensor<B, 1>> {
        let mut norms = vec![conv_norm(&self.stem)];
        for block in &self.blocks {
            norms.extend(block.weight_norms());
        }
        norms.extend(self.fc.iter().map(linear_norm));
        norms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_resnet18_output_shape() {
        let device = Default::default();
        let model =
            ResNet::<TestBackend>::new(&device, ResNetConfig::for_net(NetName::ResNet18, 3, 4));

        let x = Tensor::random(
            [2, 3, 32, 32],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        assert_eq!(model.forward(x).dims(), [2, 4]);
    }

    #[test]
    fn test_detached_resnet_returns_last_stage_width() {
        let device = Default::default();
        let mut model =
            ResNet::<TestBackend>::new(&device, ResNetConfig::for_net(NetName::ResNet18, 1, 2));
        model.fc = None;

        let x = Tensor::zeros([1, 1, 16, 16], &device);
        assert_eq!(model.forward(x).dims(), [1, 128]);
    }
}

//! Mobile inverted-bottleneck CNN backbone (EfficientNet family)
//!
//! The output stage is a two-step classifier, dropout then projection. The
//! dropout probability grows with the variant, as in the reference scaling.

use burn::module::Module;
use burn::nn::conv::Conv2d;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::tensor::activation::silu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::backbone::{linear_norm, NetName, WeightNorms};
use super::layers::{conv2d, conv_norm, depthwise_conv2d, global_avg_pool};

const BASE_CHANNELS: [usize; 4] = [16, 24, 40, 80];
const BASE_DEPTHS: [usize; 4] = [1, 2, 2, 2];
const EXPANSION: usize = 4;

#[derive(Debug, Clone)]
pub struct EfficientNetConfig {
    pub in_channels: usize,
    pub width_mult: f64,
    pub depth_mult: f64,
    pub dropout: f64,
    pub num_outputs: usize,
}

impl EfficientNetConfig {
    pub fn for_net(net: NetName, in_channels: usize, num_outputs: usize) -> Self {
        let (width_mult, depth_mult, dropout) = match net {
            NetName::B2 => (1.1, 1.2, 0.3),
            NetName::B4 => (1.4, 1.8, 0.4),
            NetName::B6 => (1.8, 2.6, 0.5),
            _ => (1.0, 1.0, 0.2),
        };
        EfficientNetConfig {
            in_channels,
            width_mult,
            depth_mult,
            dropout,
            num_outputs,
        }
    }

    fn channels(&self, stage: usize) -> usize {
        // Round to a multiple of 8 like the reference width scaling
        let scaled = BASE_CHANNELS[stage] as f64 * self.width_mult;
        (((scaled / 8.0).round() as usize).max(1)) * 8
    }

    fn depth(&self, stage: usize) -> usize {
        (BASE_DEPTHS[stage] as f64 * self.depth_mult).ceil() as usize
    }
}

/// Expand (1x1) → depthwise (3x3) → project (1x1), residual when shapes match
#[derive(Module, Debug)]
pub struct MbConv<B: Backend> {
    expand: Conv2d<B>,
    depthwise: Conv2d<B>,
    project: Conv2d<B>,
}

impl<B: Backend> MbConv<B> {
    pub fn new(device: &B::Device, in_ch: usize, out_ch: usize, stride: usize) -> Self {
        let hidden = in_ch * EXPANSION;
        MbConv {
            expand: conv2d(device, [in_ch, hidden], 1, 1, 0),
            depthwise: depthwise_conv2d(device, hidden, 3, stride),
            project: conv2d(device, [hidden, out_ch], 1, 1, 0),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = silu(self.expand.forward(x.clone()));
        let out = silu(self.depthwise.forward(out));
        let out = self.project.forward(out);
        // Stride 1 with unchanged channels keeps the shape
        if out.dims() == x.dims() {
            out + x
        } else {
            out
        }
    }
}

/// Dropout → projection
#[derive(Module, Debug)]
pub struct ClassifierSequence<B: Backend> {
    pub(crate) dropout: Dropout,
    pub(crate) fc: Linear<B>,
}

impl<B: Backend> ClassifierSequence<B> {
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.fc.forward(self.dropout.forward(x))
    }
}

#[derive(Module, Debug)]
pub struct EfficientNet<B: Backend> {
    stem: Conv2d<B>,
    blocks: Vec<MbConv<B>>,
    head: Conv2d<B>,
    pub(crate) classifier: Option<ClassifierSequence<B>>,
}

impl<B: Backend> EfficientNet<B> {
    pub fn new(device: &B::Device, config: EfficientNetConfig) -> Self {
        let stem_ch = config.channels(0);
        let mut blocks = Vec::new();
        let mut in_ch = stem_ch;
        for stage in 0..BASE_CHANNELS.len() {
            let out_ch = config.channels(stage);
            for i in 0..config.depth(stage) {
                let stride = if stage > 0 && i == 0 { 2 } else { 1 };
                blocks.push(MbConv::new(device, in_ch, out_ch, stride));
                in_ch = out_ch;
            }
        }
        let feature_dim = in_ch * EXPANSION;

        EfficientNet {
            stem: conv2d(device, [config.in_channels, stem_ch], 3, 2, 1),
            blocks,
            head: conv2d(device, [in_ch, feature_dim], 1, 1, 0),
            classifier: Some(ClassifierSequence {
                dropout: DropoutConfig::new(config.dropout).init(),
                fc: LinearConfig::new(feature_dim, config.num_outputs).init(device),
            }),
        }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = silu(self.stem.forward(images));
        for block in &self.blocks {
            x = block.forward(x);
        }
        let features = global_avg_pool(silu(self.head.forward(x)));
        match &self.classifier {
            Some(classifier) => classifier.forward(features),
            None => features,
        }
    }
}

impl<B: Backend> WeightNorms<B> for EfficientNet<B> {
    fn weight_norms(&self) -> Vec<Tensor<B, 1>> {
        let mut norms = vec![conv_norm(&self.stem)];
        for block in &self.blocks {
            norms.push(conv_norm(&block.expand));
            norms.push(conv_norm(&block.depthwise));
            norms.push(conv_norm(&block.project));
        }
        norms.push(conv_norm(&self.head));
        norms.extend(self.classifier.iter().map(|c| linear_norm(&c.fc)));
        norms
    }
}

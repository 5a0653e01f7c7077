//! Small building blocks shared by the image backbones

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::backbone::{l2_norm, NetName};
use crate::{NervusError, Result};

/// Square convolution with symmetric explicit padding
pub fn conv2d<B: Backend>(
    device: &B::Device,
    channels: [usize; 2],
    kernel: usize,
    stride: usize,
    padding: usize,
) -> Conv2d<B> {
    Conv2dConfig::new(channels, [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .init(device)
}

/// Depthwise square convolution (one group per channel)
pub fn depthwise_conv2d<B: Backend>(
    device: &B::Device,
    channels: usize,
    kernel: usize,
    stride: usize,
) -> Conv2d<B> {
    Conv2dConfig::new([channels, channels], [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(kernel / 2, kernel / 2))
        .with_groups(channels)
        .init(device)
}

/// Average over the spatial dimensions: [batch, c, h, w] → [batch, c]
pub fn global_avg_pool<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 2> {
    let [batch, channels, _, _] = x.dims();
    x.mean_dim(3).mean_dim(2).reshape([batch, channels])
}

/// Reject images smaller than `min` pixels per side for `net`
pub fn check_image_size(net: NetName, size: usize, min: usize) -> Result<()> {
    if size < min {
        return Err(NervusError::Configuration(format!(
            "{} needs images of at least {}x{}, got {}x{}",
            net, min, min, size, size
        )));
    }
    Ok(())
}

pub fn conv_norm<B: Backend>(conv: &Conv2d<B>) -> Tensor<B, 1> {
    l2_norm(conv.weight.val())
}

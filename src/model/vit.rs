//! Vision transformer backbone (ViT family)
//!
//! Patch embedding → CLS token + learned positions → pre-norm ViT blocks
//! → LayerNorm → CLS representation → `heads.head` projection.

use burn::module::{Module, Param};
use burn::nn::attention::{MhaInput, MultiHeadAttention, MultiHeadAttentionConfig};
use burn::nn::conv::Conv2d;
use burn::nn::{Dropout, DropoutConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::tensor::activation::gelu;
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Tensor};

use super::backbone::{linear_norm, ImageShape, NetName, WeightNorms};
use super::layers::{conv2d, conv_norm};
use crate::{NervusError, Result};

/// Configuration for the vision transformer
#[derive(Debug, Clone)]
pub struct VitConfig {
    pub in_channels: usize,
    pub image_size: usize,
    pub patch_size: usize,
    /// Model dimension (d_model)
    pub d_model: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    /// Feedforward hidden dimension
    pub d_ff: usize,
    pub dropout: f64,
    pub num_outputs: usize,
}

impl VitConfig {
    pub fn for_net(net: NetName, shape: ImageShape, num_outputs: usize) -> Result<Self> {
        let (patch_size, d_model, n_heads, n_layers) = match net {
            NetName::ViTb32 => (32, 64, 4, 2),
            NetName::ViTl16 => (16, 96, 6, 4),
            NetName::ViTl32 => (32, 96, 6, 4),
            _ => (16, 64, 4, 2),
        };
        if shape.size < patch_size || shape.size % patch_size != 0 {
            return Err(NervusError::Configuration(format!(
                "{} needs an image size divisible by {}, got {}",
                net, patch_size, shape.size
            )));
        }
        Ok(VitConfig {
            in_channels: shape.channels,
            image_size: shape.size,
            patch_size,
            d_model,
            n_heads,
            n_layers,
            d_ff: d_model * 4,
            dropout: 0.0,
            num_outputs,
        })
    }

    fn num_patches(&self) -> usize {
        let per_side = self.image_size / self.patch_size;
        per_side * per_side
    }
}

/// Pre-norm ViT block: LN → self-attention → residual, LN → MLP → residual
#[derive(Module, Debug)]
pub struct VitBlock<B: Backend> {
    attn_norm: LayerNorm<B>,
    attention: MultiHeadAttention<B>,
    mlp_norm: LayerNorm<B>,
    mlp_in: Linear<B>,
    mlp_out: Linear<B>,
    dropout: Dropout,
}

impl<B: Backend> VitBlock<B> {
    pub fn new(device: &B::Device, config: &VitConfig) -> Self {
        VitBlock {
            attn_norm: LayerNormConfig::new(config.d_model).init(device),
            attention: MultiHeadAttentionConfig::new(config.d_model, config.n_heads)
                .with_dropout(config.dropout)
                .init(device),
            mlp_norm: LayerNormConfig::new(config.d_model).init(device),
            mlp_in: LinearConfig::new(config.d_model, config.d_ff).init(device),
            mlp_out: LinearConfig::new(config.d_ff, config.d_model).init(device),
            dropout: DropoutConfig::new(config.dropout).init(),
        }
    }

    /// [batch, tokens, d_model] → same shape
    pub fn forward(&self, tokens: Tensor<B, 3>) -> Tensor<B, 3> {
        let attended = self
            .attention
            .forward(MhaInput::self_attn(self.attn_norm.forward(tokens.clone())))
            .context;
        let tokens = tokens + self.dropout.forward(attended);

        let hidden = gelu(self.mlp_in.forward(self.mlp_norm.forward(tokens.clone())));
        tokens + self.dropout.forward(self.mlp_out.forward(hidden))
    }

    fn weight_norms(&self) -> Vec<Tensor<B, 1>> {
        vec![
            linear_norm(&self.attention.query),
            linear_norm(&self.attention.key),
            linear_norm(&self.attention.value),
            linear_norm(&self.attention.output),
            linear_norm(&self.mlp_in),
            linear_norm(&self.mlp_out),
        ]
    }
}

/// Container for the lone output projection
#[derive(Module, Debug)]
pub struct VitHeads<B: Backend> {
    pub(crate) head: Linear<B>,
}

#[derive(Module, Debug)]
pub struct VisionTransformer<B: Backend> {
    patch_embed: Conv2d<B>,
    cls_token: Param<Tensor<B, 3>>,
    pos_embedding: Param<Tensor<B, 3>>,
    blocks: Vec<VitBlock<B>>,
    norm: LayerNorm<B>,
    d_model: usize,
    pub(crate) heads: Option<VitHeads<B>>,
}

impl<B: Backend> VisionTransformer<B> {
    pub fn new(device: &B::Device, config: VitConfig) -> Self {
        let blocks = (0..config.n_layers)
            .map(|_| VitBlock::new(device, &config))
            .collect();

        let cls_token = Tensor::<B, 3>::random(
            [1, 1, config.d_model],
            Distribution::Normal(0.0, 0.02),
            device,
        );
        let pos_embedding = Tensor::<B, 3>::random(
            [1, config.num_patches() + 1, config.d_model],
            Distribution::Normal(0.0, 0.02),
            device,
        );

        VisionTransformer {
            patch_embed: conv2d(
                device,
                [config.in_channels, config.d_model],
                config.patch_size,
                config.patch_size,
                0,
            ),
            cls_token: Param::from_tensor(cls_token),
            pos_embedding: Param::from_tensor(pos_embedding),
            blocks,
            norm: LayerNormConfig::new(config.d_model).init(device),
            d_model: config.d_model,
            heads: Some(VitHeads {
                head: LinearConfig::new(config.d_model, config.num_outputs).init(device),
            }),
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `images` - [batch, channels, image_size, image_size]
    ///
    /// # Returns
    /// Logits [batch, num_outputs], or the CLS representation [batch, d_model]
    /// once the heads are detached
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let patches = self.patch_embed.forward(images);
        let [batch, d_model, h, w] = patches.dims();
        let tokens = patches.reshape([batch, d_model, h * w]).swap_dims(1, 2);

        let cls_tokens = self.cls_token.val().expand([batch, 1, self.d_model]);
        let x = Tensor::cat(vec![cls_tokens, tokens], 1) + self.pos_embedding.val();

        let x = self
            .blocks
            .iter()
            .fold(x, |tokens, block| block.forward(tokens));
        let x = self.norm.forward(x);
        let cls: Tensor<B, 2> = x.slice([0..batch, 0..1, 0..self.d_model]).squeeze(1);
        match &self.heads {
            Some(heads) => heads.head.forward(cls),
            None => cls,
        }
    }
}

impl<B: Backend> WeightNorms<B> for VisionTransformer<B> {
    fn weight_norms(&self) -> Vec<Tensor<B, 1>> {
        let mut norms = vec![conv_norm(&self.patch_embed)];
        for block in &self.blocks {
            norms.extend(block.weight_norms());
        }
        norms.extend(self.heads.iter().map(|h| linear_norm(&h.head)));
        norms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_vit_output_shape() {
        let device = Default::default();
        let shape = ImageShape { channels: 1, size: 32 };
        let config = VitConfig::for_net(NetName::ViTb16, shape, 3).unwrap();
        let model = VisionTransformer::<TestBackend>::new(&device, config);

        let x = Tensor::random([2, 1, 32, 32], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(model.forward(x).dims(), [2, 3]);
    }

    #[test]
    fn test_vit_rejects_indivisible_image_size() {
        let shape = ImageShape { channels: 3, size: 48 };
        assert!(VitConfig::for_net(NetName::ViTb32, shape, 2).is_err());
        assert!(VitConfig::for_net(NetName::ViTb16, shape, 2).is_ok());
    }

    #[test]
    fn test_vit_block_keeps_token_shape() {
        let device = Default::default();
        let shape = ImageShape { channels: 3, size: 32 };
        let config = VitConfig::for_net(NetName::ViTl16, shape, 1).unwrap();
        let block = VitBlock::<TestBackend>::new(&device, &config);

        let tokens = Tensor::random([2, 5, config.d_model], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(block.forward(tokens).dims(), [2, 5, 96]);
        assert_eq!(block.weight_norms().len(), 6);
    }
}

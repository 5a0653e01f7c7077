//! Backbone families and their head-layout adapters
//!
//! Every backbone ends in a single-output projection. The families differ only
//! in where that projection lives and what sits in front of it, which is what
//! [`Backbone::detach_head`] reports as a [`HeadLayout`].

use std::fmt;
use std::str::FromStr;

use burn::module::Module;
use burn::nn::{LayerNorm, Linear};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::convnext::{ConvNeXt, ConvNeXtConfig};
use super::densenet::{DenseNet, DenseNetConfig};
use super::efficientnet::{EfficientNet, EfficientNetConfig};
use super::mlp::{Mlp, MlpConfig};
use super::resnet::{ResNet, ResNetConfig};
use super::vit::{VisionTransformer, VitConfig};
use crate::{NervusError, Result};

/// Where a backbone keeps its final projection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackboneKind {
    /// The projection is the whole output stage
    Plain,
    /// Dropout followed by the projection; the dropout is re-created per task
    ClassifierSequence,
    /// Normalization shared by all heads, then a private projection
    SharedPrefixSequence,
    /// A lone projection kept under a `heads` container
    SingleScalarHead,
}

impl BackboneKind {
    /// Prefix of every head name composed on this kind of backbone
    pub fn head_prefix(&self) -> &'static str {
        match self {
            BackboneKind::Plain => "fc_",
            BackboneKind::ClassifierSequence | BackboneKind::SharedPrefixSequence => "block_",
            BackboneKind::SingleScalarHead => "heads_",
        }
    }

    pub fn head_name(&self, task: &str) -> String {
        format!("{}{}", self.head_prefix(), task)
    }
}

/// What the composer needs to build per-task heads in place of a removed projection
#[derive(Debug)]
pub struct HeadLayout<B: Backend> {
    pub kind: BackboneKind,
    /// Input width of the removed projection
    pub input_dim: usize,
    /// Dropout probability to replicate in every head
    pub dropout: Option<f64>,
    /// Transform evaluated once and shared by all heads
    pub shared_prefix: Option<LayerNorm<B>>,
}

/// Image network names accepted in the model string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetName {
    B0,
    B2,
    B4,
    B6,
    ResNet18,
    ResNet,
    DenseNet,
    ConvNeXtTiny,
    ConvNeXtSmall,
    ConvNeXtBase,
    ConvNeXtLarge,
    ViTb16,
    ViTb32,
    ViTl16,
    ViTl32,
}

impl NetName {
    pub const ALL: [NetName; 15] = [
        NetName::B0,
        NetName::B2,
        NetName::B4,
        NetName::B6,
        NetName::ResNet18,
        NetName::ResNet,
        NetName::DenseNet,
        NetName::ConvNeXtTiny,
        NetName::ConvNeXtSmall,
        NetName::ConvNeXtBase,
        NetName::ConvNeXtLarge,
        NetName::ViTb16,
        NetName::ViTb32,
        NetName::ViTl16,
        NetName::ViTl32,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NetName::B0 => "B0",
            NetName::B2 => "B2",
            NetName::B4 => "B4",
            NetName::B6 => "B6",
            NetName::ResNet18 => "ResNet18",
            NetName::ResNet => "ResNet",
            NetName::DenseNet => "DenseNet",
            NetName::ConvNeXtTiny => "ConvNeXtTiny",
            NetName::ConvNeXtSmall => "ConvNeXtSmall",
            NetName::ConvNeXtBase => "ConvNeXtBase",
            NetName::ConvNeXtLarge => "ConvNeXtLarge",
            NetName::ViTb16 => "ViTb16",
            NetName::ViTb32 => "ViTb32",
            NetName::ViTl16 => "ViTl16",
            NetName::ViTl32 => "ViTl32",
        }
    }

    pub fn kind(&self) -> BackboneKind {
        match self {
            NetName::ResNet18 | NetName::ResNet | NetName::DenseNet => BackboneKind::Plain,
            NetName::B0 | NetName::B2 | NetName::B4 | NetName::B6 => {
                BackboneKind::ClassifierSequence
            }
            NetName::ConvNeXtTiny
            | NetName::ConvNeXtSmall
            | NetName::ConvNeXtBase
            | NetName::ConvNeXtLarge => BackboneKind::SharedPrefixSequence,
            NetName::ViTb16 | NetName::ViTb32 | NetName::ViTl16 | NetName::ViTl32 => {
                BackboneKind::SingleScalarHead
            }
        }
    }
}

impl fmt::Display for NetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NetName {
    type Err = NervusError;

    fn from_str(s: &str) -> Result<Self> {
        NetName::ALL
            .iter()
            .find(|n| n.as_str() == s)
            .copied()
            .ok_or_else(|| NervusError::Configuration(format!("No such CNN or ViT: {}", s)))
    }
}

/// Image geometry fed to a network
#[derive(Debug, Clone, Copy)]
pub struct ImageShape {
    pub channels: usize,
    pub size: usize,
}

/// Input accepted by a backbone
#[derive(Debug, Clone)]
pub enum BackboneInput<B: Backend> {
    /// [batch, num_inputs]
    Tabular(Tensor<B, 2>),
    /// [batch, channels, height, width]
    Image(Tensor<B, 4>),
}

/// L2 norms of weight matrices and kernels, used for parameter regularization
///
/// Only Linear and Conv weights are covered. LayerNorm scales are left out,
/// unlike a regularizer that sums every parameter named `weight`, so the
/// survival penalty is smaller than that variant for normalized backbones.
pub trait WeightNorms<B: Backend> {
    /// One `[1]`-shaped norm per weight tensor; biases and norm scales excluded
    fn weight_norms(&self) -> Vec<Tensor<B, 1>>;
}

pub(crate) fn l2_norm<B: Backend, const D: usize>(weight: Tensor<B, D>) -> Tensor<B, 1> {
    weight.powf_scalar(2.0).sum().sqrt()
}

pub(crate) fn linear_norm<B: Backend>(linear: &Linear<B>) -> Tensor<B, 1> {
    l2_norm(linear.weight.val())
}

/// Single-output network of any supported family
#[derive(Module, Debug)]
pub enum Backbone<B: Backend> {
    Mlp(Mlp<B>),
    ResNet(ResNet<B>),
    DenseNet(DenseNet<B>),
    EfficientNet(EfficientNet<B>),
    ConvNeXt(ConvNeXt<B>),
    ViT(VisionTransformer<B>),
}

impl<B: Backend> Backbone<B> {
    /// Tabular MLP ending in `fc`
    pub fn mlp(device: &B::Device, num_inputs: usize, num_outputs: usize) -> Self {
        Backbone::Mlp(Mlp::new(device, MlpConfig::new(num_inputs, num_outputs)))
    }

    /// Image network ending in a `num_outputs`-wide projection
    pub fn image(
        device: &B::Device,
        net: NetName,
        shape: ImageShape,
        num_outputs: usize,
    ) -> Result<Self> {
        // Padded stride-2 convs (ResNet, EfficientNet) keep any positive size
        if shape.size == 0 || shape.channels == 0 {
            return Err(NervusError::Configuration(format!(
                "{} needs a non-empty image, got {} channel(s) of {}x{}",
                net, shape.channels, shape.size, shape.size
            )));
        }
        let backbone = match net {
            NetName::ResNet18 | NetName::ResNet => Backbone::ResNet(ResNet::new(
                device,
                ResNetConfig::for_net(net, shape.channels, num_outputs),
            )),
            NetName::DenseNet => Backbone::DenseNet(DenseNet::new(
                device,
                DenseNetConfig::new(shape, num_outputs)?,
            )),
            NetName::B0 | NetName::B2 | NetName::B4 | NetName::B6 => {
                Backbone::EfficientNet(EfficientNet::new(
                    device,
                    EfficientNetConfig::for_net(net, shape.channels, num_outputs),
                ))
            }
            NetName::ConvNeXtTiny
            | NetName::ConvNeXtSmall
            | NetName::ConvNeXtBase
            | NetName::ConvNeXtLarge => Backbone::ConvNeXt(ConvNeXt::new(
                device,
                ConvNeXtConfig::for_net(net, shape, num_outputs)?,
            )),
            NetName::ViTb16 | NetName::ViTb32 | NetName::ViTl16 | NetName::ViTl32 => {
                Backbone::ViT(VisionTransformer::new(
                    device,
                    VitConfig::for_net(net, shape, num_outputs)?,
                ))
            }
        };
        Ok(backbone)
    }

    pub fn kind(&self) -> BackboneKind {
        match self {
            Backbone::Mlp(_) | Backbone::ResNet(_) | Backbone::DenseNet(_) => BackboneKind::Plain,
            Backbone::EfficientNet(_) => BackboneKind::ClassifierSequence,
            Backbone::ConvNeXt(_) => BackboneKind::SharedPrefixSequence,
            Backbone::ViT(_) => BackboneKind::SingleScalarHead,
        }
    }

    pub fn accepts_images(&self) -> bool {
        !matches!(self, Backbone::Mlp(_))
    }

    /// Whether the final projection is still attached
    pub fn has_projection(&self) -> bool {
        match self {
            Backbone::Mlp(m) => m.fc.is_some(),
            Backbone::ResNet(m) => m.fc.is_some(),
            Backbone::DenseNet(m) => m.classifier.is_some(),
            Backbone::EfficientNet(m) => m.classifier.is_some(),
            Backbone::ConvNeXt(m) => m.classifier.is_some(),
            Backbone::ViT(m) => m.heads.is_some(),
        }
    }

    /// Remove the final projection, leaving a passthrough, and describe the
    /// heads that should replace it.
    pub fn detach_head(&mut self) -> Result<HeadLayout<B>> {
        match self {
            Backbone::Mlp(m) => plain_layout(m.fc.take(), "fc"),
            Backbone::ResNet(m) => plain_layout(m.fc.take(), "fc"),
            Backbone::DenseNet(m) => plain_layout(m.classifier.take(), "classifier"),
            Backbone::EfficientNet(m) => {
                let classifier = m.classifier.take().ok_or_else(|| detached("classifier"))?;
                Ok(classifier_sequence_layout(
                    classifier.dropout.prob,
                    &classifier.fc,
                ))
            }
            Backbone::ConvNeXt(m) => {
                let classifier = m.classifier.take().ok_or_else(|| detached("classifier"))?;
                Ok(shared_prefix_layout(classifier.norm, &classifier.fc))
            }
            Backbone::ViT(m) => {
                let heads = m.heads.take().ok_or_else(|| detached("heads"))?;
                Ok(single_scalar_layout(&heads.head))
            }
        }
    }

    /// Run the backbone; returns logits while the projection is attached and
    /// the shared feature vector once it has been detached.
    pub fn forward(&self, input: BackboneInput<B>) -> Result<Tensor<B, 2>> {
        match (self, input) {
            (Backbone::Mlp(m), BackboneInput::Tabular(x)) => Ok(m.forward(x)),
            (Backbone::ResNet(m), BackboneInput::Image(x)) => Ok(m.forward(x)),
            (Backbone::DenseNet(m), BackboneInput::Image(x)) => Ok(m.forward(x)),
            (Backbone::EfficientNet(m), BackboneInput::Image(x)) => Ok(m.forward(x)),
            (Backbone::ConvNeXt(m), BackboneInput::Image(x)) => Ok(m.forward(x)),
            (Backbone::ViT(m), BackboneInput::Image(x)) => Ok(m.forward(x)),
            (Backbone::Mlp(_), BackboneInput::Image(_)) => Err(NervusError::Configuration(
                "MLP backbone expects tabular input, got an image batch".to_string(),
            )),
            (_, BackboneInput::Tabular(_)) => Err(NervusError::Configuration(
                "image backbone expects an image batch, got tabular input".to_string(),
            )),
        }
    }
}

impl<B: Backend> WeightNorms<B> for Backbone<B> {
    fn weight_norms(&self) -> Vec<Tensor<B, 1>> {
        match self {
            Backbone::Mlp(m) => m.weight_norms(),
            Backbone::ResNet(m) => m.weight_norms(),
            Backbone::DenseNet(m) => m.weight_norms(),
            Backbone::EfficientNet(m) => m.weight_norms(),
            Backbone::ConvNeXt(m) => m.weight_norms(),
            Backbone::ViT(m) => m.weight_norms(),
        }
    }
}

fn detached(slot: &str) -> NervusError {
    NervusError::Configuration(format!("backbone '{}' has already been detached", slot))
}

fn projection_input_dim<B: Backend>(fc: &Linear<B>) -> usize {
    // burn stores linear weights as [d_input, d_output]
    fc.weight.val().dims()[0]
}

fn plain_layout<B: Backend>(fc: Option<Linear<B>>, slot: &str) -> Result<HeadLayout<B>> {
    let fc = fc.ok_or_else(|| detached(slot))?;
    Ok(HeadLayout {
        kind: BackboneKind::Plain,
        input_dim: projection_input_dim(&fc),
        dropout: None,
        shared_prefix: None,
    })
}

fn classifier_sequence_layout<B: Backend>(dropout: f64, fc: &Linear<B>) -> HeadLayout<B> {
    HeadLayout {
        kind: BackboneKind::ClassifierSequence,
        input_dim: projection_input_dim(fc),
        dropout: Some(dropout),
        shared_prefix: None,
    }
}

fn shared_prefix_layout<B: Backend>(norm: LayerNorm<B>, fc: &Linear<B>) -> HeadLayout<B> {
    HeadLayout {
        kind: BackboneKind::SharedPrefixSequence,
        input_dim: projection_input_dim(fc),
        dropout: None,
        shared_prefix: Some(norm),
    }
}

fn single_scalar_layout<B: Backend>(head: &Linear<B>) -> HeadLayout<B> {
    HeadLayout {
        kind: BackboneKind::SingleScalarHead,
        input_dim: projection_input_dim(head),
        dropout: None,
        shared_prefix: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_net_name_parsing() {
        for net in NetName::ALL {
            assert_eq!(net.as_str().parse::<NetName>().unwrap(), net);
        }
        assert!(matches!(
            "VGG16".parse::<NetName>(),
            Err(NervusError::Configuration(_))
        ));
    }

    #[test]
    fn test_head_prefixes() {
        assert_eq!(NetName::ResNet18.kind().head_name("grade"), "fc_grade");
        assert_eq!(NetName::B0.kind().head_name("grade"), "block_grade");
        assert_eq!(NetName::ConvNeXtTiny.kind().head_name("grade"), "block_grade");
        assert_eq!(NetName::ViTb16.kind().head_name("grade"), "heads_grade");
    }

    #[test]
    fn test_detach_head_reports_layout_once() {
        let device = Default::default();
        let mut backbone = Backbone::<TestBackend>::mlp(&device, 10, 3);
        assert!(backbone.has_projection());

        let layout = backbone.detach_head().unwrap();
        assert_eq!(layout.kind, BackboneKind::Plain);
        assert_eq!(layout.input_dim, 256);
        assert!(!backbone.has_projection());

        assert!(matches!(
            backbone.detach_head(),
            Err(NervusError::Configuration(_))
        ));
    }

    #[test]
    fn test_efficientnet_layout_carries_dropout() {
        let device = Default::default();
        let shape = ImageShape { channels: 1, size: 32 };
        let mut backbone = Backbone::<TestBackend>::image(&device, NetName::B2, shape, 2).unwrap();

        let layout = backbone.detach_head().unwrap();
        assert_eq!(layout.kind, BackboneKind::ClassifierSequence);
        assert_eq!(layout.dropout, Some(0.3));
        assert!(layout.shared_prefix.is_none());
    }

    #[test]
    fn test_convnext_layout_shares_norm() {
        let device = Default::default();
        let shape = ImageShape { channels: 3, size: 32 };
        let mut backbone =
            Backbone::<TestBackend>::image(&device, NetName::ConvNeXtTiny, shape, 2).unwrap();

        let layout = backbone.detach_head().unwrap();
        assert_eq!(layout.kind, BackboneKind::SharedPrefixSequence);
        assert!(layout.shared_prefix.is_some());
    }

    #[test]
    fn test_image_too_small_for_downsampling_is_rejected() {
        let device = Default::default();
        let shape = ImageShape { channels: 3, size: 8 };
        for net in [NetName::ConvNeXtTiny, NetName::ConvNeXtLarge] {
            assert!(matches!(
                Backbone::<TestBackend>::image(&device, net, shape, 2),
                Err(NervusError::Configuration(_))
            ));
        }

        let empty = ImageShape { channels: 3, size: 0 };
        assert!(Backbone::<TestBackend>::image(&device, NetName::ResNet18, empty, 2).is_err());
    }

    #[test]
    fn test_padded_networks_accept_tiny_images() {
        let device = Default::default();
        let shape = ImageShape { channels: 1, size: 1 };
        for net in [NetName::ResNet18, NetName::B0] {
            let backbone = Backbone::<TestBackend>::image(&device, net, shape, 2).unwrap();
            let image = Tensor::<TestBackend, 4>::zeros([2, 1, 1, 1], &device);
            assert_eq!(backbone.forward(BackboneInput::Image(image)).unwrap().dims(), [2, 2]);
        }
    }

    #[test]
    fn test_input_mismatch_is_rejected() {
        let device = Default::default();
        let backbone = Backbone::<TestBackend>::mlp(&device, 4, 2);
        let image = Tensor::<TestBackend, 4>::zeros([2, 1, 8, 8], &device);
        assert!(backbone.forward(BackboneInput::Image(image)).is_err());
    }
}

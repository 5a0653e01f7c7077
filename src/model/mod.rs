//! Neural network architecture
//!
//! Single-output backbones and the multi-task networks built on top of them:
//! - Tabular: MLP
//! - Image: ResNet, DenseNet, EfficientNet, ConvNeXt, ViT
//! - Fusion: image score appended to the tabular inputs

pub mod backbone;
pub mod convnext;
pub mod densenet;
pub mod dispatch;
pub mod efficientnet;
pub mod fusion;
pub mod layers;
pub mod mlp;
pub mod multitask;
pub mod resnet;
pub mod vit;

pub use backbone::{Backbone, BackboneInput, BackboneKind, ImageShape, NetName, WeightNorms};
pub use dispatch::{build_model, ClinicalModel, ModelInputs, ModelSpec};
pub use fusion::FusionNet;
pub use multitask::{MultiTaskNet, TaskOutputs};

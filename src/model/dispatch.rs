//! Model selection from the task kind and the model string

use std::fmt;
use std::str::FromStr;

use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::backbone::{Backbone, BackboneInput, ImageShape, WeightNorms};
use super::fusion::FusionNet;
use super::multitask::{MultiTaskNet, TaskOutputs};
use crate::{NervusError, Result, TaskKind, TaskSet, TaskSpec};

pub use super::backbone::NetName;

const MLP: &str = "MLP";

/// Parsed model string: `MLP`, `<Net>` or `MLP+<Net>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    pub mlp: bool,
    pub net: Option<NetName>,
}

impl ModelSpec {
    pub fn parse(model: &str) -> Result<Self> {
        let mut mlp = false;
        let mut net = None;
        for part in model.split('+').map(str::trim) {
            if part == MLP {
                mlp = true;
            } else if part.is_empty() {
                continue;
            } else if net.is_some() {
                return Err(NervusError::Configuration(format!(
                    "model '{}' names more than one network",
                    model
                )));
            } else {
                net = Some(part.parse::<NetName>()?);
            }
        }

        if !mlp && net.is_none() {
            return Err(NervusError::Configuration(format!(
                "Cannot identify model type: {}",
                model
            )));
        }
        Ok(ModelSpec { mlp, net })
    }

    pub fn is_fusion(&self) -> bool {
        self.mlp && self.net.is_some()
    }
}

impl FromStr for ModelSpec {
    type Err = NervusError;

    fn from_str(s: &str) -> Result<Self> {
        ModelSpec::parse(s)
    }
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.mlp, self.net) {
            (true, Some(net)) => write!(f, "{}+{}", MLP, net),
            (false, Some(net)) => write!(f, "{}", net),
            _ => write!(f, "{}", MLP),
        }
    }
}

/// Inputs for one batch; which ones are required depends on the model
#[derive(Debug, Clone)]
pub struct ModelInputs<B: Backend> {
    pub tabular: Option<Tensor<B, 2>>,
    pub image: Option<Tensor<B, 4>>,
}

/// A multi-task model for one modality combination
#[derive(Module, Debug)]
pub enum ClinicalModel<B: Backend> {
    Tabular(MultiTaskNet<B>),
    Image(MultiTaskNet<B>),
    Fusion(FusionNet<B>),
}

impl<B: Backend> ClinicalModel<B> {
    pub fn head_names(&self) -> &[String] {
        match self {
            ClinicalModel::Tabular(net) | ClinicalModel::Image(net) => net.head_names(),
            ClinicalModel::Fusion(net) => net.head_names(),
        }
    }

    pub fn needs_tabular(&self) -> bool {
        !matches!(self, ClinicalModel::Image(_))
    }

    pub fn needs_image(&self) -> bool {
        !matches!(self, ClinicalModel::Tabular(_))
    }

    pub fn forward(&self, inputs: ModelInputs<B>) -> Result<TaskOutputs<B>> {
        match self {
            ClinicalModel::Tabular(net) => {
                net.forward(BackboneInput::Tabular(require(inputs.tabular, "tabular")?))
            }
            ClinicalModel::Image(net) => {
                net.forward(BackboneInput::Image(require(inputs.image, "image")?))
            }
            ClinicalModel::Fusion(net) => net.forward(
                require(inputs.tabular, "tabular")?,
                require(inputs.image, "image")?,
            ),
        }
    }
}

impl<B: Backend> WeightNorms<B> for ClinicalModel<B> {
    fn weight_norms(&self) -> Vec<Tensor<B, 1>> {
        match self {
            ClinicalModel::Tabular(net) | ClinicalModel::Image(net) => net.weight_norms(),
            ClinicalModel::Fusion(net) => net.weight_norms(),
        }
    }
}

fn require<T>(input: Option<T>, modality: &str) -> Result<T> {
    input.ok_or_else(|| NervusError::MissingData(format!("model expects {} input", modality)))
}

/// Head widths for the task kind: class counts for classification, one
/// value per task otherwise
fn head_tasks(kind: TaskKind, tasks: &TaskSet) -> Result<TaskSet> {
    match kind {
        TaskKind::Classification => Ok(tasks.clone()),
        TaskKind::Regression | TaskKind::Survival => {
            TaskSet::new(tasks.iter().map(|t| TaskSpec::new(&t.name, 1)).collect())
        }
    }
}

/// Build the model for a task kind and parsed model string
pub fn build_model<B: Backend>(
    device: &B::Device,
    kind: TaskKind,
    spec: &ModelSpec,
    tasks: &TaskSet,
    num_inputs: usize,
    shape: ImageShape,
) -> Result<ClinicalModel<B>> {
    let tasks = head_tasks(kind, tasks)?;

    let model = match (spec.mlp, spec.net) {
        (true, None) => ClinicalModel::Tabular(MultiTaskNet::compose(
            device,
            Backbone::mlp(device, num_inputs, 1),
            &tasks,
        )?),
        (false, Some(net)) => ClinicalModel::Image(MultiTaskNet::compose(
            device,
            Backbone::image(device, net, shape, 1)?,
            &tasks,
        )?),
        (true, Some(net)) => {
            ClinicalModel::Fusion(FusionNet::new(device, net, shape, num_inputs, &tasks)?)
        }
        (false, None) => {
            return Err(NervusError::Configuration(
                "model string names neither MLP nor a network".to_string(),
            ))
        }
    };

    log::info!(
        "Built {} model for {} with heads {:?}",
        spec,
        kind,
        model.head_names()
    );
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn tasks() -> TaskSet {
        TaskSet::from_pairs([("grade", 3), ("malignant", 2)]).unwrap()
    }

    const SHAPE: ImageShape = ImageShape {
        channels: 1,
        size: 32,
    };

    #[test]
    fn test_parse_model_string() {
        assert_eq!(
            ModelSpec::parse("MLP").unwrap(),
            ModelSpec { mlp: true, net: None }
        );
        assert_eq!(
            ModelSpec::parse("ResNet18").unwrap(),
            ModelSpec { mlp: false, net: Some(NetName::ResNet18) }
        );
        let fusion = ModelSpec::parse("MLP+ViTb16").unwrap();
        assert!(fusion.is_fusion());
        assert_eq!(fusion.to_string(), "MLP+ViTb16");

        assert!(ModelSpec::parse("").is_err());
        assert!(ModelSpec::parse("VGG16").is_err());
        assert!(ModelSpec::parse("ResNet18+DenseNet").is_err());
    }

    #[test]
    fn test_survival_heads_emit_one_risk() {
        let device = Default::default();
        let spec = ModelSpec::parse("MLP").unwrap();
        let model =
            build_model::<TestBackend>(&device, TaskKind::Survival, &spec, &tasks(), 4, SHAPE)
                .unwrap();

        let inputs = ModelInputs {
            tabular: Some(Tensor::zeros([5, 4], &device)),
            image: None,
        };
        let outputs = model.forward(inputs).unwrap();
        assert_eq!(outputs.for_task("grade").unwrap().dims(), [5, 1]);
        assert_eq!(outputs.for_task("malignant").unwrap().dims(), [5, 1]);
    }

    #[test]
    fn test_missing_modality_is_reported() {
        let device = Default::default();
        let spec = ModelSpec::parse("MLP+ResNet18").unwrap();
        let model = build_model::<TestBackend>(
            &device,
            TaskKind::Classification,
            &spec,
            &tasks(),
            4,
            SHAPE,
        )
        .unwrap();
        assert!(model.needs_tabular() && model.needs_image());

        let inputs = ModelInputs {
            tabular: Some(Tensor::zeros([2, 4], &device)),
            image: None,
        };
        assert!(matches!(
            model.forward(inputs),
            Err(NervusError::MissingData(_))
        ));
    }

    #[test]
    fn test_image_model_heads() {
        let device = Default::default();
        let spec = ModelSpec::parse("DenseNet").unwrap();
        let model = build_model::<TestBackend>(
            &device,
            TaskKind::Classification,
            &spec,
            &tasks(),
            4,
            SHAPE,
        )
        .unwrap();
        assert_eq!(model.head_names(), ["fc_grade", "fc_malignant"]);
        assert!(!model.needs_tabular());
    }
}

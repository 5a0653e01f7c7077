//! Per-task loss criteria
//!
//! A criterion scores one head's prediction against that task's labels.
//! The survival criterion also needs the elapsed time of every sample and
//! the network's weights, which travel in a [`CriterionContext`].

use std::fmt;
use std::str::FromStr;

use burn::nn::loss::{CrossEntropyLossConfig, MseLoss, Reduction};
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor};

use crate::model::WeightNorms;
use crate::{NervusError, Result, TaskKind};

/// L2 weight penalty of the survival criterion
pub const SURVIVAL_L2_WEIGHT: f64 = 0.08;
/// Loss reported for a batch without any event
pub const NO_EVENT_LOSS: f32 = 1e-7;

/// Extra inputs some criteria need
pub struct CriterionContext<'a, B: Backend> {
    /// Elapsed time per sample, [batch]
    pub period: Option<Tensor<B, 1>>,
    /// Network whose weights are regularized
    pub network: Option<&'a dyn WeightNorms<B>>,
}

impl<'a, B: Backend> CriterionContext<'a, B> {
    pub fn empty() -> Self {
        CriterionContext {
            period: None,
            network: None,
        }
    }

    pub fn survival(period: Tensor<B, 1>, network: &'a dyn WeightNorms<B>) -> Self {
        CriterionContext {
            period: Some(period),
            network: Some(network),
        }
    }
}

pub trait Criterion<B: Backend> {
    /// Loss of one task
    ///
    /// # Arguments
    /// * `prediction` - [batch, num_outputs]
    /// * `label` - [batch]; class index, target value or event indicator
    fn loss(
        &self,
        prediction: Tensor<B, 2>,
        label: Tensor<B, 1>,
        context: &CriterionContext<'_, B>,
    ) -> Result<Tensor<B, 1>>;
}

/// Criterion names accepted in the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriterionKind {
    CrossEntropy,
    Mse,
    Rmse,
    Mae,
    NegativeLogLikelihood,
}

impl CriterionKind {
    /// The task kind this criterion applies to
    pub fn task_kind(&self) -> TaskKind {
        match self {
            CriterionKind::CrossEntropy => TaskKind::Classification,
            CriterionKind::Mse | CriterionKind::Rmse | CriterionKind::Mae => TaskKind::Regression,
            CriterionKind::NegativeLogLikelihood => TaskKind::Survival,
        }
    }

    pub fn check_task(&self, kind: TaskKind) -> Result<()> {
        if self.task_kind() == kind {
            Ok(())
        } else {
            Err(NervusError::Configuration(format!(
                "criterion {} does not apply to {}",
                self, kind
            )))
        }
    }

    pub fn build<B: Backend>(&self) -> Box<dyn Criterion<B>> {
        match self {
            CriterionKind::CrossEntropy => Box::new(CrossEntropy),
            CriterionKind::Mse => Box::new(Regression::Mse),
            CriterionKind::Rmse => Box::new(Regression::Rmse),
            CriterionKind::Mae => Box::new(Regression::Mae),
            CriterionKind::NegativeLogLikelihood => Box::new(NegativeLogLikelihood::default()),
        }
    }
}

impl fmt::Display for CriterionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CriterionKind::CrossEntropy => "CEL",
            CriterionKind::Mse => "MSE",
            CriterionKind::Rmse => "RMSE",
            CriterionKind::Mae => "MAE",
            CriterionKind::NegativeLogLikelihood => "NLL",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for CriterionKind {
    type Err = NervusError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CEL" => Ok(CriterionKind::CrossEntropy),
            "MSE" => Ok(CriterionKind::Mse),
            "RMSE" => Ok(CriterionKind::Rmse),
            "MAE" => Ok(CriterionKind::Mae),
            "NLL" => Ok(CriterionKind::NegativeLogLikelihood),
            other => Err(NervusError::Configuration(format!(
                "No specified criterion: {}",
                other
            ))),
        }
    }
}

/// Cross-entropy over class logits
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropy;

impl<B: Backend> Criterion<B> for CrossEntropy {
    fn loss(
        &self,
        prediction: Tensor<B, 2>,
        label: Tensor<B, 1>,
        _context: &CriterionContext<'_, B>,
    ) -> Result<Tensor<B, 1>> {
        let loss = CrossEntropyLossConfig::new().init(&prediction.device());
        Ok(loss.forward(prediction, label.int()))
    }
}

/// Regression error on the first output column
#[derive(Debug, Clone, Copy)]
pub enum Regression {
    Mse,
    Rmse,
    Mae,
}

impl<B: Backend> Criterion<B> for Regression {
    fn loss(
        &self,
        prediction: Tensor<B, 2>,
        label: Tensor<B, 1>,
        _context: &CriterionContext<'_, B>,
    ) -> Result<Tensor<B, 1>> {
        let [batch, _] = prediction.dims();
        let prediction: Tensor<B, 1> = prediction.slice([0..batch, 0..1]).reshape([batch]);

        let loss = match self {
            Regression::Mse => MseLoss::new().forward(prediction, label, Reduction::Mean),
            Regression::Rmse => MseLoss::new()
                .forward(prediction, label, Reduction::Mean)
                .sqrt(),
            Regression::Mae => (prediction - label).abs().mean(),
        };
        Ok(loss)
    }
}

/// Negative Cox partial log-likelihood with an L2 weight penalty
#[derive(Debug, Clone, Copy)]
pub struct NegativeLogLikelihood {
    pub l2_weight: f64,
}

impl Default for NegativeLogLikelihood {
    fn default() -> Self {
        NegativeLogLikelihood {
            l2_weight: SURVIVAL_L2_WEIGHT,
        }
    }
}

impl<B: Backend> Criterion<B> for NegativeLogLikelihood {
    fn loss(
        &self,
        prediction: Tensor<B, 2>,
        label: Tensor<B, 1>,
        context: &CriterionContext<'_, B>,
    ) -> Result<Tensor<B, 1>> {
        let period = context.period.clone().ok_or_else(|| {
            NervusError::MissingData("survival criterion needs the elapsed time".to_string())
        })?;
        let network = context.network.ok_or_else(|| {
            NervusError::MissingData("survival criterion needs the network".to_string())
        })?;

        let device = prediction.device();
        let [batch, _] = prediction.dims();
        let risk = prediction.slice([0..batch, 0..1]);
        let events = label.reshape([batch, 1]);

        let num_events: f32 = events.clone().sum().into_scalar().elem();
        if num_events == 0.0 {
            return Ok(Tensor::from_floats([NO_EVENT_LOSS], &device));
        }

        // mask[i, j] = 1 when sample i is still at risk at the time of sample j
        let later = period.clone().reshape([1, batch]).expand([batch, batch]);
        let current = period.reshape([batch, 1]).expand([batch, batch]);
        let mask = (later - current).lower_equal_elem(0.0).float();

        let at_risk = risk.clone().exp().expand([batch, batch]) * mask.clone();
        let mean_risk = at_risk.sum_dim(0) / mask.sum_dim(0);
        let log_risk = mean_risk.log().reshape([batch, 1]);

        let neg_log_loss = ((risk - log_risk) * events).sum().neg() / num_events;

        let penalty = network
            .weight_norms()
            .into_iter()
            .reduce(|acc, norm| acc + norm)
            .map(|norms| norms * self.l2_weight);

        Ok(match penalty {
            Some(penalty) => neg_log_loss + penalty,
            None => neg_log_loss,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    struct NoWeights;

    impl WeightNorms<TestBackend> for NoWeights {
        fn weight_norms(&self) -> Vec<Tensor<TestBackend, 1>> {
            Vec::new()
        }
    }

    /// Two weight tensors with norms 3 and 4
    struct FixedWeights;

    impl WeightNorms<TestBackend> for FixedWeights {
        fn weight_norms(&self) -> Vec<Tensor<TestBackend, 1>> {
            vec![vector(vec![3.0]), vector(vec![4.0])]
        }
    }

    fn scalar(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_scalar().elem()
    }

    fn column(values: Vec<f32>) -> Tensor<TestBackend, 2> {
        let n = values.len();
        Tensor::from_data(TensorData::new(values, [n, 1]), &Default::default())
    }

    fn vector(values: Vec<f32>) -> Tensor<TestBackend, 1> {
        let n = values.len();
        Tensor::from_data(TensorData::new(values, [n]), &Default::default())
    }

    #[test]
    fn test_criterion_names() {
        for name in ["CEL", "MSE", "RMSE", "MAE", "NLL"] {
            assert_eq!(name.parse::<CriterionKind>().unwrap().to_string(), name);
        }
        assert!("BCE".parse::<CriterionKind>().is_err());
    }

    #[test]
    fn test_criterion_must_match_task() {
        assert!(CriterionKind::CrossEntropy
            .check_task(TaskKind::Classification)
            .is_ok());
        assert!(CriterionKind::Mae.check_task(TaskKind::Regression).is_ok());
        assert!(matches!(
            CriterionKind::Mse.check_task(TaskKind::Survival),
            Err(NervusError::Configuration(_))
        ));
    }

    #[test]
    fn test_regression_criteria() {
        let ctx = CriterionContext::empty();
        let pred = column(vec![1.0, 2.0, 3.0]);
        let label = vector(vec![1.0, 4.0, 1.0]);

        let mse = scalar(Regression::Mse.loss(pred.clone(), label.clone(), &ctx).unwrap());
        let rmse = scalar(Regression::Rmse.loss(pred.clone(), label.clone(), &ctx).unwrap());
        let mae = scalar(Regression::Mae.loss(pred, label, &ctx).unwrap());

        assert!((mse - 8.0 / 3.0).abs() < 1e-5);
        assert!((rmse - (8.0f32 / 3.0).sqrt()).abs() < 1e-5);
        assert!((mae - 4.0 / 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_cross_entropy_of_uniform_logits() {
        let device = Default::default();
        let pred = Tensor::<TestBackend, 2>::zeros([4, 2], &device);
        let label = vector(vec![0.0, 1.0, 1.0, 0.0]);
        let loss = scalar(
            CrossEntropy
                .loss(pred, label, &CriterionContext::empty())
                .unwrap(),
        );
        assert!((loss - 2.0f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_survival_without_events() {
        let network = NoWeights;
        let ctx = CriterionContext::survival(vector(vec![3.0, 1.0, 2.0]), &network);
        let loss = NegativeLogLikelihood::default()
            .loss(column(vec![0.1, 0.2, 0.3]), vector(vec![0.0, 0.0, 0.0]), &ctx)
            .unwrap();
        assert_eq!(scalar(loss), NO_EVENT_LOSS);
    }

    #[test]
    fn test_survival_partial_likelihood() {
        let network = NoWeights;
        // Periods 1, 2, 3; only the earliest sample has an event.
        // Its risk set is everyone, so the loss is log(mean(exp(risk))) - risk_0.
        let ctx = CriterionContext::survival(vector(vec![1.0, 2.0, 3.0]), &network);
        let loss = NegativeLogLikelihood::default()
            .loss(column(vec![0.0, 0.0, 0.0]), vector(vec![1.0, 0.0, 0.0]), &ctx)
            .unwrap();
        assert!(scalar(loss).abs() < 1e-6);
    }

    #[test]
    fn test_survival_adds_weighted_l2_penalty() {
        let network = FixedWeights;
        let ctx = CriterionContext::survival(vector(vec![1.0, 2.0, 3.0]), &network);
        // Zero partial likelihood term, so only 0.08 * (3 + 4) remains
        let loss = NegativeLogLikelihood::default()
            .loss(column(vec![0.0, 0.0, 0.0]), vector(vec![1.0, 0.0, 0.0]), &ctx)
            .unwrap();
        assert!((scalar(loss) - 0.08 * 7.0).abs() < 1e-6);

        let heavier = NegativeLogLikelihood { l2_weight: 0.5 }
            .loss(column(vec![0.0, 0.0, 0.0]), vector(vec![1.0, 0.0, 0.0]), &ctx)
            .unwrap();
        assert!((scalar(heavier) - 3.5).abs() < 1e-6);
    }

    #[test]
    fn test_survival_requires_context() {
        let result = NegativeLogLikelihood::default().loss(
            column(vec![0.0]),
            vector(vec![1.0]),
            &CriterionContext::empty(),
        );
        assert!(matches!(result, Err(NervusError::MissingData(_))));
    }
}

//! Prediction and evaluation
//!
//! Per-sample likelihoods of a trained model and ROC/AUC over them.

pub mod likelihood;
pub mod roc;

pub use likelihood::{Likelihood, LikelihoodRow, Predictor, Split};
pub use roc::{roc_curve, RocCurve};

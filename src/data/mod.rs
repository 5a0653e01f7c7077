//! Data plumbing
//!
//! In-memory samples, batching for burn data loaders, and seeded synthetic
//! data for dry runs.

pub mod dataset;
pub mod synthetic;

pub use dataset::{ClinicalBatch, ClinicalBatcher, ClinicalDataset, ClinicalSample, TaskLabels};
pub use synthetic::{synthetic_samples, SyntheticConfig};

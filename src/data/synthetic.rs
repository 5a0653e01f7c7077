//! Seeded synthetic samples for dry runs
//!
//! Labels depend on the first tabular feature (or the mean image intensity
//! when there are no tabular inputs), so a model can actually fit them.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::dataset::ClinicalSample;
use crate::model::ImageShape;
use crate::{TaskKind, TaskSet};

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub num_samples: usize,
    pub num_inputs: usize,
    /// Generate images of this shape
    pub image: Option<ImageShape>,
    pub kind: TaskKind,
    pub seed: u64,
}

/// Generate `num_samples` samples with one label per task
pub fn synthetic_samples(config: &SyntheticConfig, tasks: &TaskSet) -> Vec<ClinicalSample> {
    let mut rng = StdRng::seed_from_u64(config.seed);

    (0..config.num_samples)
        .map(|_| {
            let tabular: Vec<f32> = (0..config.num_inputs)
                .map(|_| rng.random_range(-1.0..1.0))
                .collect();
            let image = config.image.map(|shape| {
                let len = shape.channels * shape.size * shape.size;
                (0..len).map(|_| rng.random_range(0.0..1.0)).collect::<Vec<f32>>()
            });

            let signal = match (tabular.first(), &image) {
                (Some(x), _) => (*x + 1.0) / 2.0,
                (None, Some(pixels)) => pixels.iter().sum::<f32>() / pixels.len().max(1) as f32,
                (None, None) => rng.random_range(0.0..1.0),
            };

            let labels = tasks
                .iter()
                .map(|task| match config.kind {
                    TaskKind::Classification => {
                        let class = (signal * task.num_outputs as f32) as usize;
                        class.min(task.num_outputs - 1) as f32
                    }
                    TaskKind::Regression => signal * 10.0 + rng.random_range(-0.5..0.5),
                    TaskKind::Survival => {
                        if rng.random_bool(0.6) {
                            1.0
                        } else {
                            0.0
                        }
                    }
                })
                .collect();

            let period = config
                .kind
                .is_survival()
                .then(|| (1.0 - signal) * 100.0 + rng.random_range(1.0..10.0));

            ClinicalSample {
                tabular,
                image,
                labels,
                period,
            }
        })
        .collect()
}

//! Learning-curve export
//!
//! One CSV per task plus `total`, each row holding an epoch's train and
//! validation loss. The file name records the best validation epoch and loss.

use std::fs::File;
use std::path::{Path, PathBuf};

use csv::WriterBuilder;
use serde::{Deserialize, Serialize};

use super::loss_store::{EpochLoss, LossStore, Phase};
use crate::{NervusError, Result};

/// One epoch of a learning curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurveRow {
    pub train_loss: Option<f64>,
    pub val_loss: Option<f64>,
}

/// `learning_curve_<key>_val-best-epoch-NNN_val-best-loss-X.XXXX.csv`
pub fn curve_file_name(key: &str, loss: &EpochLoss) -> Result<String> {
    let (epoch, best) = match (loss.display_best_epoch(), loss.best_val_loss()) {
        (Some(epoch), Some(best)) => (epoch, best),
        _ => {
            return Err(NervusError::MissingData(format!(
                "no best validation epoch for '{}'",
                key
            )))
        }
    };
    Ok(format!(
        "learning_curve_{}_val-best-epoch-{:03}_val-best-loss-{:.4}.csv",
        key, epoch, best
    ))
}

pub fn curve_rows(loss: &EpochLoss) -> Vec<CurveRow> {
    let train = loss.history(Phase::Train);
    let val = loss.history(Phase::Validation);
    (0..train.len().max(val.len()))
        .map(|i| CurveRow {
            train_loss: train.get(i).copied(),
            val_loss: val.get(i).copied(),
        })
        .collect()
}

/// Write every task's curve and the `total` curve into `dir`
pub fn save_learning_curves(store: &LossStore, dir: &Path) -> Result<Vec<PathBuf>> {
    // Resolve every name first so a missing best epoch writes nothing
    let named = store
        .iter()
        .map(|(key, loss)| Ok((dir.join(curve_file_name(key, loss)?), loss)))
        .collect::<Result<Vec<_>>>()?;

    std::fs::create_dir_all(dir)?;
    let mut paths = Vec::with_capacity(named.len());
    for (path, loss) in named {
        let file = File::create(&path)?;
        let mut writer = WriterBuilder::new().has_headers(true).from_writer(file);
        for row in curve_rows(loss) {
            writer.serialize(row)?;
        }
        writer.flush()?;
        log::debug!("Saved learning curve {}", path.display());
        paths.push(path);
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TaskLabels;
    use crate::model::multitask::{TaskOutput, TaskOutputs};
    use crate::training::criterion::{Criterion, CriterionContext};
    use crate::TaskSet;
    use burn::backend::NdArray;
    use burn::tensor::Tensor;

    type TestBackend = NdArray<f32>;

    struct Mean;

    impl Criterion<TestBackend> for Mean {
        fn loss(
            &self,
            prediction: Tensor<TestBackend, 2>,
            _label: Tensor<TestBackend, 1>,
            _context: &CriterionContext<'_, TestBackend>,
        ) -> Result<Tensor<TestBackend, 1>> {
            Ok(prediction.mean())
        }
    }

    fn phase(store: &mut LossStore, epoch: usize, phase: Phase, value: f32) {
        let device = Default::default();
        let outputs = TaskOutputs::new(vec![TaskOutput {
            task: "grade".to_string(),
            head: "fc_grade".to_string(),
            prediction: Tensor::full([1, 1], value, &device),
        }]);
        let labels = TaskLabels::new(vec![("grade".to_string(), Tensor::zeros([1], &device))]);
        store
            .compute_batch_loss(&outputs, &labels, &Mean, &CriterionContext::empty())
            .unwrap();
        store.accumulate_running_loss(Some(1)).unwrap();
        store.finalize_epoch(epoch, phase, Some(1)).unwrap();
    }

    fn trained_store() -> LossStore {
        let mut store = LossStore::new(&TaskSet::from_pairs([("grade", 3)]).unwrap());
        for (epoch, (train, val)) in [(1.0, 0.75), (0.5, 0.25), (0.25, 0.5)].into_iter().enumerate() {
            phase(&mut store, epoch, Phase::Train, train);
            phase(&mut store, epoch, Phase::Validation, val);
        }
        store
    }

    #[test]
    fn test_curve_file_name() {
        let store = trained_store();
        let name = curve_file_name("grade", store.epoch_loss("grade").unwrap()).unwrap();
        assert_eq!(
            name,
            "learning_curve_grade_val-best-epoch-002_val-best-loss-0.2500.csv"
        );
    }

    #[test]
    fn test_curves_written_per_task_and_total() {
        let dir = tempfile::tempdir().unwrap();
        let paths = save_learning_curves(&trained_store(), dir.path()).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[1]
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("learning_curve_total_"));

        let mut reader = csv::Reader::from_path(&paths[0]).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.iter().collect::<Vec<_>>(), vec!["train_loss", "val_loss"]);

        let rows: Vec<CurveRow> = reader.deserialize().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].val_loss, Some(0.25));
    }

    #[test]
    fn test_nothing_written_without_validation() {
        let dir = tempfile::tempdir().unwrap();
        let store = LossStore::new(&TaskSet::from_pairs([("grade", 3)]).unwrap());
        let out = dir.path().join("curves");
        assert!(save_learning_curves(&store, &out).is_err());
        assert!(!out.exists());
    }
}

//! Epoch progress line

use super::loss_store::{LossStore, Phase};
use crate::{NervusError, Result};

/// Format the aggregate train and validation loss of an epoch, e.g.
/// `epoch [  2/10 ], train_loss:   0.4123, val_loss:   0.5012   Updated best val_loss!`
pub fn format_epoch_loss(store: &LossStore, num_epochs: usize, epoch: usize) -> Result<String> {
    let total = store.total();
    let train_loss = total
        .latest(Phase::Train)
        .ok_or_else(|| NervusError::MissingData("no train loss recorded yet".to_string()))?;
    let val_loss = total
        .latest(Phase::Validation)
        .ok_or_else(|| NervusError::MissingData("no val loss recorded yet".to_string()))?;

    let updated = if epoch > 0 && total.is_updated() {
        "   Updated best val_loss!"
    } else {
        ""
    };

    Ok(format!(
        "epoch [{:>3}/{:<3}], train_loss: {:>8.4}, val_loss: {:>8.4}{}",
        epoch + 1,
        num_epochs,
        train_loss,
        val_loss,
        updated
    ))
}

/// Log the epoch progress line
pub fn log_epoch_loss(store: &LossStore, num_epochs: usize, epoch: usize) -> Result<()> {
    log::info!("{}", format_epoch_loss(store, num_epochs, epoch)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::criterion::{Criterion, CriterionContext};
    use crate::TaskSet;

    fn run_epoch(store: &mut LossStore, epoch: usize, train: f64, val: f64) {
        feed(store, train);
        store.finalize_epoch(epoch, Phase::Train, Some(1)).unwrap();
        feed(store, val);
        store.finalize_epoch(epoch, Phase::Validation, Some(1)).unwrap();
    }

    fn new_store() -> LossStore {
        LossStore::new(&TaskSet::from_pairs([("grade", 3)]).unwrap())
    }

    fn feed(store: &mut LossStore, value: f64) {
        use crate::data::TaskLabels;
        use crate::model::multitask::{TaskOutput, TaskOutputs};
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

        let device = Default::default();
        let outputs = TaskOutputs::new(vec![TaskOutput {
            task: "grade".to_string(),
            head: "fc_grade".to_string(),
            prediction: Tensor::full([1, 1], value as f32, &device),
        }]);
        let labels = TaskLabels::new(vec![("grade".to_string(), Tensor::zeros([1], &device))]);
        store
            .compute_batch_loss(&outputs, &labels, &Mean, &CriterionContext::empty())
            .unwrap();
        store.accumulate_running_loss(Some(1)).unwrap();
    }

    #[test]
    fn test_first_epoch_line() {
        let mut store = new_store();
        run_epoch(&mut store, 0, 0.5, 0.25);
        let line = format_epoch_loss(&store, 10, 0).unwrap();
        assert_eq!(line, "epoch [  1/10 ], train_loss:   0.5000, val_loss:   0.2500");
    }

    #[test]
    fn test_updated_suffix_after_first_epoch() {
        let mut store = new_store();
        run_epoch(&mut store, 0, 0.5, 0.5);
        run_epoch(&mut store, 1, 0.5, 0.25);

        let line = format_epoch_loss(&store, 3, 1).unwrap();
        assert!(line.starts_with("epoch [  2/3  ]"));
        assert!(line.ends_with("   Updated best val_loss!"));
    }

    #[test]
    fn test_missing_history_is_an_error() {
        assert!(format_epoch_loss(&new_store(), 1, 0).is_err());
    }
}

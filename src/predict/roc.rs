//! ROC curve and AUC for binary classification heads

/// Receiver operating characteristic of one score column
#[derive(Debug, Clone, PartialEq)]
pub struct RocCurve {
    /// False positive rate per threshold, starting at 0
    pub fpr: Vec<f64>,
    /// True positive rate per threshold, starting at 0
    pub tpr: Vec<f64>,
    /// Score thresholds, highest first; the first is +inf
    pub thresholds: Vec<f64>,
    pub auc: f64,
}

/// Build the ROC curve from `(score, is_positive)` pairs.
///
/// Tied scores form a single threshold. Returns `None` unless both classes
/// are present.
pub fn roc_curve(samples: impl IntoIterator<Item = (f64, bool)>) -> Option<RocCurve> {
    let mut pairs: Vec<(f64, bool)> = samples.into_iter().collect();
    let positives = pairs.iter().filter(|(_, positive)| *positive).count();
    let negatives = pairs.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    // Highest score first
    pairs.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut fpr = vec![0.0];
    let mut tpr = vec![0.0];
    let mut thresholds = vec![f64::INFINITY];
    let (mut tp, mut fp) = (0usize, 0usize);

    for (i, &(score, positive)) in pairs.iter().enumerate() {
        if positive {
            tp += 1;
        } else {
            fp += 1;
        }
        let last_of_tie = pairs.get(i + 1).is_none_or(|next| next.0 != score);
        if last_of_tie {
            fpr.push(fp as f64 / negatives as f64);
            tpr.push(tp as f64 / positives as f64);
            thresholds.push(score);
        }
    }

    let auc = trapezoid(&fpr, &tpr);
    Some(RocCurve {
        fpr,
        tpr,
        thresholds,
        auc,
    })
}

fn trapezoid(x: &[f64], y: &[f64]) -> f64 {
    x.windows(2)
        .zip(y.windows(2))
        .map(|(x, y)| (x[1] - x[0]) * (y[1] + y[0]) / 2.0)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auc(scores: &[f64], labels: &[bool]) -> Option<f64> {
        roc_curve(scores.iter().copied().zip(labels.iter().copied())).map(|roc| roc.auc)
    }

    #[test]
    fn test_auc_of_separable_scores() {
        let labels = [false, false, true, true];
        assert_eq!(auc(&[0.1, 0.2, 0.8, 0.9], &labels), Some(1.0));
        assert_eq!(auc(&[0.9, 0.8, 0.2, 0.1], &labels), Some(0.0));
    }

    #[test]
    fn test_auc_with_one_swapped_pair() {
        let roc = roc_curve([(0.1, false), (0.4, false), (0.35, true), (0.8, true)]).unwrap();
        assert!((roc.auc - 0.75).abs() < 1e-12);
        assert_eq!(roc.fpr, vec![0.0, 0.0, 0.5, 0.5, 1.0]);
        assert_eq!(roc.tpr, vec![0.0, 0.5, 0.5, 1.0, 1.0]);
        assert_eq!(roc.thresholds[1], 0.8);
    }

    #[test]
    fn test_tied_scores_share_a_threshold() {
        let roc = roc_curve([(0.5, true), (0.5, false)]).unwrap();
        assert_eq!(roc.thresholds.len(), 2);
        assert!((roc.auc - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_single_class_has_no_curve() {
        assert_eq!(auc(&[0.2, 0.7], &[true, true]), None);
        assert_eq!(auc(&[], &[]), None);
    }
}

//! Cross-entropy and top-k accuracy over the labeled rows of a batch.
//!
//! Rows whose label is [`UNLABELED`] are excluded from both metrics. A batch
//! without any labeled row yields `None` for both.

use burn::nn::loss::CrossEntropyLossConfig;
use burn::tensor::{backend::Backend, Int, Tensor};
use oct_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::host::{index_tensor, int_values, scalar_value};

/// Label value marking a row without ground truth
pub const UNLABELED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabeledMetrics {
    pub cross_entropy: Option<f64>,
    pub acc_top1: Option<f64>,
    pub labeled_count: usize,
}

/// Logits and labels of the labeled rows only
struct LabeledRows<B: Backend> {
    logits: Tensor<B, 2>,
    labels: Tensor<B, 1, Int>,
    count: usize,
}

/// Validate a batch and keep the rows whose label is not [`UNLABELED`]
fn labeled_rows<B: Backend>(
    logits: Tensor<B, 2>,
    labels: Tensor<B, 1, Int>,
) -> Result<Option<LabeledRows<B>>> {
    let [rows, num_classes] = logits.dims();
    if num_classes == 0 {
        return Err(Error::Shape(format!("logits of shape [{rows}, 0] have no classes")));
    }

    let host_labels = int_values(labels.clone())?;
    if host_labels.len() != rows {
        return Err(Error::Shape(format!(
            "{rows} logit rows but {} labels",
            host_labels.len()
        )));
    }
    if let Some(bad) = host_labels
        .iter()
        .find(|&&l| l != UNLABELED && (l < 0 || l as usize >= num_classes))
    {
        return Err(Error::InvalidArgument(format!(
            "label {bad} is outside 0..{num_classes}"
        )));
    }

    let labeled: Vec<usize> = host_labels
        .iter()
        .enumerate()
        .filter(|(_, l)| **l != UNLABELED)
        .map(|(i, _)| i)
        .collect();
    if labeled.is_empty() {
        return Ok(None);
    }

    let count = labeled.len();
    let index = index_tensor::<B>(&labeled, &logits.device());
    Ok(Some(LabeledRows {
        logits: logits.select(0, index.clone()),
        labels: labels.select(0, index),
        count,
    }))
}

fn count_true<B: Backend>(hits: Tensor<B, 1, Int>) -> Result<usize> {
    let total = int_values(hits.sum())?;
    Ok(total.first().copied().unwrap_or(0) as usize)
}

impl<B: Backend> LabeledRows<B> {
    fn cross_entropy(&self) -> Result<f64> {
        let loss = CrossEntropyLossConfig::new()
            .init(&self.logits.device())
            .forward(self.logits.clone(), self.labels.clone());
        scalar_value(loss)
    }

    fn top1_accuracy(&self) -> Result<f64> {
        let predictions = self.logits.clone().argmax(1).reshape([self.count]);
        let correct = count_true(predictions.equal(self.labels.clone()).int())?;
        Ok(correct as f64 / self.count as f64)
    }

    /// A row is a hit when fewer than `k` logits exceed the logit of its label
    fn top_k_accuracy(&self, k: usize) -> Result<f64> {
        let [rows, num_classes] = self.logits.dims();
        let target = self
            .logits
            .clone()
            .gather(1, self.labels.clone().reshape([rows, 1]))
            .repeat_dim(1, num_classes);
        let higher = self.logits.clone().greater(target).int().sum_dim(1);
        let hits = higher.lower_elem(k as i64).int().reshape([rows]);
        Ok(count_true(hits)? as f64 / rows as f64)
    }
}

/// Fraction of labeled rows whose label is among the `k` highest logits.
///
/// Ties are resolved in favour of the label.
pub fn masked_top_k_accuracy<B: Backend>(
    logits: Tensor<B, 2>,
    labels: Tensor<B, 1, Int>,
    k: usize,
) -> Result<Option<f64>> {
    labeled_rows(logits, labels)?
        .map(|rows| rows.top_k_accuracy(k))
        .transpose()
}

/// Mean cross-entropy of the labeled rows
pub fn masked_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    labels: Tensor<B, 1, Int>,
) -> Result<Option<f64>> {
    labeled_rows(logits, labels)?
        .map(|rows| rows.cross_entropy())
        .transpose()
}

/// Cross-entropy and top-1 accuracy of a batch of logits
pub fn labeled_metrics<B: Backend>(
    logits: Tensor<B, 2>,
    labels: Tensor<B, 1, Int>,
) -> Result<LabeledMetrics> {
    let Some(rows) = labeled_rows(logits, labels)? else {
        return Ok(LabeledMetrics {
            cross_entropy: None,
            acc_top1: None,
            labeled_count: 0,
        });
    };

    Ok(LabeledMetrics {
        cross_entropy: Some(rows.cross_entropy()?),
        acc_top1: Some(rows.top1_accuracy()?),
        labeled_count: rows.count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::float_tensor;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type B = NdArray;

    const LOGITS: [f32; 8] = [
        2.0, 1.0, // predicts 0
        0.0, 3.0, // predicts 1
        5.0, 0.0, // predicts 0
        1.0, 4.0, // predicts 1
    ];

    fn logits(values: &[f32], classes: usize) -> Tensor<B, 2> {
        let rows = if classes == 0 { 2 } else { values.len() / classes };
        float_tensor::<B, 2>(values.to_vec(), [rows, classes], &Default::default()).unwrap()
    }

    fn labels(values: &[i64]) -> Tensor<B, 1, Int> {
        Tensor::from_data(TensorData::new(values.to_vec(), [values.len()]), &Default::default())
    }

    #[test]
    fn test_top1_ignores_unlabeled_rows() {
        let metrics = labeled_metrics(logits(&LOGITS, 2), labels(&[0, 0, -1, 1])).unwrap();
        assert!((metrics.acc_top1.unwrap() - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(metrics.labeled_count, 3);

        let top1 = masked_top_k_accuracy(logits(&LOGITS, 2), labels(&[0, 0, -1, 1]), 1).unwrap();
        assert!((top1.unwrap() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_top_k_includes_runner_up() {
        let values = [0.1, 0.5, 0.4, 0.9, 0.05, 0.05];
        let top1 = masked_top_k_accuracy(logits(&values, 3), labels(&[2, 1]), 1).unwrap();
        let top2 = masked_top_k_accuracy(logits(&values, 3), labels(&[2, 1]), 2).unwrap();
        assert_eq!(top1, Some(0.0));
        assert_eq!(top2, Some(1.0));
    }

    #[test]
    fn test_all_unlabeled_gives_none() {
        let unlabeled = [-1, -1, -1, -1];
        assert_eq!(masked_top_k_accuracy(logits(&LOGITS, 2), labels(&unlabeled), 1).unwrap(), None);
        assert_eq!(masked_cross_entropy(logits(&LOGITS, 2), labels(&unlabeled)).unwrap(), None);

        let metrics = labeled_metrics(logits(&LOGITS, 2), labels(&unlabeled)).unwrap();
        assert_eq!(metrics.acc_top1, None);
        assert_eq!(metrics.cross_entropy, None);
        assert_eq!(metrics.labeled_count, 0);
    }

    #[test]
    fn test_cross_entropy_of_uniform_logits() {
        let ce = masked_cross_entropy(logits(&[0.0; 8], 4), labels(&[3, 1])).unwrap();
        assert!((ce.unwrap() - 4f64.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_cross_entropy_skips_unlabeled_rows() {
        // scored against label 0 the second row would add a loss of about 10
        let values = [10.0, 0.0, 0.0, 10.0];
        let ce = masked_cross_entropy(logits(&values, 2), labels(&[0, -1])).unwrap();
        assert!(ce.unwrap() < 1e-3);
    }

    #[test]
    fn test_zero_classes_rejected() {
        assert!(matches!(
            labeled_metrics(logits(&[], 0), labels(&[-1, -1])),
            Err(Error::Shape(_))
        ));
    }

    #[test]
    fn test_labeled_metrics_rejects_bad_labels() {
        assert!(matches!(
            labeled_metrics(logits(&LOGITS, 2), labels(&[0, 2, 0, 1])),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_labeled_metrics_row_mismatch() {
        assert!(matches!(
            labeled_metrics(logits(&LOGITS, 2), labels(&[0, 1, 0])),
            Err(Error::Shape(_))
        ));
    }
}

//! Scalar diagnostics produced by the training step.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Destination for named scalar diagnostics
pub trait MetricsSink {
    /// Record one value of a named scalar
    fn add_scalar(&mut self, name: &str, value: f64);
}

/// Diagnostics of a single train or test step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepDiagnostics {
    /// Combined loss `losses_l + w * losses_u` (0 in test mode)
    pub loss: f64,
    /// Labeled (soft cross-entropy) loss
    pub losses_l: Option<f64>,
    /// Unlabeled (squared error) loss
    pub losses_u: Option<f64>,
    /// Ramped unlabeled loss weight
    pub w: Option<f64>,
    /// Cross-entropy of the evaluated model on labeled rows
    pub cross_entropy: Option<f64>,
    /// Top-1 accuracy over rows with a label other than -1
    pub acc_top1: Option<f64>,
    /// Number of rows that carried a label
    pub labeled_count: usize,
}

impl StepDiagnostics {
    /// Push every available scalar into the sink
    pub fn publish(&self, sink: &mut dyn MetricsSink) {
        sink.add_scalar("loss", self.loss);

        let optional = [
            ("losses_l", self.losses_l),
            ("losses_u", self.losses_u),
            ("w", self.w),
            ("cross_entropy", self.cross_entropy),
            ("acc_top1", self.acc_top1),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                sink.add_scalar(name, value);
            }
        }
    }
}

/// Metric series collected over an epoch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsHistory {
    series: BTreeMap<String, Vec<f64>>,
}

impl MetricsHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded values of a metric
    pub fn values(&self, name: &str) -> &[f64] {
        self.series.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Mean of a metric, `None` if it was never recorded
    pub fn mean(&self, name: &str) -> Option<f64> {
        let values = self.values(name);
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }

    /// Most recent value of a metric
    pub fn last(&self, name: &str) -> Option<f64> {
        self.values(name).last().copied()
    }

    /// Means of all metrics, keyed by name
    pub fn means(&self) -> BTreeMap<String, f64> {
        self.series
            .keys()
            .filter_map(|name| self.mean(name).map(|m| (name.clone(), m)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn clear(&mut self) {
        self.series.clear();
    }
}

impl MetricsSink for MetricsHistory {
    fn add_scalar(&mut self, name: &str, value: f64) {
        self.series.entry(name.to_string()).or_default().push(value);
    }
}

/// Summary of one epoch, written to disk by the training tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train: BTreeMap<String, f64>,
    pub test: Option<BTreeMap<String, f64>>,
}

impl EpochSummary {
    pub fn new(epoch: usize, train: &MetricsHistory, test: Option<&MetricsHistory>) -> Self {
        Self {
            epoch,
            train: train.means(),
            test: test.map(MetricsHistory::means),
        }
    }
}

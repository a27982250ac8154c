//! Combined supervised and consistency loss.

use burn::tensor::{activation, backend::Backend, Tensor};
use oct_core::{Error, Result};

/// `clamp(current / length, 0, 1)`, or `1.0` for a zero-length ramp
pub fn linear_rampup(current: f64, rampup_length: usize) -> f64 {
    if rampup_length == 0 {
        return 1.0;
    }
    (current / rampup_length as f64).clamp(0.0, 1.0)
}

/// Loss terms of one training step
#[derive(Debug, Clone)]
pub struct SemiLossOutput<B: Backend> {
    /// Soft-target cross-entropy on the labeled part
    pub labeled: Tensor<B, 1>,
    /// Mean squared error between predicted and guessed distributions
    pub unlabeled: Tensor<B, 1>,
    /// Ramped weight of the unlabeled term
    pub weight: f64,
}

impl<B: Backend> SemiLossOutput<B> {
    /// `labeled + weight * unlabeled`, the scalar that is minimized
    pub fn total(&self) -> Tensor<B, 1> {
        self.labeled.clone() + self.unlabeled.clone().mul_scalar(self.weight)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SemiLoss {
    lambda_u: f64,
    rampup_length: usize,
}

impl SemiLoss {
    pub fn new(lambda_u: f64, rampup_length: usize) -> Self {
        Self {
            lambda_u,
            rampup_length,
        }
    }

    pub fn lambda_u(&self) -> f64 {
        self.lambda_u
    }

    /// Unlabeled weight at a point in training, measured in epochs
    pub fn weight(&self, current: f64) -> f64 {
        self.lambda_u * linear_rampup(current, self.rampup_length)
    }

    pub fn forward<B: Backend>(
        &self,
        logits_x: Tensor<B, 2>,
        targets_x: Tensor<B, 2>,
        logits_u: Tensor<B, 2>,
        targets_u: Tensor<B, 2>,
        current: f64,
    ) -> Result<SemiLossOutput<B>> {
        check_same_dims("labeled", &logits_x, &targets_x)?;
        check_same_dims("unlabeled", &logits_u, &targets_u)?;

        let labeled = soft_cross_entropy(logits_x, targets_x);

        let probs_u = activation::softmax(logits_u, 1);
        let unlabeled = (probs_u - targets_u).powf_scalar(2.0).mean();

        Ok(SemiLossOutput {
            labeled,
            unlabeled,
            weight: self.weight(current),
        })
    }
}

/// `-mean_i sum_c target_ic * log_softmax(logit_i)_c`
pub fn soft_cross_entropy<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
    let log_probs = activation::log_softmax(logits, 1);
    (log_probs * targets).sum_dim(1).mean().neg()
}

fn check_same_dims<B: Backend>(part: &str, logits: &Tensor<B, 2>, targets: &Tensor<B, 2>) -> Result<()> {
    if logits.dims() != targets.dims() {
        return Err(Error::Shape(format!(
            "{part} logits {:?} and targets {:?} differ",
            logits.dims(),
            targets.dims()
        )));
    }
    Ok(())
}

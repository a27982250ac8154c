//! Label guessing for unlabeled samples.
//!
//! Two augmented views of the same unlabeled image are classified, their
//! class distributions averaged and then sharpened with a temperature so the
//! guess becomes a lower-entropy soft target.

use burn::tensor::{activation, backend::Backend, Int, Tensor};
use oct_core::{Error, Result};

use crate::host::{float_tensor, int_values};

/// Floor applied before taking the logarithm of a probability
const PROB_FLOOR: f64 = 1e-30;

/// Sharpen each row of a probability matrix with temperature `T`.
///
/// Computes `p^(1/T) / sum(p^(1/T))` as `softmax(ln(p) / T)`, which stays
/// finite for small `T`.
pub fn sharpen<B: Backend>(probs: Tensor<B, 2>, temperature: f64) -> Result<Tensor<B, 2>> {
    check_temperature(temperature)?;
    let scaled = probs.clamp_min(PROB_FLOOR).log().div_scalar(temperature);
    Ok(activation::softmax(scaled, 1))
}

/// Guess soft labels from the logits of two views.
///
/// The result carries no gradient.
pub fn guess_labels<B: Backend>(
    logits_u1: Tensor<B, 2>,
    logits_u2: Tensor<B, 2>,
    temperature: f64,
) -> Result<Tensor<B, 2>> {
    check_temperature(temperature)?;
    if logits_u1.dims() != logits_u2.dims() {
        return Err(Error::Shape(format!(
            "views have different logit shapes {:?} and {:?}",
            logits_u1.dims(),
            logits_u2.dims()
        )));
    }

    let p1 = activation::softmax(logits_u1.detach(), 1);
    let p2 = activation::softmax(logits_u2.detach(), 1);
    let avg = (p1 + p2).div_scalar(2.0);

    Ok(sharpen(avg, temperature)?.detach())
}

fn check_temperature(temperature: f64) -> Result<()> {
    if !(temperature > 0.0) || !temperature.is_finite() {
        return Err(Error::InvalidArgument(format!(
            "sharpening temperature must be positive, got {temperature}"
        )));
    }
    Ok(())
}

/// One-hot rows for host-side labels
pub fn one_hot_values(labels: &[i64], num_classes: usize) -> Result<Vec<f32>> {
    let mut values = vec![0.0f32; labels.len() * num_classes];
    for (row, &label) in labels.iter().enumerate() {
        if label < 0 || label as usize >= num_classes {
            return Err(Error::InvalidArgument(format!(
                "label {label} at row {row} is outside 0..{num_classes}"
            )));
        }
        values[row * num_classes + label as usize] = 1.0;
    }
    Ok(values)
}

/// Encode integer labels `[B]` as a `[B, K]` one-hot float matrix
pub fn one_hot<B: Backend>(labels: Tensor<B, 1, Int>, num_classes: usize) -> Result<Tensor<B, 2>> {
    let device = labels.device();
    let labels = int_values(labels)?;
    let rows = labels.len();
    let values = one_hot_values(&labels, num_classes)?;
    float_tensor(values, [rows, num_classes], &device)
}

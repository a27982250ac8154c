//! Mixup over the combined labeled and unlabeled batch.

use burn::tensor::{backend::Backend, Int, Tensor};
use oct_core::{Error, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Beta, Distribution};

use crate::host::index_tensor;

/// Result of mixing a batch with a permuted copy of itself
#[derive(Debug, Clone)]
pub struct MixedBatch<B: Backend, const D: usize> {
    pub inputs: Tensor<B, D>,
    pub targets: Tensor<B, 2>,
    /// Mixing coefficient, always in `[0.5, 1]`
    pub lambda: f64,
    pub permutation: Vec<usize>,
}

/// Draws mixup coefficients and permutations from a seeded generator
pub struct MixupAugmenter {
    alpha: f64,
    beta: Beta<f64>,
    rng: ChaCha8Rng,
}

impl MixupAugmenter {
    pub fn new(alpha: f64, seed: u64) -> Result<Self> {
        if !(alpha > 0.0) || !alpha.is_finite() {
            return Err(Error::InvalidArgument(format!(
                "mixup alpha must be positive, got {alpha}"
            )));
        }
        let beta = Beta::new(alpha, alpha)
            .map_err(|e| Error::InvalidArgument(format!("invalid Beta({alpha}, {alpha}): {e}")))?;

        Ok(Self {
            alpha,
            beta,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// `max(l, 1 - l)` for `l ~ Beta(alpha, alpha)`
    pub fn sample_lambda(&mut self) -> f64 {
        let lambda = self.beta.sample(&mut self.rng);
        lambda.max(1.0 - lambda)
    }

    pub fn sample_permutation(&mut self, n: usize) -> Vec<usize> {
        let mut permutation: Vec<usize> = (0..n).collect();
        permutation.shuffle(&mut self.rng);
        permutation
    }

    /// Mix inputs and targets with a freshly drawn coefficient and permutation
    pub fn mix<B: Backend, const D: usize>(
        &mut self,
        inputs: Tensor<B, D>,
        targets: Tensor<B, 2>,
    ) -> Result<MixedBatch<B, D>> {
        let lambda = self.sample_lambda();
        let permutation = self.sample_permutation(inputs.dims()[0]);
        mix_with(inputs, targets, lambda, permutation)
    }
}

/// Mix with an explicit coefficient and permutation.
///
/// Row `i` of the output is `lambda * x[i] + (1 - lambda) * x[permutation[i]]`
/// for both inputs and targets. `lambda` must lie in `[0.5, 1]` so every row
/// stays closer to its own sample.
pub fn mix_with<B: Backend, const D: usize>(
    inputs: Tensor<B, D>,
    targets: Tensor<B, 2>,
    lambda: f64,
    permutation: Vec<usize>,
) -> Result<MixedBatch<B, D>> {
    let rows = inputs.dims()[0];
    if targets.dims()[0] != rows {
        return Err(Error::Shape(format!(
            "{rows} inputs but {} targets",
            targets.dims()[0]
        )));
    }
    check_permutation(&permutation, rows)?;
    if !(0.5..=1.0).contains(&lambda) {
        return Err(Error::InvalidArgument(format!(
            "mixup coefficient must be in [0.5, 1], got {lambda}"
        )));
    }

    let indices = index_tensor::<B>(&permutation, &inputs.device());
    let inputs = mix_rows(inputs, lambda, indices.clone());
    let targets = mix_rows(targets, lambda, indices);

    Ok(MixedBatch {
        inputs,
        targets,
        lambda,
        permutation,
    })
}

fn mix_rows<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    lambda: f64,
    indices: Tensor<B, 1, Int>,
) -> Tensor<B, D> {
    let shuffled = x.clone().select(0, indices);
    x.mul_scalar(lambda) + shuffled.mul_scalar(1.0 - lambda)
}

fn check_permutation(permutation: &[usize], n: usize) -> Result<()> {
    if permutation.len() != n {
        return Err(Error::Shape(format!(
            "permutation of length {} for {n} rows",
            permutation.len()
        )));
    }
    let mut seen = vec![false; n];
    for &i in permutation {
        if i >= n || seen[i] {
            return Err(Error::InvalidArgument(format!(
                "{permutation:?} is not a permutation of 0..{n}"
            )));
        }
        seen[i] = true;
    }
    Ok(())
}

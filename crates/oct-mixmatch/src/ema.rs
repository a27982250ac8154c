//! Exponential moving average of model weights.
//!
//! [`WeightEma`] owns the shadow copy of the parameters. After every optimizer
//! step it pulls the shadow towards the trained weights and applies a
//! decoupled weight decay to the trained weights. Rank-0 buffers are left
//! alone in both copies.

use burn::tensor::backend::Backend;
use oct_core::{Error, Result};
use tracing::debug;

use crate::params::{ParameterAccess, ParameterState};

/// Multiplier of the learning rate giving the decoupled weight decay
pub const WEIGHT_DECAY_FACTOR: f64 = 0.02;

#[derive(Debug, Clone)]
pub struct WeightEma {
    shadow: ParameterState,
    alpha: f64,
    weight_decay: f64,
    steps: u64,
}

impl WeightEma {
    /// Start the shadow as a copy of the trained state
    pub fn new(trained: &ParameterState, alpha: f64, learning_rate: f64) -> Result<Self> {
        Self::with_weight_decay(trained, alpha, WEIGHT_DECAY_FACTOR * learning_rate)
    }

    pub fn with_weight_decay(trained: &ParameterState, alpha: f64, weight_decay: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(Error::InvalidArgument(format!(
                "EMA decay must be in [0, 1], got {alpha}"
            )));
        }
        if !(0.0..1.0).contains(&weight_decay) {
            return Err(Error::InvalidArgument(format!(
                "weight decay must be in [0, 1), got {weight_decay}"
            )));
        }

        debug!(
            "EMA over {} buffers ({} values), alpha={alpha}, wd={weight_decay}",
            trained.len(),
            trained.num_values()
        );

        Ok(Self {
            shadow: trained.clone(),
            alpha,
            weight_decay,
            steps: 0,
        })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn weight_decay(&self) -> f64 {
        self.weight_decay
    }

    /// Number of completed updates
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn shadow(&self) -> &ParameterState {
        &self.shadow
    }

    /// Update the shadow from the trained state, then decay the trained state
    pub fn step(&mut self, trained: &mut ParameterState) -> Result<()> {
        self.shadow.check_compatible(trained)?;

        let alpha = self.alpha as f32;
        let one_minus_alpha = (1.0 - self.alpha) as f32;
        let decay = (1.0 - self.weight_decay) as f32;

        for (shadow, param) in self
            .shadow
            .buffers_mut()
            .iter_mut()
            .zip(trained.buffers_mut().iter_mut())
        {
            if param.rank() == 0 {
                continue;
            }
            for (s, p) in shadow.values.iter_mut().zip(param.values.iter_mut()) {
                *s = alpha * *s + one_minus_alpha * *p;
                *p *= decay;
            }
        }

        self.steps += 1;
        Ok(())
    }

    /// Apply one update directly to a model and return the decayed model
    pub fn step_model<B, M>(&mut self, model: M, device: &B::Device) -> Result<M>
    where
        B: Backend,
        M: ParameterAccess<B>,
    {
        let mut trained = model.parameter_state()?;
        self.step(&mut trained)?;
        model.load_parameter_state(&trained, device)
    }

    /// Load the shadow weights into a model of the same architecture
    pub fn shadow_model<B, M>(&self, template: M, device: &B::Device) -> Result<M>
    where
        B: Backend,
        M: ParameterAccess<B>,
    {
        template.load_parameter_state(&self.shadow, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParameterBuffer;

    fn state(weight: f32, bias: f32, counter: f32) -> ParameterState {
        let mut state = ParameterState::new();
        state.push(ParameterBuffer::new("fc.weight", vec![2, 2], vec![weight; 4]).unwrap());
        state.push(ParameterBuffer::new("fc.bias", vec![2], vec![bias; 2]).unwrap());
        state.push(ParameterBuffer::scalar("bn.num_batches_tracked", counter));
        state
    }

    #[test]
    fn test_weight_decay_from_learning_rate() {
        let ema = WeightEma::new(&state(1.0, 1.0, 0.0), 0.999, 0.002).unwrap();
        assert!((ema.weight_decay() - 0.00004).abs() < 1e-12);
    }

    #[test]
    fn test_constant_weights() {
        let mut trained = state(1.0, 1.0, 0.0);
        let mut ema = WeightEma::new(&trained, 0.9, 0.002).unwrap();

        ema.step(&mut trained).unwrap();

        for buffer in trained.buffers().iter().take(2) {
            assert!(buffer.values.iter().all(|&v| (v - 0.99996).abs() < 1e-6));
        }
        for buffer in ema.shadow().buffers().iter().take(2) {
            assert!(buffer.values.iter().all(|&v| (v - 1.0).abs() < 1e-6));
        }
        assert_eq!(ema.steps(), 1);
    }

    #[test]
    fn test_shadow_moves_towards_trained() {
        let trained_start = state(0.0, 0.0, 0.0);
        let mut ema = WeightEma::with_weight_decay(&trained_start, 0.9, 0.0).unwrap();

        let mut trained = state(1.0, 2.0, 0.0);
        ema.step(&mut trained).unwrap();

        let shadow = ema.shadow();
        assert!(shadow.buffers()[0].values.iter().all(|&v| (v - 0.1).abs() < 1e-6));
        assert!(shadow.buffers()[1].values.iter().all(|&v| (v - 0.2).abs() < 1e-6));
        // no decay requested
        assert_eq!(trained.buffers()[0].values, vec![1.0; 4]);
    }

    #[test]
    fn test_rank_zero_buffers_untouched() {
        let mut ema = WeightEma::new(&state(1.0, 1.0, 3.0), 0.5, 0.01).unwrap();
        let mut trained = state(1.0, 1.0, 10.0);

        ema.step(&mut trained).unwrap();

        assert_eq!(trained.get("bn.num_batches_tracked").unwrap().values, vec![10.0]);
        assert_eq!(ema.shadow().get("bn.num_batches_tracked").unwrap().values, vec![3.0]);
    }

    #[test]
    fn test_mismatched_state_is_error() {
        let mut ema = WeightEma::new(&state(1.0, 1.0, 0.0), 0.999, 0.002).unwrap();

        let mut other = ParameterState::new();
        other.push(ParameterBuffer::new("fc.weight", vec![4], vec![1.0; 4]).unwrap());
        assert!(matches!(ema.step(&mut other), Err(Error::Shape(_))));
        assert_eq!(ema.steps(), 0);
    }

    #[test]
    fn test_invalid_alpha() {
        let trained = state(1.0, 1.0, 0.0);
        assert!(matches!(
            WeightEma::new(&trained, 1.5, 0.002),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            WeightEma::new(&trained, -0.1, 0.002),
            Err(Error::InvalidArgument(_))
        ));
    }
}

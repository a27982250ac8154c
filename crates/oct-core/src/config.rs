//! Configuration structures for MixMatch training.
//!
//! Everything the training step needs is set once when the trainer is built
//! and read thereafter. Counters that change per step travel separately in
//! [`StepContext`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Main configuration for a MixMatch experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Experiment name, used for the output run directory
    pub name: String,
    /// Random seed for mixup draws and data generation
    pub seed: u64,
    /// Output directory for summaries
    pub output_dir: PathBuf,
    /// Data configuration
    pub data: DataConfig,
    /// Optimizer configuration
    pub optimizer: OptimizerConfig,
    /// Epoch/step budget
    pub train: TrainParams,
    /// MixMatch hyperparameters
    pub mixmatch: MixMatchConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            name: "oct".to_string(),
            seed: 42,
            output_dir: PathBuf::from("output"),
            data: DataConfig::default(),
            optimizer: OptimizerConfig::default(),
            train: TrainParams::default(),
            mixmatch: MixMatchConfig::default(),
        }
    }
}

impl ExperimentConfig {
    /// Validate every section of the configuration
    pub fn validate(&self) -> Result<()> {
        self.data.validate()?;
        self.optimizer.validate()?;
        self.train.validate()?;
        self.mixmatch.validate()?;
        Ok(())
    }

    /// Ramp-up horizon in epochs; falls back to the total epoch count
    pub fn rampup_epochs(&self) -> usize {
        self.mixmatch.rampup_epochs.unwrap_or(self.train.epochs)
    }

    /// Decoupled weight decay applied by the EMA step
    pub fn ema_weight_decay(&self) -> f64 {
        self.mixmatch.weight_decay_factor * self.optimizer.learning_rate
    }
}

/// Batch sizes per mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BatchSizes {
    pub train: usize,
    pub test: usize,
}

impl Default for BatchSizes {
    fn default() -> Self {
        Self { train: 64, test: 64 }
    }
}

/// Data configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Batch sizes; labeled and unlabeled streams share `train`
    pub batch_size: BatchSizes,
    /// Number of target classes (CNV, DME, DRUSEN, NORMAL)
    pub num_classes: usize,
    /// Number of image channels (OCT scans are grayscale)
    pub channels: usize,
    /// Square image side length
    pub image_size: usize,
    /// Labeled samples per class in the training pool
    pub labeled_per_class: usize,
    /// Unlabeled samples in the training pool
    pub unlabeled_samples: usize,
    /// Held-out test samples
    pub test_samples: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            batch_size: BatchSizes::default(),
            num_classes: 4,
            channels: 1,
            image_size: 32,
            labeled_per_class: 25,
            unlabeled_samples: 2000,
            test_samples: 256,
        }
    }
}

impl DataConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size.train == 0 || self.batch_size.test == 0 {
            return Err(Error::Config("batch sizes must be greater than 0".to_string()));
        }
        if self.num_classes < 2 {
            return Err(Error::Config("num_classes must be at least 2".to_string()));
        }
        if self.channels == 0 || self.image_size == 0 {
            return Err(Error::Config(
                "channels and image_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Adam learning rate
    pub learning_rate: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { learning_rate: 0.002 }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0) || !self.learning_rate.is_finite() {
            return Err(Error::Config(format!(
                "learning_rate must be a positive finite number, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

/// Epoch and step budget
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainParams {
    /// Number of training epochs
    pub epochs: usize,
    /// Optimizer steps per epoch
    pub steps_per_epoch: usize,
    /// Evaluate the EMA model every N epochs
    pub eval_every: usize,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            epochs: 1024 * 16,
            steps_per_epoch: 64,
            eval_every: 1,
        }
    }
}

impl TrainParams {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 || self.steps_per_epoch == 0 {
            return Err(Error::Config(
                "epochs and steps_per_epoch must be greater than 0".to_string(),
            ));
        }
        if self.eval_every == 0 {
            return Err(Error::Config("eval_every must be greater than 0".to_string()));
        }
        Ok(())
    }
}

/// MixMatch hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MixMatchConfig {
    /// Sharpening temperature `T`
    pub temperature: f64,
    /// Beta(alpha, alpha) parameter for the mixup coefficient
    pub mixup_alpha: f64,
    /// Unlabeled loss weight
    pub lambda_u: f64,
    /// Ramp-up horizon in epochs (defaults to `train.epochs`)
    pub rampup_epochs: Option<usize>,
    /// EMA decay rate of the shadow model
    pub ema_decay: f64,
    /// Weight decay applied after each EMA step is `factor * learning_rate`
    pub weight_decay_factor: f64,
}

impl Default for MixMatchConfig {
    fn default() -> Self {
        Self {
            temperature: 0.5,
            mixup_alpha: 0.75,
            lambda_u: 75.0,
            rampup_epochs: None,
            ema_decay: 0.999,
            weight_decay_factor: 0.02,
        }
    }
}

impl MixMatchConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.temperature > 0.0) || !self.temperature.is_finite() {
            return Err(Error::Config(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        if !(self.mixup_alpha > 0.0) || !self.mixup_alpha.is_finite() {
            return Err(Error::Config(format!(
                "mixup_alpha must be positive, got {}",
                self.mixup_alpha
            )));
        }
        if self.lambda_u < 0.0 {
            return Err(Error::Config("lambda_u must be non-negative".to_string()));
        }
        if !(0.0..=1.0).contains(&self.ema_decay) {
            return Err(Error::Config(format!(
                "ema_decay must be in [0, 1], got {}",
                self.ema_decay
            )));
        }
        if self.weight_decay_factor < 0.0 {
            return Err(Error::Config(
                "weight_decay_factor must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-step counters handed to the training step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepContext {
    /// Current epoch (0-indexed)
    pub epoch: usize,
    /// Step within the current epoch
    pub step: usize,
    /// Steps per epoch
    pub steps_per_epoch: usize,
    /// Learning rate handed to the optimizer
    pub learning_rate: f64,
}

impl StepContext {
    pub fn new(epoch: usize, step: usize, steps_per_epoch: usize, learning_rate: f64) -> Self {
        Self {
            epoch,
            step,
            steps_per_epoch,
            learning_rate,
        }
    }

    /// Training progress measured in (fractional) epochs
    pub fn progress_epochs(&self) -> f64 {
        let within = if self.steps_per_epoch == 0 {
            0.0
        } else {
            self.step as f64 / self.steps_per_epoch as f64
        };
        self.epoch as f64 + within
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_experiment_config() {
        let config = ExperimentConfig::default();
        assert_eq!(config.seed, 42);
        assert_eq!(config.data.batch_size.train, 64);
        assert_eq!(config.train.epochs, 16384);
        assert_eq!(config.mixmatch.temperature, 0.5);
        assert_eq!(config.mixmatch.lambda_u, 75.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rampup_defaults_to_epochs() {
        let mut config = ExperimentConfig::default();
        assert_eq!(config.rampup_epochs(), 16384);

        config.mixmatch.rampup_epochs = Some(100);
        assert_eq!(config.rampup_epochs(), 100);
    }

    #[test]
    fn test_ema_weight_decay() {
        let config = ExperimentConfig::default();
        assert!((config.ema_weight_decay() - 0.00004).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_mixmatch_config() {
        let mut config = MixMatchConfig::default();
        config.temperature = 0.0;
        assert!(config.validate().is_err());

        config = MixMatchConfig::default();
        config.mixup_alpha = -1.0;
        assert!(config.validate().is_err());

        config = MixMatchConfig::default();
        config.ema_decay = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ExperimentConfig = toml::from_str(
            r#"
            name = "oct_small"

            [mixmatch]
            lambda_u = 100.0

            [train]
            epochs = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "oct_small");
        assert_eq!(config.mixmatch.lambda_u, 100.0);
        assert_eq!(config.mixmatch.temperature, 0.5);
        assert_eq!(config.train.epochs, 10);
        assert_eq!(config.train.steps_per_epoch, 64);
        assert_eq!(config.rampup_epochs(), 10);
    }

    #[test]
    fn test_shipped_config_parses() {
        let config: ExperimentConfig =
            toml::from_str(include_str!("../../../configs/mixmatch.toml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.train.eval_every, 5);
        assert_eq!(config.rampup_epochs(), config.train.epochs);
    }

    #[test]
    fn test_step_context_progress() {
        let ctx = StepContext::new(3, 16, 64, 0.002);
        assert!((ctx.progress_epochs() - 3.25).abs() < 1e-12);
    }
}

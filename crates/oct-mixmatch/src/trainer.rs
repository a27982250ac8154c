//! MixMatch training step.
//!
//! A training step:
//! - encodes the labels of the labeled batch as one-hot rows
//! - guesses sharpened soft labels for both views of the unlabeled batch
//! - mixes all images and targets with a permuted copy of themselves
//! - interleaves the mixed batch so every forward pass sees labeled and
//!   unlabeled samples, then restores the row order of the logits
//! - minimizes the labeled cross-entropy plus the ramped consistency loss
//! - updates the EMA shadow model and decays the trained weights
//!
//! Evaluation runs the shadow model only.

use burn::{
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, backend::Backend, Int, Tensor},
};
use oct_core::{Error, ExperimentConfig, Result, StepContext, StepDiagnostics};
use tracing::{debug, info, warn};

use crate::ema::WeightEma;
use crate::evaluation::labeled_metrics;
use crate::guess::{guess_labels, one_hot};
use crate::host::scalar_value;
use crate::interleave::{interleave, split_rows};
use crate::loss::SemiLoss;
use crate::mixup::MixupAugmenter;
use crate::model::Classifier;
use crate::params::ParameterAccess;

/// Batch of one training step
#[derive(Debug, Clone)]
pub struct MixMatchBatch<B: Backend> {
    /// Labeled images [batch, channels, height, width]
    pub images_x: Tensor<B, 4>,
    /// Labels of `images_x` [batch]
    pub labels_x: Tensor<B, 1, Int>,
    /// First augmented view of the unlabeled images
    pub images_u1: Tensor<B, 4>,
    /// Second augmented view of the same unlabeled images
    pub images_u2: Tensor<B, 4>,
}

impl<B: Backend> MixMatchBatch<B> {
    /// Rows per stream; all streams must agree
    pub fn batch_size(&self) -> Result<usize> {
        let dims_x = self.images_x.dims();
        for (name, dims) in [("u1", self.images_u1.dims()), ("u2", self.images_u2.dims())] {
            if dims != dims_x {
                return Err(Error::Shape(format!(
                    "unlabeled view {name} has shape {dims:?}, labeled images have {dims_x:?}"
                )));
            }
        }
        let labels = self.labels_x.dims()[0];
        if labels != dims_x[0] {
            return Err(Error::Shape(format!(
                "{} labeled images but {labels} labels",
                dims_x[0]
            )));
        }
        Ok(dims_x[0])
    }
}

/// Batch evaluated in test mode; labels of `-1` mark unlabeled rows
#[derive(Debug, Clone)]
pub struct EvalBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub labels: Tensor<B, 1, Int>,
}

/// Hyperparameters fixed when the trainer is built
#[derive(Debug, Clone, Copy)]
pub struct MixMatchSettings {
    pub temperature: f64,
    pub num_classes: usize,
}

pub struct MixMatchTrainer<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Classifier<B> + ParameterAccess<B>,
    M::InnerModule: Classifier<B::InnerBackend> + ParameterAccess<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    model: M,
    optimizer: O,
    loss: SemiLoss,
    mixup: MixupAugmenter,
    ema: WeightEma,
    settings: MixMatchSettings,
    device: B::Device,
}

impl<B, M, O> MixMatchTrainer<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Classifier<B> + ParameterAccess<B>,
    M::InnerModule: Classifier<B::InnerBackend> + ParameterAccess<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    pub fn new(model: M, optimizer: O, config: &ExperimentConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;

        let num_classes = model.num_classes();
        if num_classes != config.data.num_classes {
            return Err(Error::Config(format!(
                "model predicts {num_classes} classes, config expects {}",
                config.data.num_classes
            )));
        }

        let mixmatch = &config.mixmatch;
        let loss = SemiLoss::new(mixmatch.lambda_u, config.rampup_epochs());
        let mixup = MixupAugmenter::new(mixmatch.mixup_alpha, config.seed)?;
        let ema = WeightEma::with_weight_decay(
            &model.parameter_state()?,
            mixmatch.ema_decay,
            config.ema_weight_decay(),
        )?;

        info!("MixMatch hyperparameters:");
        info!("  T: {}", mixmatch.temperature);
        info!("  alpha: {}", mixmatch.mixup_alpha);
        info!("  lambda_u: {}", mixmatch.lambda_u);
        info!("  ema_decay: {}", mixmatch.ema_decay);
        info!("  weight decay: {}", ema.weight_decay());
        info!("  rampup epochs: {}", config.rampup_epochs());
        info!("  batch size: {}", config.data.batch_size.train);

        Ok(Self {
            model,
            optimizer,
            loss,
            mixup,
            ema,
            settings: MixMatchSettings {
                temperature: mixmatch.temperature,
                num_classes,
            },
            device: device.clone(),
        })
    }

    /// One optimizer step on a labeled and an unlabeled batch
    pub fn train_step(&mut self, batch: &MixMatchBatch<B>, ctx: &StepContext) -> Result<StepDiagnostics> {
        let batch_size = batch.batch_size()?;
        let num_classes = self.settings.num_classes;

        let targets_x = one_hot(batch.labels_x.clone(), num_classes)?;

        let logits_u1 = self.model.forward(batch.images_u1.clone());
        let logits_u2 = self.model.forward(batch.images_u2.clone());
        let targets_u = guess_labels(logits_u1, logits_u2, self.settings.temperature)?;

        let all_inputs = Tensor::cat(
            vec![
                batch.images_x.clone(),
                batch.images_u1.clone(),
                batch.images_u2.clone(),
            ],
            0,
        );
        let all_targets = Tensor::cat(vec![targets_x, targets_u.clone(), targets_u], 0);
        let mixed = self.mixup.mix(all_inputs, all_targets)?;

        let chunks = interleave(split_rows(mixed.inputs, batch_size)?, batch_size)?;
        let logits: Vec<Tensor<B, 2>> = chunks
            .into_iter()
            .map(|chunk| self.model.forward(chunk))
            .collect();
        let mut logits = interleave(logits, batch_size)?;
        let logits_u = Tensor::cat(logits.split_off(1), 0);
        let logits_x = logits.remove(0);

        let mixed_targets_x = mixed.targets.clone().narrow(0, 0, batch_size);
        let mixed_targets_u = mixed.targets.narrow(0, batch_size, 2 * batch_size);

        let output = self.loss.forward(
            logits_x,
            mixed_targets_x,
            logits_u,
            mixed_targets_u,
            ctx.progress_epochs(),
        )?;
        let loss = output.total();

        let loss_value = scalar_value(loss.clone())?;
        if !loss_value.is_finite() {
            return Err(Error::Training(format!(
                "non-finite loss at epoch {} step {}",
                ctx.epoch, ctx.step
            )));
        }
        let losses_l = scalar_value(output.labeled.clone())?;
        let losses_u = scalar_value(output.unlabeled.clone())?;

        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &self.model);
        let model = self.optimizer.step(ctx.learning_rate, self.model.clone(), grads);
        self.model = self.ema.step_model(model, &self.device)?;

        // Diagnostics on the labeled batch with the trained model in inference mode
        let inner = self.model.valid();
        let outputs_x = inner.forward(batch.images_x.clone().inner());
        let metrics = labeled_metrics(outputs_x, batch.labels_x.clone().inner())?;

        debug!(
            "epoch {} step {}: loss={loss_value:.4} Lx={losses_l:.4} Lu={losses_u:.4} w={:.3} lambda={:.3}",
            ctx.epoch, ctx.step, output.weight, mixed.lambda
        );

        Ok(StepDiagnostics {
            loss: loss_value,
            losses_l: Some(losses_l),
            losses_u: Some(losses_u),
            w: Some(output.weight),
            cross_entropy: metrics.cross_entropy,
            acc_top1: metrics.acc_top1,
            labeled_count: metrics.labeled_count,
        })
    }

    /// Test-mode step: evaluates the EMA shadow model, the loss is zero
    pub fn eval_step(&self, batch: &EvalBatch<B::InnerBackend>) -> Result<StepDiagnostics> {
        let shadow = self.shadow_model()?;
        evaluate(&shadow, batch)
    }

    /// Test-mode pass over several batches with one shadow model
    pub fn eval_steps(&self, batches: &[EvalBatch<B::InnerBackend>]) -> Result<Vec<StepDiagnostics>> {
        let shadow = self.shadow_model()?;
        batches.iter().map(|batch| evaluate(&shadow, batch)).collect()
    }

    /// Inference copy of the model carrying the shadow weights
    pub fn shadow_model(&self) -> Result<M::InnerModule> {
        self.ema.shadow_model(self.model.valid(), &self.device)
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn ema(&self) -> &WeightEma {
        &self.ema
    }

    pub fn semi_loss(&self) -> &SemiLoss {
        &self.loss
    }

    pub fn settings(&self) -> MixMatchSettings {
        self.settings
    }

    pub fn into_model(self) -> M {
        self.model
    }
}

fn evaluate<B, M>(shadow: &M, batch: &EvalBatch<B>) -> Result<StepDiagnostics>
where
    B: Backend,
    M: Classifier<B>,
{
    let outputs = shadow.forward(batch.images.clone());
    let metrics = labeled_metrics(outputs, batch.labels.clone())?;

    if metrics.acc_top1.is_none() {
        warn!("Test batch has no labeled rows, skipping accuracy and cross-entropy");
    }

    Ok(StepDiagnostics {
        loss: 0.0,
        cross_entropy: metrics.cross_entropy,
        acc_top1: metrics.acc_top1,
        labeled_count: metrics.labeled_count,
        ..Default::default()
    })
}

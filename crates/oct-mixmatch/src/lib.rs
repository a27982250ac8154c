//! MixMatch semi-supervised training for retinal OCT classification.
//!
//! The crate implements one training step of MixMatch on burn tensors:
//! label guessing with sharpening, mixup, interleaved forward passes, the
//! combined semi-supervised loss and an EMA shadow model.

pub mod ema;
pub mod evaluation;
pub mod guess;
pub mod host;
pub mod interleave;
pub mod loss;
pub mod mixup;
pub mod model;
pub mod params;
pub mod trainer;

pub use ema::WeightEma;
pub use evaluation::{
    labeled_metrics, masked_cross_entropy, masked_top_k_accuracy, LabeledMetrics, UNLABELED,
};
pub use guess::{guess_labels, one_hot, sharpen};
pub use interleave::{interleave, interleave_offsets};
pub use loss::{linear_rampup, SemiLoss, SemiLossOutput};
pub use mixup::{mix_with, MixedBatch, MixupAugmenter};
pub use model::{Classifier, OctClassifier, OctClassifierConfig};
pub use params::{ParameterAccess, ParameterBuffer, ParameterState};
pub use trainer::{EvalBatch, MixMatchBatch, MixMatchTrainer};

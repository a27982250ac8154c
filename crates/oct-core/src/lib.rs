//! Core types and utilities for OCT MixMatch training.
//!
//! This crate provides the configuration, error, and metrics types shared by
//! the training step and the command-line tools.

pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;

pub use cli::*;
pub use config::*;
pub use error::{Error, Result};
pub use metrics::*;

pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{Error, Result};
    pub use crate::metrics::{MetricsHistory, MetricsSink, StepDiagnostics};
}

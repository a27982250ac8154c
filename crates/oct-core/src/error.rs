//! Error types for OCT MixMatch training.

use thiserror::Error;

/// Main error type for the training routine.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tensor or parameter shapes do not line up
    #[error("Shape mismatch: {0}")]
    Shape(String),

    /// Argument outside the mathematical domain of an operation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Tensor data could not be read back from the backend
    #[error("Tensor error: {0}")]
    Tensor(String),

    /// Training error
    #[error("Training error: {0}")]
    Training(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Specialized Result type for training operations.
pub type Result<T> = std::result::Result<T, Error>;

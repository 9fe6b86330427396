//! Error types for the llama-chat crate.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure to load a model. Every variant leaves the worker with no handles.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    #[error("model file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("model rejected: {0}")]
    ModelRejected(String),

    #[error("context creation failed: {0}")]
    ContextCreationFailed(String),

    #[error("invalid sampler chain: {0}")]
    InvalidSampler(String),
}

/// Failure of a single generation request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerateError {
    #[error("no model loaded")]
    NotLoaded,

    #[error("a generation is already in progress")]
    Busy,

    #[error("tokenization failed: {0}")]
    Tokenize(String),

    #[error("prompt decode failed: {0}")]
    Decode(String),

    #[error("prompt needs {needed} tokens but the context holds {capacity}")]
    ContextOverflow { needed: usize, capacity: usize },
}

/// Errors surfaced by the session controller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("a generation is already in progress")]
    Busy,

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Generate(#[from] GenerateError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("inference worker is not running")]
    WorkerUnavailable,

    #[error("worker did not answer within {0:?}")]
    Timeout(Duration),
}

/// Invalid or unreadable configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Source(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Source(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

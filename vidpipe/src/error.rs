//! Application-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Fetch error for {source_ref}: {message}")]
    Fetch { source_ref: String, message: String },

    #[error("Probe error for {}: {message}", path.display())]
    Probe { path: PathBuf, message: String },

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Merge error: {0}")]
    Merge(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Pipeline stage '{stage}' failed: {source}")]
    Pipeline {
        stage: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error while {op} '{}': {source}", path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn fetch(source_ref: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fetch {
            source_ref: source_ref.into(),
            message: message.into(),
        }
    }

    pub fn probe(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Probe {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    pub fn merge(msg: impl Into<String>) -> Self {
        Self::Merge(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn pipeline(stage: impl Into<String>, source: Error) -> Self {
        Self::Pipeline {
            stage: stage.into(),
            source: Box::new(source),
        }
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether a local retry may succeed where this attempt failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout(_) | Self::Io(_) | Self::IoPath { .. } => true,
            Self::Fetch { .. } => true,
            Self::Pipeline { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Pipeline { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

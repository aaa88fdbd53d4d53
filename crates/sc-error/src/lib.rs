#![forbid(unsafe_code)]
//! Error types for StripeCache.
//!
//! Defines `ScError` and a `Result<T>` alias used throughout the workspace.

use thiserror::Error;

/// Unified error type for all StripeCache operations.
#[derive(Debug, Error)]
pub enum ScError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("page reserve exhausted: requested {requested} pages, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("transport is shut down")]
    ShutDown,
}

impl From<sc_types::UnitError> for ScError {
    fn from(err: sc_types::UnitError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result alias using `ScError`.
pub type Result<T> = std::result::Result<T, ScError>;

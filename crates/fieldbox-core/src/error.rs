//! Error types for fieldbox-core

use thiserror::Error;

use crate::combine::CombineError;
use crate::config::ConfigError;
use crate::logging::LogError;
use crate::store::{EnqueueError, StoreError};
use crate::transport::TransportError;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for fieldbox-core
#[derive(Error, Debug)]
pub enum Error {
    /// Queue database errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Enqueue validation and admission errors
    #[error("Enqueue rejected: {0}")]
    Enqueue(#[from] EnqueueError),

    /// Upload transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Stream combiner errors
    #[error("Combine error: {0}")]
    Combine(#[from] CombineError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Logging initialization errors
    #[error("Logging error: {0}")]
    Logging(#[from] LogError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task join failures, channel closures)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

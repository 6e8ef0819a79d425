//! Error taxonomy shared by every docvector crate.
//!
//! Validation-class errors are surfaced immediately. Only `Connection` and
//! `Timeout` are transient and eligible for retry at the network layer.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown embedding model: {0}")]
    UnknownModel(String),

    #[error("Model '{model}' belongs to provider '{expected}', not '{actual}'")]
    WrongProvider {
        model: String,
        expected: String,
        actual: String,
    },

    #[error("{0} used before initialize()")]
    NotInitialized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Corrupt cache entry: {0}")]
    CacheCorruption(String),

    #[error("Operation failed: {0}")]
    Operation(String),
}

impl Error {
    /// Whether the failure may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Timeout(_))
    }

    pub fn operation(e: impl std::fmt::Display) -> Self {
        Error::Operation(e.to_string())
    }
}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Operation(format!("json: {e}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Operation(format!("io: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

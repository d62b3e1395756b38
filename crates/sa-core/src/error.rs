//! # AppError
//!
//! Centralized error handling for the skyarchive crates.
//! Adapters map their library errors into these variants at the port boundary.

use thiserror::Error;

/// The primary error type for all archive and export operations.
#[derive(Error, Debug)]
pub enum AppError {
    /// Resource not found (e.g., Operation, ExportJob)
    #[error("{0} not found with ID {1}")]
    NotFound(String, String),

    /// Input rejected before any work started (e.g., malformed URI, zero quota)
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Business rule violation (e.g., second active archive for a subject)
    #[error("conflict: {0}")]
    Conflict(String),

    /// The remote API answered with an error or could not be reached
    #[error("remote API error: {0}")]
    Remote(String),

    /// A media download failed (transport error or non-2xx status)
    #[error("download failed: {0}")]
    Download(String),

    /// Durable store failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Local filesystem failure (disk full, permission denied)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The caller's cancellation signal fired
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Anything else
    #[error("internal service error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::Conflict(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled(_))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("json: {err}"))
    }
}

/// A specialized Result type for skyarchive logic.
pub type Result<T> = std::result::Result<T, AppError>;

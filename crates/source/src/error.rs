//! Error types for the domain source.

use thiserror::Error;

/// Domain-source errors.
#[derive(Clone, Debug, Error)]
pub enum SourceError {
    #[error("domain not found")]
    NotFound,

    #[error("domain source unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected domain source response: {0}")]
    InvalidResponse(String),

    #[error("polling failed after {attempts} attempts: {last_error}")]
    PollingFailed { attempts: u32, last_error: String },
}

impl SourceError {
    /// Whether retrying later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Result type for domain-source operations.
pub type SourceResult<T> = std::result::Result<T, SourceError>;

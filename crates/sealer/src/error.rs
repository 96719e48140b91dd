//! Error types for sealing operations.

use thiserror::Error;

/// Sealing and unsealing errors.
///
/// Unsealing failures are deliberately uninformative: a tampered cookie and
/// a stale cookie look the same to the caller, which issues a fresh session
/// either way.
#[derive(Clone, Debug, Error)]
pub enum SealError {
    #[error("sealed value rejected")]
    Rejected,

    #[error("sealed value expired")]
    Expired,

    #[error("audience mismatch")]
    AudienceMismatch,

    #[error("sealing failed: {0}")]
    Seal(String),
}

/// Result type for sealing operations.
pub type SealResult<T> = std::result::Result<T, SealError>;

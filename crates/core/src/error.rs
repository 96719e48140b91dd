//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no lookup path matched the request path")]
    NoLookupMatch,

    #[error("invalid lookup path prefix: {0}")]
    InvalidPrefix(String),

    #[error("invalid host: {0}")]
    InvalidHost(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

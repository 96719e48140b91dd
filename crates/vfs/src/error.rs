//! Error types for the ZIP VFS.

use thiserror::Error;

/// VFS operation errors.
///
/// Errors are `Clone` because an archive's open outcome is computed once
/// and handed to every concurrent caller of the open gate.
#[derive(Clone, Debug, Error)]
pub enum VfsError {
    #[error("entry not found")]
    NotFound,

    #[error("remote artifact requires authorization")]
    Unauthorized,

    #[error("temporary backend failure: {0}")]
    TemporaryBackend(String),

    #[error("invalid archive URL: {0}")]
    InvalidUrl(String),

    #[error("unexpected backend response: {0}")]
    InvalidResponse(String),

    #[error("archive corrupted: {0}")]
    Corrupted(String),

    #[error("opening archive timed out")]
    OpenTimeout,

    #[error("invalid zip archive: {0}")]
    BadArchive(String),

    #[error("not a file")]
    NotFile,

    #[error("not a symlink")]
    NotSymlink,

    #[error("symlink too long")]
    SymlinkTooLong,

    #[error("unsupported compression method: {0:#06x}")]
    UnsupportedCompression(u16),
}

impl VfsError {
    /// Whether retrying the operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TemporaryBackend(_) | Self::OpenTimeout)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

impl From<VfsError> for std::io::Error {
    fn from(err: VfsError) -> Self {
        let kind = match &err {
            VfsError::NotFound => std::io::ErrorKind::NotFound,
            VfsError::Unauthorized => std::io::ErrorKind::PermissionDenied,
            VfsError::TemporaryBackend(_) | VfsError::OpenTimeout => {
                std::io::ErrorKind::TimedOut
            }
            _ => std::io::ErrorKind::InvalidData,
        };
        std::io::Error::new(kind, err)
    }
}

/// Result type for VFS operations.
pub type VfsResult<T> = std::result::Result<T, VfsError>;

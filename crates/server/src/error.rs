//! Request-plane error type and the built-in error pages.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use pagoda_source::SourceError;
use pagoda_vfs::VfsError;

/// Errors surfaced to clients by the request pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PagesError {
    #[error("not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("too many requests")]
    TooManyRequests { retry_after_secs: u64 },

    #[error("bad gateway: {0}")]
    BadGateway(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl PagesError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<VfsError> for PagesError {
    fn from(err: VfsError) -> Self {
        match err {
            VfsError::NotFound | VfsError::NotFile => Self::NotFound,
            // A 500, not a 502: the archive itself asked for something we
            // do not speak.
            VfsError::UnsupportedCompression(_) => Self::Internal(err.to_string()),
            VfsError::SymlinkTooLong | VfsError::NotSymlink => Self::Internal(err.to_string()),
            other => Self::BadGateway(other.to_string()),
        }
    }
}

impl From<SourceError> for PagesError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::NotFound => Self::NotFound,
            other => Self::BadGateway(other.to_string()),
        }
    }
}

impl IntoResponse for PagesError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut response = match &self {
            Self::NotFound => error_page(status, "The page you're looking for could not be found."),
            Self::TooManyRequests { .. } => {
                error_page(status, "Too many requests. Try again later.")
            }
            Self::Unauthorized | Self::Forbidden => {
                error_page(status, "You don't have permission to access this page.")
            }
            other => {
                tracing::debug!(error = %other, "request failed");
                error_page(status, "Something went wrong serving this page.")
            }
        };

        if let Self::TooManyRequests { retry_after_secs } = &self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Render the built-in error page.
pub fn error_page(status: StatusCode, message: &str) -> Response {
    let code = status.as_u16();
    let reason = status.canonical_reason().unwrap_or("Error");
    let body = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{code} {reason}</title></head>\n\
         <body>\n<h1>{code}</h1>\n<p>{message}</p>\n</body>\n</html>\n"
    );
    (
        status,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        body,
    )
        .into_response()
}

/// Result type for pipeline handlers.
pub type PagesResult<T> = std::result::Result<T, PagesError>;

//! Error types for reverseqr-relay.

use crate::limits::RateLimitError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rqr_types::{ErrorBody, SessionCode, TypesError};

/// Main error type for relay startup and background work.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Code unknown or expired.
    #[error("session not found: {code}")]
    NotFound {
        /// The code that was looked up.
        code: SessionCode,
    },

    /// A sender already holds the session.
    #[error("session already has a connected sender: {code}")]
    Conflict {
        /// The contested code.
        code: SessionCode,
    },

    /// Token does not match the role's token.
    #[error("invalid token for {code}")]
    Unauthorized {
        /// The code the token was presented for.
        code: SessionCode,
    },

    /// No unused code could be allocated.
    #[error("no free session code available")]
    CodeSpaceExhausted,
}

/// Blob storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Blob does not exist.
    #[error("file not found: {name}")]
    NotFound {
        /// Requested blob name.
        name: String,
    },

    /// Name would resolve outside the storage root.
    #[error("access denied: {name}")]
    Forbidden {
        /// Requested blob name.
        name: String,
    },

    /// Upload exceeded the configured file size.
    #[error("file too large (limit: {limit} bytes)")]
    TooLarge {
        /// Maximum allowed size.
        limit: u64,
    },

    /// Underlying filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned at the HTTP request boundary.
///
/// Each variant maps to one status code and a `{"error": "..."}` body.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed request (400).
    #[error("{0}")]
    BadRequest(String),

    /// Unknown or expired code or file (404).
    #[error("{0}")]
    NotFound(String),

    /// Path escapes the blob root (403).
    #[error("access denied")]
    Forbidden,

    /// Sender slot occupied (409).
    #[error("{0}")]
    Conflict(String),

    /// Bad or missing token (401).
    #[error("unauthorized")]
    Unauthorized,

    /// Upload or body over the configured limit (413).
    #[error("{0}")]
    PayloadTooLarge(String),

    /// Tier budget exceeded (429).
    #[error("too many requests: {0}")]
    RateLimited(#[from] RateLimitError),

    /// Unexpected failure (500).
    #[error("internal server error")]
    Internal(String),
}

impl ApiError {
    /// Status code for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let Self::Internal(detail) = &self {
            tracing::error!("Internal error: {}", detail);
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound { .. } => Self::NotFound("Connection not found".to_string()),
            SessionError::Conflict { .. } => {
                Self::Conflict("Another sender is already connected".to_string())
            }
            SessionError::Unauthorized { .. } => Self::Unauthorized,
            SessionError::CodeSpaceExhausted => {
                Self::Internal("no free session code available".to_string())
            }
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { .. } => Self::NotFound("File not found".to_string()),
            StorageError::Forbidden { .. } => Self::Forbidden,
            StorageError::TooLarge { limit } => Self::PayloadTooLarge(format!(
                "File too large. Maximum size is {}",
                crate::http::format_bytes(limit)
            )),
            StorageError::Io(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<TypesError> for ApiError {
    fn from(err: TypesError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for session registry operations.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type alias for HTTP handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

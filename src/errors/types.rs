//! Error type definitions for m3u-hub
//!
//! Component-local failures (network, parse, bad regex) are converted to
//! status strings or sentinels at the component boundary; only not-found and
//! invariant violations reach the web layer as typed errors.

use thiserror::Error;

/// Top-level application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Source handling errors
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Resource not found errors
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// Invariant violations rejected before mutation (e.g. duplicate slug)
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Anything else bubbling up from storage or services
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Errors talking to or interpreting a remote playlist source
#[derive(Error, Debug)]
pub enum SourceError {
    /// The server answered, but with something that is not a playlist
    #[error("Server returned non-playlist content from {url}")]
    NotAPlaylist { url: String },

    /// Network-level failure or timeout
    #[error("Fetch failed for {url}: {message}")]
    FetchFailed { url: String, message: String },

    /// Upstream answered with a non-success status
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self {
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::Conflict { .. } => StatusCode::CONFLICT,
            AppError::Configuration { .. } => StatusCode::BAD_REQUEST,
            AppError::Source(_) => StatusCode::BAD_GATEWAY,
            AppError::Database(_) | AppError::Http(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = axum::Json(serde_json::json!({ "detail": self.to_string() }));
        (status, body).into_response()
    }
}

impl AppError {
    pub fn not_found<R: Into<String>, I: Into<String>>(resource: R, id: I) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

//! Closed error-kind model (base spec §7).

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use displaydoc::Display;

pub type Result<T> = std::result::Result<T, Error>;

/// A stable error kind with a cause chain. Maps 1:1 onto the HTTP status
/// table in base spec §7.
#[derive(Debug, Display)]
pub enum Error {
    /// invalid input: {0}
    InvalidInput(String),
    /// not found
    NotFound,
    /// already exists
    AlreadyExists,
    /// unauthorized
    Unauthorized,
    /// upstream reported not found
    UpstreamNotFound,
    /// all upstreams are unavailable: {0}
    UpstreamUnavailable(String),
    /// lock unavailable: {0}
    LockUnavailable(String),
    /// storage error: {0}
    Storage(anyhow::Error),
    /// index error: {0}
    Index(anyhow::Error),
    /// signing error: {0}
    Signing(anyhow::Error),
    /// internal error: {0}
    Internal(anyhow::Error),
}

impl Error {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "InvalidInput",
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::Unauthorized => "Unauthorized",
            Self::UpstreamNotFound => "UpstreamNotFound",
            Self::UpstreamUnavailable(_) => "UpstreamUnavailable",
            Self::LockUnavailable(_) => "LockUnavailable",
            Self::Storage(_) => "Storage",
            Self::Index(_) => "Index",
            Self::Signing(_) => "Signing",
            Self::Internal(_) => "Internal",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::NotFound | Self::UpstreamNotFound => StatusCode::NOT_FOUND,
            Self::AlreadyExists => StatusCode::CONFLICT,
            Self::Unauthorized => StatusCode::FORBIDDEN,
            Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::LockUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage(_) | Self::Index(_) | Self::Signing(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether this error's cause chain is safe to log at error level (as
    /// opposed to a routine client mistake).
    fn is_server_fault(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Index(_) | Self::Signing(_) | Self::Internal(_)
        )
    }
}

impl std::error::Error for Error {}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if self.is_server_fault() {
            tracing::error!(kind = self.name(), "{self}");
        } else {
            tracing::warn!(kind = self.name(), "{self}");
        }

        let status = self.status_code();

        // Never leak the cause chain (stack traces, internal paths) to clients.
        let body = match &self {
            Self::InvalidInput(msg) => msg.clone(),
            _ => self.to_string(),
        };

        let mut response = (status, body).into_response();

        if let Self::LockUnavailable(_) = self {
            response
                .headers_mut()
                .insert("Retry-After", HeaderValue::from_static("1"));
        }

        response
    }
}

impl From<crate::hash::HashParseError> for Error {
    fn from(e: crate::hash::HashParseError) -> Self {
        Self::InvalidInput(e.to_string())
    }
}

impl From<crate::nar_url::NarUrlParseError> for Error {
    fn from(e: crate::nar_url::NarUrlParseError) -> Self {
        Self::InvalidInput(e.to_string())
    }
}

impl From<crate::narinfo::NarInfoParseError> for Error {
    fn from(e: crate::narinfo::NarInfoParseError) -> Self {
        Self::InvalidInput(e.to_string())
    }
}

impl From<crate::storage::StorageError> for Error {
    fn from(e: crate::storage::StorageError) -> Self {
        match e {
            crate::storage::StorageError::NotFound => Self::NotFound,
            crate::storage::StorageError::AlreadyExists => Self::AlreadyExists,
            crate::storage::StorageError::Io(e) => Self::Storage(e),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Self::Index(e.into())
    }
}

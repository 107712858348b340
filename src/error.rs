//! Error types for the sync engine
//!
//! Remote-layer failures arrive as [`RemoteError`] and are translated into the
//! [`SyncError`] taxonomy before they reach a collection service caller.

use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;

// == Remote Error ==
/// Status codes reported by the remote document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorCode {
    Unavailable,
    DeadlineExceeded,
    ResourceExhausted,
    Aborted,
    /// Query plan or composite index is still being built
    FailedPrecondition,
    PermissionDenied,
    Unauthenticated,
    NotFound,
    Internal,
}

impl fmt::Display for RemoteErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unavailable => "unavailable",
            Self::DeadlineExceeded => "deadline-exceeded",
            Self::ResourceExhausted => "resource-exhausted",
            Self::Aborted => "aborted",
            Self::FailedPrecondition => "failed-precondition",
            Self::PermissionDenied => "permission-denied",
            Self::Unauthenticated => "unauthenticated",
            Self::NotFound => "not-found",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Raw error reported by a [`crate::remote::RemoteStore`] implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("remote {code}: {message}")]
pub struct RemoteError {
    pub code: RemoteErrorCode,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: RemoteErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorCode::Unavailable, message)
    }

    /// The fault the remote SDK raises when its in-memory state breaks.
    pub fn internal_assertion(message: impl Into<String>) -> Self {
        Self::new(
            RemoteErrorCode::Internal,
            format!("INTERNAL ASSERTION FAILED: {}", message.into()),
        )
    }

    // == Fault Detection ==
    /// Returns true when the error reports a broken internal invariant rather
    /// than an ordinary failed call.
    pub fn is_internal_fault(&self) -> bool {
        if self.code != RemoteErrorCode::Internal {
            return false;
        }
        let message = self.message.to_ascii_lowercase();
        message.contains("internal assertion failed") || message.contains("unexpected state")
    }
}

// == Sync Error Enum ==
/// Unified error type surfaced by the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Network timeout or temporary unavailability
    #[error("Remote temporarily unavailable: {0}")]
    Transient(String),

    /// Remote query plan or index still building
    #[error("Remote query not ready: {0}")]
    NotReady(String),

    /// Caller may not read or write this collection
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Collection or document does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Remote SDK state is untrustworthy; a full client reset is required
    #[error("Remote connection corrupted, reset required: {0}")]
    Corrupted(String),

    /// A remote document could not be decoded into the entity type
    #[error("Malformed document: {0}")]
    Decode(String),
}

impl SyncError {
    /// Errors absorbed by retrying and serving from cache.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_) | SyncError::NotReady(_))
    }

    /// Errors that terminate a subscription instead of retrying it.
    pub fn is_fatal(&self) -> bool {
        !self.is_transient()
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        use RemoteErrorCode::*;

        if err.is_internal_fault() {
            return SyncError::Corrupted(err.message);
        }
        match err.code {
            Unavailable | DeadlineExceeded | ResourceExhausted | Aborted | Internal => {
                SyncError::Transient(err.message)
            }
            FailedPrecondition => SyncError::NotReady(err.message),
            PermissionDenied | Unauthenticated => SyncError::PermissionDenied(err.message),
            NotFound => SyncError::NotFound(err.message),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}

// == IntoResponse Implementation ==
impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = match &self {
            SyncError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            SyncError::NotFound(_) => StatusCode::NOT_FOUND,
            SyncError::Decode(_) => StatusCode::BAD_GATEWAY,
            SyncError::Transient(_) | SyncError::NotReady(_) | SyncError::Corrupted(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };

        let reset_required = matches!(self, SyncError::Corrupted(_));
        let body = Json(ErrorResponse::new(self.to_string(), reset_required));

        (status, body).into_response()
    }
}

// == API Error ==
/// Errors raised by the HTTP surface before a request reaches the engine.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::UnknownCollection(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Sync(err) => return err.clone().into_response(),
        };

        let body = Json(ErrorResponse::new(self.to_string(), false));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the engine.
pub type Result<T> = std::result::Result<T, SyncError>;

use http::StatusCode;
use thiserror::Error;

use crate::reactive::FlowError;

/// Protocol-level failure carrying the status it should be answered with.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HttpError {
    pub status: StatusCode,
    pub message: String,
}

impl HttpError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn payload_too_large(limit: u64) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("Request body exceeds maximum content length of {limit} bytes"),
        )
    }

    pub fn unsupported_media_type(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNSUPPORTED_MEDIA_TYPE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<HttpError> for FlowError {
    fn from(error: HttpError) -> Self {
        FlowError::new(error)
    }
}

/// Route registration problems detected while building a router
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RouterError {
    /// Template could not be compiled
    #[error("Invalid path template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },

    /// Same template registered twice for one method
    #[error("Duplicate route: {method} {template}")]
    DuplicateRoute { method: String, template: String },

    /// Several registration problems at once
    #[error("Router configuration invalid:\n{}", .0.iter().map(|e| format!("  - {e}")).collect::<Vec<_>>().join("\n"))]
    Invalid(Vec<RouterError>),
}

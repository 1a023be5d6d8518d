//! Error types for the data-access core.
//!
//! Every failure leaving the request pipeline is one of these variants.
//! Downstream code matches exhaustively instead of probing response bodies.

use std::collections::BTreeMap;
use std::time::Duration;

/// Per-field validation messages from a 422 response.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// Data-access errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    /// Request rejected as malformed (400, or a 2xx envelope with `success=false`).
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// No usable credentials: 401 without a renewal path, or renewal failed.
    #[error("unauthenticated: {message}")]
    Unauthenticated { message: String },

    /// Authenticated but not permitted (403).
    #[error("forbidden: {message}")]
    Forbidden { message: String },

    /// Resource does not exist (404).
    #[error("not found: {message}")]
    NotFound { message: String },

    /// Write collides with the current server state (409).
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// Field-level validation failure (422).
    #[error("validation failed: {message}")]
    Validation { message: String, fields: FieldErrors },

    /// Rate limit exceeded (429).
    #[error("rate limited: retry after {retry_after:?}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    /// Server-side failure (5xx).
    #[error("server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    /// No response received (connect failure, timeout, reset).
    #[error("network error: {message}")]
    Network { message: String },

    /// Any other non-2xx status.
    #[error("unexpected HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Response body could not be decoded.
    #[error("invalid response: {message}")]
    InvalidResponse { message: String },

    /// Caller aborted the request through its cancellation handle.
    #[error("request cancelled")]
    Cancelled,

    /// Credential persistence failed.
    #[error("credential storage error: {message}")]
    Storage { message: String },

    /// Client could not be constructed from its configuration.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl ApiError {
    /// HTTP status this error was classified from, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::InvalidRequest { .. } => Some(400),
            Self::Unauthenticated { .. } => Some(401),
            Self::Forbidden { .. } => Some(403),
            Self::NotFound { .. } => Some(404),
            Self::Conflict { .. } => Some(409),
            Self::Validation { .. } => Some(422),
            Self::RateLimited { .. } => Some(429),
            Self::Server { status, .. } | Self::Http { status, .. } => Some(*status),
            Self::Network { .. }
            | Self::InvalidResponse { .. }
            | Self::Cancelled
            | Self::Storage { .. }
            | Self::Config { .. } => None,
        }
    }

    /// Whether the pipeline may retry automatically (retry-safe calls only).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Server { .. } | Self::Network { .. })
    }

    /// Whether a caller-initiated retry after a pause is reasonable.
    pub fn is_transient(&self) -> bool {
        self.is_retryable() || matches!(self, Self::RateLimited { .. })
    }

    /// Whether the user has to sign in again.
    pub fn requires_reauth(&self) -> bool {
        matches!(self, Self::Unauthenticated { .. })
    }

    /// Whether the UI should show this error as a notification.
    ///
    /// Unauthenticated errors redirect to sign-in instead, and cancellations
    /// were requested by the caller.
    pub fn should_notify(&self) -> bool {
        !matches!(self, Self::Unauthenticated { .. } | Self::Cancelled)
    }

    /// Fixed user-facing message for this error kind.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidRequest { message } => {
                if message.is_empty() {
                    "The request was invalid. Please check your input.".to_string()
                } else {
                    message.clone()
                }
            }
            Self::Unauthenticated { .. } => {
                "Your session has expired. Please sign in again.".to_string()
            }
            Self::Forbidden { .. } => {
                "You do not have permission to perform this action.".to_string()
            }
            Self::NotFound { .. } => "The requested resource was not found.".to_string(),
            Self::Conflict { message } => {
                if message.is_empty() {
                    "This record was changed elsewhere. Refresh and try again.".to_string()
                } else {
                    message.clone()
                }
            }
            Self::Validation { message, .. } => message.clone(),
            Self::RateLimited { .. } => {
                "Too many requests. Please wait a moment and try again.".to_string()
            }
            Self::Server { status: 503, .. } => {
                "The service is temporarily unavailable. Please try again later.".to_string()
            }
            Self::Server { .. } => "A server error occurred. Please try again later.".to_string(),
            Self::Network { .. } => {
                "Unable to reach the server. Check your connection.".to_string()
            }
            Self::Http { .. } | Self::InvalidResponse { .. } => {
                "An unexpected error occurred.".to_string()
            }
            Self::Cancelled => "The request was cancelled.".to_string(),
            Self::Storage { .. } => "Unable to save your session on this device.".to_string(),
            Self::Config { .. } => "The client is misconfigured.".to_string(),
        }
    }

    pub(crate) fn unauthenticated(message: impl Into<String>) -> Self {
        Self::Unauthenticated {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidResponse {
            message: err.to_string(),
        }
    }
}

/// Result type for data-access operations.
pub type ApiResult<T> = Result<T, ApiError>;

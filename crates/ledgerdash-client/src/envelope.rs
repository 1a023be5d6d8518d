//! Wire types shared with the dashboard API.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Transport envelope wrapping every API response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T = Value> {
    /// Whether the server handled the request successfully.
    #[serde(default)]
    pub success: bool,

    /// Payload returned to the caller on success.
    #[serde(default = "Option::default")]
    pub data: Option<T>,

    /// Human-readable message (usually set on failure).
    #[serde(default)]
    pub message: Option<String>,

    /// Structured error details (per-field on 422).
    #[serde(default)]
    pub errors: Option<Value>,
}

impl Envelope<Value> {
    /// Decode a response body. Bodies that are not enveloped are treated as
    /// bare payloads so plain JSON endpoints pass through the same pipeline.
    pub fn from_body(body: &str) -> Option<Self> {
        if body.trim().is_empty() {
            return Some(Self {
                success: true,
                data: None,
                message: None,
                errors: None,
            });
        }

        let value: Value = serde_json::from_str(body).ok()?;
        match value {
            Value::Object(ref map) if map.contains_key("success") => {
                serde_json::from_value(value).ok()
            }
            other => Some(Self {
                success: true,
                data: Some(other),
                message: None,
                errors: None,
            }),
        }
    }
}

/// Access/refresh token pair issued by login and renewal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,

    /// Servers may keep the current refresh token by omitting it.
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Body of the renewal call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RenewalRequest<'a> {
    pub refresh_token: &'a str,
}

/// Login credentials.
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

impl LoginRequest {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

/// Login response payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    #[serde(flatten)]
    pub tokens: TokenPair,

    /// Signed-in user profile, passed through untouched.
    #[serde(default)]
    pub user: Option<Value>,
}

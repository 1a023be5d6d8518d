//! Pure helpers: status classification, envelope decoding, backoff, URLs.

use std::time::Duration;

use rand::Rng;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::envelope::Envelope;
use crate::error::{ApiError, ApiResult, FieldErrors};

const MAX_BACKOFF: Duration = Duration::from_secs(30);
const BASE_BACKOFF_MS: u64 = 250;

/// Unwrap a successful response body into the caller's payload type.
///
/// A missing `data` decodes as JSON `null`, so `()` and `Option<T>` payloads work.
pub(crate) fn decode_payload<T: DeserializeOwned>(body: &str) -> ApiResult<T> {
    let envelope = Envelope::from_body(body).ok_or_else(|| ApiError::InvalidResponse {
        message: format!("response is not JSON: {}", truncate(body)),
    })?;

    if !envelope.success {
        return Err(ApiError::InvalidRequest {
            message: envelope
                .message
                .unwrap_or_else(|| "request was not successful".to_string()),
        });
    }

    serde_json::from_value(envelope.data.unwrap_or(Value::Null)).map_err(|e| {
        ApiError::InvalidResponse {
            message: format!("unexpected payload shape: {}", e),
        }
    })
}

/// Map a non-2xx response onto the error taxonomy.
pub(crate) fn classify_failure(status: StatusCode, headers: &HeaderMap, body: &str) -> ApiError {
    let envelope = Envelope::from_body(body);
    let message = envelope
        .as_ref()
        .and_then(|e| e.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| fallback_message(status, body));

    match status.as_u16() {
        400 => ApiError::InvalidRequest { message },
        401 => ApiError::Unauthenticated { message },
        403 => ApiError::Forbidden { message },
        404 => ApiError::NotFound { message },
        409 => ApiError::Conflict { message },
        422 => {
            let fields = envelope
                .as_ref()
                .and_then(|e| e.errors.as_ref())
                .map(parse_field_errors)
                .unwrap_or_default();
            ApiError::Validation {
                message: validation_message(&message, &fields),
                fields,
            }
        }
        429 => ApiError::RateLimited {
            retry_after: parse_retry_after(headers),
            message,
        },
        500..=599 => ApiError::Server {
            status: status.as_u16(),
            message,
        },
        other => ApiError::Http {
            status: other,
            message,
        },
    }
}

fn fallback_message(status: StatusCode, body: &str) -> String {
    if body.trim().is_empty() || body.trim_start().starts_with('{') {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        truncate(body)
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(200).collect()
}

/// Accepts `{"field": "msg"}`, `{"field": ["msg", ...]}` and
/// `[{"field": "...", "message": "..."}]`.
pub(crate) fn parse_field_errors(errors: &Value) -> FieldErrors {
    let mut fields = FieldErrors::new();

    match errors {
        Value::Object(map) => {
            for (field, value) in map {
                let messages: Vec<String> = match value {
                    Value::String(s) => vec![s.clone()],
                    Value::Array(items) => items
                        .iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect(),
                    other => vec![other.to_string()],
                };
                if !messages.is_empty() {
                    fields.entry(field.clone()).or_default().extend(messages);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                let field = item
                    .get("field")
                    .or_else(|| item.get("path"))
                    .and_then(|v| v.as_str());
                let message = item.get("message").and_then(|v| v.as_str());
                if let (Some(field), Some(message)) = (field, message) {
                    fields
                        .entry(field.to_string())
                        .or_default()
                        .push(message.to_string());
                }
            }
        }
        _ => {}
    }

    fields
}

/// `"<message>: field: msg; other: msg"`.
pub(crate) fn validation_message(message: &str, fields: &FieldErrors) -> String {
    if fields.is_empty() {
        return message.to_string();
    }

    let details = fields
        .iter()
        .map(|(field, messages)| format!("{}: {}", field, messages.join(", ")))
        .collect::<Vec<_>>()
        .join("; ");

    format!("{}: {}", message, details)
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Exponential backoff with full jitter for the given 1-based retry.
pub(crate) fn retry_backoff(retry: u32) -> Duration {
    let exp = BASE_BACKOFF_MS.saturating_mul(1u64 << retry.saturating_sub(1).min(16));
    let capped = exp.min(MAX_BACKOFF.as_millis() as u64);
    let jittered = rand::thread_rng().gen_range(capped / 2..=capped);
    Duration::from_millis(jittered.max(10))
}

/// Join a base URL and a request path with exactly one slash between them.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

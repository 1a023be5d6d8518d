//! HTTP layer: auth augmentation, status mapping, renewal replay, retry.
//!
//! Status codes are interpreted here and nowhere else; the public API in
//! client/mod.rs only sees `ApiError`.

use std::time::Instant;

use reqwest::header::AUTHORIZATION;
use reqwest::Method;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::credentials::CredentialStore;
use crate::error::{ApiError, ApiResult};
use crate::renewal::RenewalCoordinator;

use super::helpers::{classify_failure, join_url, retry_backoff};
use super::transfer::UploadBody;

/// Request body variants the pipeline can replay.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Upload(UploadBody),
}

/// Replayable description of one API call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    /// Sent without credentials and never renewed (login).
    pub(crate) anonymous: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
            anonymous: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn with_upload(mut self, upload: UploadBody) -> Self {
        self.body = RequestBody::Upload(upload);
        self
    }

    pub(crate) fn anonymous(mut self) -> Self {
        self.anonymous = true;
        self
    }
}

/// Per-call pipeline options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Allow automatic retry with backoff on server/network failures.
    /// Only set this for idempotent calls.
    pub retry_safe: bool,

    /// Aborts the call with [`ApiError::Cancelled`] when triggered.
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    /// Options for an idempotent read.
    pub fn retry_safe() -> Self {
        Self {
            retry_safe: true,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// HTTP backend for making requests (holds reqwest client, credentials, renewal).
#[derive(Debug, Clone)]
pub(crate) struct HttpBackend {
    pub(crate) client: reqwest::Client,
    pub(crate) base_url: String,
    pub(crate) credentials: CredentialStore,
    pub(crate) renewal: RenewalCoordinator,
    pub(crate) config: ClientConfig,
}

impl HttpBackend {
    /// Run a request through the full pipeline and return the 2xx response.
    pub(crate) async fn execute(
        &self,
        request: &ApiRequest,
        options: &RequestOptions,
    ) -> ApiResult<reqwest::Response> {
        match &options.cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!(path = %request.path, "request cancelled");
                        Err(ApiError::Cancelled)
                    }
                    result = self.execute_with_retry(request, options.retry_safe) => result,
                }
            }
            None => self.execute_with_retry(request, options.retry_safe).await,
        }
    }

    async fn execute_with_retry(
        &self,
        request: &ApiRequest,
        retry_safe: bool,
    ) -> ApiResult<reqwest::Response> {
        let mut retries = 0;
        let max_retries = self.config.max_retries;

        loop {
            match self.send_authenticated(request).await {
                Ok(response) => return Ok(response),
                Err(e) if retry_safe && e.is_retryable() && retries < max_retries => {
                    retries += 1;
                    let backoff = retry_backoff(retries);

                    warn!(
                        error = %e,
                        path = %request.path,
                        retry = retries,
                        max_retries = max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "retrying request"
                    );

                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send with the stored token; on 401 renew once and replay once.
    async fn send_authenticated(&self, request: &ApiRequest) -> ApiResult<reqwest::Response> {
        if request.anonymous {
            return self.send_once(request, None).await;
        }

        let token = self.credentials.access_token();

        match self.send_once(request, token.as_deref()).await {
            Err(ApiError::Unauthenticated { .. }) => {
                debug!(path = %request.path, "access token rejected, renewing");
                let renewed = self.renewal.acquire(token.as_deref()).await?;

                // Replayed at most once: a second 401 ends the session.
                match self.send_once(request, Some(&renewed)).await {
                    Err(ApiError::Unauthenticated { message }) => {
                        warn!(path = %request.path, "renewed token rejected, clearing credentials");
                        if let Err(e) = self.credentials.clear() {
                            warn!(error = %e, "failed to clear credentials");
                        }
                        Err(ApiError::Unauthenticated {
                            message: format!("rejected after renewal: {}", message),
                        })
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn send_once(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
    ) -> ApiResult<reqwest::Response> {
        let url = join_url(&self.base_url, &request.path);
        let mut builder = self.client.request(request.method.clone(), &url);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(body) => builder.json(body),
            RequestBody::Upload(upload) => builder.multipart(upload.to_form()?),
        };

        let started = Instant::now();
        let response = builder.send().await.map_err(|e| {
            debug!(
                method = %request.method,
                path = %request.path,
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %e,
                "request failed without response"
            );
            ApiError::from(e)
        })?;
        let status = response.status();

        debug!(
            method = %request.method,
            path = %request.path,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request completed"
        );

        if status.is_success() {
            return Ok(response);
        }

        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status, &headers, &body))
    }
}

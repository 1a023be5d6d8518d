//! API client: the request pipeline every dashboard call goes through.
//!
//! Public API: no status code knowledge. All HTTP/status mapping in http.rs.

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::credentials::{CredentialStore, FileStorage};
use crate::envelope::{LoginRequest, LoginResponse};
use crate::error::{ApiError, ApiResult};
use crate::renewal::{HttpRenewer, RenewalCoordinator, TokenRenewer};

pub(crate) mod helpers;
mod http;
mod transfer;

pub use http::{ApiRequest, RequestBody, RequestOptions};
pub use transfer::{Download, ProgressFn, UploadBody};

use helpers::{decode_payload, join_url};
use http::HttpBackend;

const USER_AGENT_VALUE: &str = concat!("ledgerdash-client/", env!("CARGO_PKG_VERSION"));

/// Dashboard API client.
///
/// Cheap to clone; clones share credentials and renewal state.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: HttpBackend,
}

impl ApiClient {
    /// Client persisting credentials to the configured (or default) file.
    pub fn new(config: ClientConfig) -> ApiResult<Self> {
        let path = match &config.credentials_path {
            Some(path) => path.clone(),
            None => FileStorage::default_path()?,
        };
        let storage = Arc::new(FileStorage::new(path));
        let credentials = CredentialStore::new(storage, &config.storage_prefix);
        Self::with_credentials(config, credentials)
    }

    pub fn from_env() -> ApiResult<Self> {
        Self::new(ClientConfig::from_env())
    }

    /// Client with an injected credential store and HTTP renewal.
    pub fn with_credentials(config: ClientConfig, credentials: CredentialStore) -> ApiResult<Self> {
        let client = build_http_client(&config)?;
        let renewer = HttpRenewer::new(
            client.clone(),
            join_url(&config.base_url, &config.refresh_path),
        );
        Self::assemble(config, client, credentials, Arc::new(renewer))
    }

    /// Client with an injected credential store and renewal implementation.
    pub fn with_renewer(
        config: ClientConfig,
        credentials: CredentialStore,
        renewer: Arc<dyn TokenRenewer>,
    ) -> ApiResult<Self> {
        let client = build_http_client(&config)?;
        Self::assemble(config, client, credentials, renewer)
    }

    fn assemble(
        config: ClientConfig,
        client: reqwest::Client,
        credentials: CredentialStore,
        renewer: Arc<dyn TokenRenewer>,
    ) -> ApiResult<Self> {
        url::Url::parse(&config.base_url).map_err(|e| ApiError::Config {
            message: format!("invalid base URL {:?}: {}", config.base_url, e),
        })?;

        let base_url = config.base_url.trim_end_matches('/').to_string();
        let renewal = RenewalCoordinator::new(renewer, credentials.clone());

        Ok(Self {
            http: HttpBackend {
                client,
                base_url,
                credentials,
                renewal,
                config,
            },
        })
    }

    /// Send a request and unwrap the envelope's `data` into `T`.
    pub async fn send<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
        options: RequestOptions,
    ) -> ApiResult<T> {
        let response = self.http.execute(&request, &options).await?;
        let body = response.text().await.map_err(|e| ApiError::Network {
            message: format!("failed to read response body: {}", e),
        })?;
        decode_payload(&body)
    }

    /// `GET` marked retry-safe.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        self.send(ApiRequest::get(path), RequestOptions::retry_safe()).await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> ApiResult<T>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let request = ApiRequest::post(path).with_json(serde_json::to_value(body)?);
        self.send(request, RequestOptions::default()).await
    }

    pub async fn put<T, B>(&self, path: &str, body: &B) -> ApiResult<T>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let request = ApiRequest::put(path).with_json(serde_json::to_value(body)?);
        self.send(request, RequestOptions::default()).await
    }

    pub async fn patch<T, B>(&self, path: &str, body: &B) -> ApiResult<T>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let request = ApiRequest::patch(path).with_json(serde_json::to_value(body)?);
        self.send(request, RequestOptions::default()).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        self.send(ApiRequest::delete(path), RequestOptions::default()).await
    }

    /// Multipart upload to `path`; the envelope payload is decoded into `T`.
    pub async fn upload<T: DeserializeOwned>(
        &self,
        path: &str,
        upload: UploadBody,
        options: RequestOptions,
    ) -> ApiResult<T> {
        debug!(path, bytes = upload.len(), "uploading file");
        self.send(ApiRequest::post(path).with_upload(upload), options).await
    }

    /// Fetch a binary body; typically `ApiRequest::get(...)`.
    pub async fn download(
        &self,
        request: ApiRequest,
        options: RequestOptions,
    ) -> ApiResult<Download> {
        let response = self.http.execute(&request, &options).await?;
        let headers = response.headers().clone();
        let bytes = response.bytes().await.map_err(|e| ApiError::Network {
            message: format!("failed to read download body: {}", e),
        })?;
        debug!(path = %request.path, bytes = bytes.len(), "download complete");
        Ok(Download::from_parts(&headers, bytes.to_vec()))
    }

    /// Exchange email/password for a token pair and store it.
    pub async fn login(&self, credentials: &LoginRequest) -> ApiResult<LoginResponse> {
        let request = ApiRequest::post("/auth/login")
            .with_json(serde_json::to_value(credentials)?)
            .anonymous();
        let response: LoginResponse = self.send(request, RequestOptions::default()).await?;

        self.http.credentials.set_tokens(
            Some(&response.tokens.access_token),
            response.tokens.refresh_token.as_deref(),
        )?;
        info!("logged in");
        Ok(response)
    }

    /// Tell the server (best effort) and drop the stored credentials.
    pub async fn logout(&self) -> ApiResult<()> {
        if self.is_authenticated() {
            let result: ApiResult<serde_json::Value> = self
                .send(ApiRequest::post("/auth/logout"), RequestOptions::default())
                .await;
            if let Err(e) = result {
                warn!(error = %e, "server-side logout failed");
            }
        }

        self.http.credentials.clear()?;
        info!("logged out");
        Ok(())
    }

    pub fn is_authenticated(&self) -> bool {
        self.http.credentials.access_token().is_some()
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.http.credentials
    }

    pub fn renewal(&self) -> &RenewalCoordinator {
        &self.http.renewal
    }

    pub fn base_url(&self) -> &str {
        &self.http.base_url
    }
}

fn build_http_client(config: &ClientConfig) -> ApiResult<reqwest::Client> {
    let mut default_headers = HeaderMap::new();
    default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

    reqwest::Client::builder()
        .timeout(config.timeout())
        .default_headers(default_headers)
        .build()
        .map_err(|e| ApiError::Config {
            message: format!("failed to create HTTP client: {}", e),
        })
}

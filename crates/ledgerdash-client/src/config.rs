//! Client configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Data-access client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL every request path is appended to.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Prefix for the persisted credential keys.
    #[serde(default = "default_storage_prefix")]
    pub storage_prefix: String,

    /// Maximum automatic retries for retry-safe calls.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Path of the token renewal endpoint.
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,

    /// Credential file location (defaults to the platform data dir).
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,
}

fn default_base_url() -> String {
    "http://localhost:3000/api".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_storage_prefix() -> String {
    "ledgerdash_".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_refresh_path() -> String {
    "/auth/refresh".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_ms: default_timeout_ms(),
            storage_prefix: default_storage_prefix(),
            max_retries: default_max_retries(),
            refresh_path: default_refresh_path(),
            credentials_path: None,
        }
    }
}

impl ClientConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `LEDGERDASH_API_URL` | API base URL |
    /// | `LEDGERDASH_TIMEOUT_MS` | Request timeout in milliseconds |
    /// | `LEDGERDASH_STORAGE_PREFIX` | Prefix for persisted credential keys |
    /// | `LEDGERDASH_MAX_RETRIES` | Max retries for retry-safe calls |
    /// | `LEDGERDASH_REFRESH_PATH` | Token renewal endpoint path |
    /// | `LEDGERDASH_CREDENTIALS_FILE` | Credential file location |
    pub fn from_env() -> Self {
        Self {
            base_url: non_empty_var("LEDGERDASH_API_URL").unwrap_or_else(default_base_url),
            timeout_ms: std::env::var("LEDGERDASH_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_timeout_ms),
            storage_prefix: std::env::var("LEDGERDASH_STORAGE_PREFIX")
                .unwrap_or_else(|_| default_storage_prefix()),
            max_retries: std::env::var("LEDGERDASH_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_retries),
            refresh_path: non_empty_var("LEDGERDASH_REFRESH_PATH")
                .unwrap_or_else(default_refresh_path),
            credentials_path: non_empty_var("LEDGERDASH_CREDENTIALS_FILE").map(PathBuf::from),
        }
    }

    /// Request timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the request timeout in milliseconds.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the credential key prefix.
    pub fn with_storage_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.storage_prefix = prefix.into();
        self
    }

    /// Set the retry bound for retry-safe calls.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the renewal endpoint path.
    pub fn with_refresh_path(mut self, path: impl Into<String>) -> Self {
        self.refresh_path = path.into();
        self
    }

    /// Set the credential file location.
    pub fn with_credentials_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_path = Some(path.into());
        self
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "LEDGERDASH_API_URL",
        "LEDGERDASH_TIMEOUT_MS",
        "LEDGERDASH_STORAGE_PREFIX",
        "LEDGERDASH_MAX_RETRIES",
        "LEDGERDASH_REFRESH_PATH",
        "LEDGERDASH_CREDENTIALS_FILE",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();

        let config = ClientConfig::from_env();
        assert_eq!(config.base_url, "http://localhost:3000/api");
        assert_eq!(config.timeout_ms, 30_000);
        assert_eq!(config.storage_prefix, "ledgerdash_");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.refresh_path, "/auth/refresh");
        assert!(config.credentials_path.is_none());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        std::env::set_var("LEDGERDASH_API_URL", "https://api.example.test/v2");
        std::env::set_var("LEDGERDASH_TIMEOUT_MS", "1500");
        std::env::set_var("LEDGERDASH_STORAGE_PREFIX", "crm_");
        std::env::set_var("LEDGERDASH_MAX_RETRIES", "not-a-number");

        let config = ClientConfig::from_env();
        clear_env();

        assert_eq!(config.base_url, "https://api.example.test/v2");
        assert_eq!(config.timeout(), Duration::from_millis(1500));
        assert_eq!(config.storage_prefix, "crm_");
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::default()
            .with_base_url("http://127.0.0.1:9000")
            .with_timeout_ms(250)
            .with_storage_prefix("test_")
            .with_max_retries(0)
            .with_refresh_path("/session/renew");

        assert_eq!(config.base_url, "http://127.0.0.1:9000");
        assert_eq!(config.timeout_ms, 250);
        assert_eq!(config.storage_prefix, "test_");
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.refresh_path, "/session/renew");
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"base_url": "http://x.test", "timeout_ms": 10}"#).unwrap();
        assert_eq!(config.base_url, "http://x.test");
        assert_eq!(config.timeout_ms, 10);
        assert_eq!(config.storage_prefix, "ledgerdash_");
    }
}

//! Durable storage for the access/refresh token pair.
//!
//! # Layout
//!
//! Two string keys, namespaced by the configured prefix:
//!
//! ```text
//! <prefix>auth_token      # access token
//! <prefix>refresh_token   # refresh token
//! ```
//!
//! [`CredentialStore`] is the only writer-facing API. The backend is a
//! [`TokenStorage`] implementation, so renewal logic can be tested against
//! [`MemoryStorage`] while the application persists with [`FileStorage`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::error::{ApiError, ApiResult};

const ACCESS_KEY: &str = "auth_token";
const REFRESH_KEY: &str = "refresh_token";

/// Synchronous string key/value backend.
pub trait TokenStorage: Send + Sync + std::fmt::Debug {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> ApiResult<()>;
    fn remove(&self, key: &str) -> ApiResult<()>;
}

/// In-process storage; contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TokenStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.values().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> ApiResult<()> {
        self.values().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> ApiResult<()> {
        self.values().remove(key);
        Ok(())
    }
}

/// JSON-file storage that survives restarts.
///
/// The whole document is rewritten through a temp file and renamed into
/// place, so a crash never leaves a half-written file behind.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Default location: `<data dir>/ledgerdash/credentials.json`.
    pub fn default_path() -> ApiResult<PathBuf> {
        let base = dirs::data_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| ApiError::Storage {
                message: "could not determine a data directory".to_string(),
            })?;
        Ok(base.join("ledgerdash").join("credentials.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is empty; an unparsable one is a storage error.
    fn read_all(&self) -> ApiResult<BTreeMap<String, String>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(ApiError::Storage {
                    message: format!("failed to read {}: {}", self.path.display(), e),
                })
            }
        };
        serde_json::from_str(&content).map_err(|e| ApiError::Storage {
            message: format!("corrupt credential file {}: {}", self.path.display(), e),
        })
    }

    fn write_all(&self, values: &BTreeMap<String, String>) -> ApiResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ApiError::Storage {
                message: format!("failed to create {}: {}", parent.display(), e),
            })?;
        }

        let content = serde_json::to_string_pretty(values).map_err(|e| ApiError::Storage {
            message: format!("failed to serialize credentials: {}", e),
        })?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(|e| ApiError::Storage {
            message: format!("failed to write {}: {}", tmp.display(), e),
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| ApiError::Storage {
            message: format!("failed to replace {}: {}", self.path.display(), e),
        })
    }

    fn update(&self, f: impl FnOnce(&mut BTreeMap<String, String>)) -> ApiResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut values = self.read_all()?;
        f(&mut values);
        self.write_all(&values)
    }
}

impl TokenStorage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        match self.read_all() {
            Ok(mut values) => values.remove(key),
            Err(e) => {
                warn!(error = %e, "credential file unreadable, treating as signed out");
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> ApiResult<()> {
        self.update(|values| {
            values.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> ApiResult<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        // Unreadable content is replaced so sign-out always succeeds.
        let mut values = self.read_all().unwrap_or_else(|e| {
            warn!(error = %e, "discarding unreadable credential file");
            BTreeMap::new()
        });
        values.remove(key);
        self.write_all(&values)
    }
}

/// Access/refresh token pair, persisted under prefixed keys.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    storage: Arc<dyn TokenStorage>,
    access_key: String,
    refresh_key: String,
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn TokenStorage>, prefix: &str) -> Self {
        Self {
            storage,
            access_key: format!("{}{}", prefix, ACCESS_KEY),
            refresh_key: format!("{}{}", prefix, REFRESH_KEY),
        }
    }

    /// Store backed by [`MemoryStorage`].
    pub fn in_memory(prefix: &str) -> Self {
        Self::new(Arc::new(MemoryStorage::new()), prefix)
    }

    pub fn access_token(&self) -> Option<String> {
        self.storage.get(&self.access_key)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.storage.get(&self.refresh_key)
    }

    /// Update either token; `None` leaves that token unchanged.
    pub fn set_tokens(&self, access: Option<&str>, refresh: Option<&str>) -> ApiResult<()> {
        if let Some(access) = access {
            self.storage.set(&self.access_key, access)?;
        }
        if let Some(refresh) = refresh {
            self.storage.set(&self.refresh_key, refresh)?;
        }
        debug!(
            access = access.is_some(),
            refresh = refresh.is_some(),
            "credentials updated"
        );
        Ok(())
    }

    /// Remove both tokens.
    pub fn clear(&self) -> ApiResult<()> {
        self.storage.remove(&self.access_key)?;
        self.storage.remove(&self.refresh_key)?;
        debug!("credentials cleared");
        Ok(())
    }

    /// Key under which the access token is persisted.
    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    /// Key under which the refresh token is persisted.
    pub fn refresh_key(&self) -> &str {
        &self.refresh_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_keys() {
        let storage = Arc::new(MemoryStorage::new());
        let store = CredentialStore::new(storage.clone(), "crm_");
        store.set_tokens(Some("a1"), Some("r1")).unwrap();

        assert_eq!(storage.get("crm_auth_token").as_deref(), Some("a1"));
        assert_eq!(storage.get("crm_refresh_token").as_deref(), Some("r1"));
        assert_eq!(store.access_key(), "crm_auth_token");
    }

    #[test]
    fn test_set_tokens_partial_update() {
        let store = CredentialStore::in_memory("t_");
        store.set_tokens(Some("a1"), Some("r1")).unwrap();

        store.set_tokens(Some("a2"), None).unwrap();
        assert_eq!(store.access_token().as_deref(), Some("a2"));
        assert_eq!(store.refresh_token().as_deref(), Some("r1"));

        store.set_tokens(None, Some("r2")).unwrap();
        assert_eq!(store.access_token().as_deref(), Some("a2"));
        assert_eq!(store.refresh_token().as_deref(), Some("r2"));
    }

    #[test]
    fn test_clear_removes_both() {
        let store = CredentialStore::in_memory("t_");
        store.set_tokens(Some("a"), Some("r")).unwrap();
        store.clear().unwrap();

        assert!(store.access_token().is_none());
        assert!(store.refresh_token().is_none());
    }

    #[test]
    fn test_file_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("credentials.json");

        let store = CredentialStore::new(Arc::new(FileStorage::new(&path)), "app_");
        store.set_tokens(Some("access"), Some("refresh")).unwrap();
        drop(store);

        let reopened = CredentialStore::new(Arc::new(FileStorage::new(&path)), "app_");
        assert_eq!(reopened.access_token().as_deref(), Some("access"));
        assert_eq!(reopened.refresh_token().as_deref(), Some("refresh"));

        reopened.clear().unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), "{}");
    }

    #[test]
    fn test_corrupt_file_surfaces_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = CredentialStore::new(Arc::new(FileStorage::new(&path)), "app_");
        assert!(store.access_token().is_none());

        let err = store.set_tokens(Some("access"), None).unwrap_err();
        assert!(matches!(err, ApiError::Storage { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{not json");

        store.clear().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "{}");
        store.set_tokens(Some("access"), None).unwrap();
        assert_eq!(store.access_token().as_deref(), Some("access"));
    }

    #[test]
    fn test_file_storage_clear_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("missing.json"));
        storage.remove("app_auth_token").unwrap();
        assert!(!storage.path().exists());
    }
}

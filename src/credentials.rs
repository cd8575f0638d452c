//! Credential persistence
//!
//! Adapters persist opaque credential material (OAuth tokens) through this
//! injected capability: string key to string value, absent key means no
//! stored credential. The file-backed implementation keeps one file per key
//! with restrictive permissions; tests substitute the in-memory store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::warn;

use crate::providers::types::StorageError;

/// Key-value credential persistence capability.
pub trait CredentialStore: Send + Sync {
    /// Returns the stored value, or `None` when no credential exists.
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// File-backed store: one file per key under the application config
/// directory.
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    /// Store rooted at `dirs::config_dir()/unicloud/credentials`.
    pub fn open_default() -> Result<Self, StorageError> {
        let base = dirs::config_dir().ok_or_else(|| {
            StorageError::ConfigurationMissing("no config directory on this platform".to_string())
        })?;
        Self::open(base.join("unicloud").join("credentials"))
    }

    /// Store rooted at an explicit directory (created if absent).
    pub fn open(dir: PathBuf) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are internal identifiers; anything outside [a-z0-9_-] is
        // replaced so a key can never escape the store directory.
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    #[cfg(unix)]
    fn restrict_permissions(path: &std::path::Path) {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
            warn!("could not restrict permissions on {}: {}", path.display(), e);
        }
    }

    #[cfg(not(unix))]
    fn restrict_permissions(_path: &std::path::Path) {}
}

impl CredentialStore for FileCredentialStore {
    fn get(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.path_for(key)).ok()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        std::fs::write(&path, value)?;
        Self::restrict_permissions(&path);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryCredentialStore::new();
        assert!(store.get("k").is_none());
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").as_deref(), Some("v"));
        store.remove("k").unwrap();
        assert!(store.get("k").is_none());
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::open(dir.path().to_path_buf()).unwrap();
        store.set("oauth_google", "{\"access_token\":\"t\"}").unwrap();
        assert_eq!(
            store.get("oauth_google").as_deref(),
            Some("{\"access_token\":\"t\"}")
        );
        // Removing twice is not an error
        store.remove("oauth_google").unwrap();
        store.remove("oauth_google").unwrap();
        assert!(store.get("oauth_google").is_none());
    }

    #[test]
    fn file_store_sanitizes_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::open(dir.path().to_path_buf()).unwrap();
        store.set("../escape", "x").unwrap();
        // The value lands inside the store directory, not outside it
        assert!(store.get("../escape").is_some());
        assert!(dir.path().read_dir().unwrap().count() == 1);
    }
}

//! Persisted installed-version records.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::UpdateError;

/// Key holding the installed main image version.
pub const MAIN_VERSION_KEY: &str = "main_version";

/// Key holding the installed boot-stage image version.
pub const BOOT_VERSION_KEY: &str = "boot_version";

/// Small persistent key/value store.
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Option<String>;

    /// Store `value` under `key`; the value must survive a restart.
    fn set(&mut self, key: &str, value: &str) -> Result<(), UpdateError>;
}

/// In-memory store. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `entries`.
    pub fn with_entries<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let store = Self::default();
        store.values.lock().extend(
            entries
                .into_iter()
                .map(|(key, value)| (key.to_string(), value.to_string())),
        );
        store
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), UpdateError> {
        self.values
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Store persisted as a TOML table.
///
/// Every `set` rewrites the whole file through a temporary sibling and a
/// rename, so a reader never sees a half-written table.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl FileStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn open(path: &Path) -> Result<Self, UpdateError> {
        let values = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)
                .map_err(|e| UpdateError::StoreError(format!("{}: {e}", path.display())))?
        } else {
            tracing::debug!("No state file at {:?}, starting empty", path);
            BTreeMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            values,
        })
    }

    fn save(&self) -> Result<(), UpdateError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string(&self.values)
            .map_err(|e| UpdateError::StoreError(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        tracing::debug!("Saved state to {:?}", self.path);
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), UpdateError> {
        self.values.insert(key.to_string(), value.to_string());
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_store_shares_state() {
        let store = MemoryStore::with_entries([(MAIN_VERSION_KEY, "1.9.0")]);
        let mut handle = store.clone();
        handle.set(BOOT_VERSION_KEY, "1.0.0").unwrap();

        assert_eq!(store.get(MAIN_VERSION_KEY).as_deref(), Some("1.9.0"));
        assert_eq!(store.get(BOOT_VERSION_KEY).as_deref(), Some("1.0.0"));
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn test_file_store_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("versions.toml");

        let mut store = FileStore::open(&path).unwrap();
        assert_eq!(store.get(MAIN_VERSION_KEY), None);
        store.set(MAIN_VERSION_KEY, "2.0.0").unwrap();
        store.set(MAIN_VERSION_KEY, "2.0.1").unwrap();

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get(MAIN_VERSION_KEY).as_deref(), Some("2.0.1"));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_file_store_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("versions.toml");
        std::fs::write(&path, "not = [valid").unwrap();
        assert!(matches!(
            FileStore::open(&path),
            Err(UpdateError::StoreError(_))
        ));
    }
}

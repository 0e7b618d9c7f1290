//! Key-value persistence for engine state.
//!
//! The batch queue and the execution history snapshot their state under
//! fixed keys. Every value is wrapped in a [`Versioned`] envelope; on load an
//! unknown or missing schema version discards the entry instead of
//! attempting a migration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::constants::storage::SCHEMA_VERSION;
use crate::Result;

/// String-keyed store of serialized values
pub trait KvStore: Send + Sync {
    /// Read the value stored under `key`
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Replace the value stored under `key`
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete the value stored under `key` (no-op if absent)
    fn remove(&self, key: &str) -> Result<()>;
}

/// Schema-versioned wrapper written around every persisted value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u32,
    pub data: T,
}

/// Serialize `value` under `key` with the current schema version.
pub fn save_versioned<T: Serialize>(store: &dyn KvStore, key: &str, value: &T) -> Result<()> {
    let envelope = Versioned {
        version: SCHEMA_VERSION,
        data: value,
    };
    let content = serde_json::to_string(&envelope)?;
    store.set(key, &content)
}

/// Load the value under `key`.
///
/// Returns `Ok(None)` when nothing is stored, and also when the stored entry
/// has a different schema version or cannot be parsed; such entries are
/// removed so the caller starts from a fresh state.
pub fn load_versioned<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> Result<Option<T>> {
    let Some(content) = store.get(key)? else {
        return Ok(None);
    };

    let raw: serde_json::Value = match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("Discarding unreadable state under '{}': {}", key, e);
            store.remove(key)?;
            return Ok(None);
        }
    };

    let version = raw.get("version").and_then(|v| v.as_u64());
    if version != Some(u64::from(SCHEMA_VERSION)) {
        log::warn!(
            "Discarding state under '{}': schema version {:?}, expected {}",
            key,
            version,
            SCHEMA_VERSION
        );
        store.remove(key)?;
        return Ok(None);
    }

    match serde_json::from_value::<Versioned<T>>(raw) {
        Ok(envelope) => Ok(Some(envelope.data)),
        Err(e) => {
            log::warn!("Discarding malformed state under '{}': {}", key, e);
            store.remove(key)?;
            Ok(None)
        }
    }
}

/// In-memory store, for tests and hosts without disk access
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// File-backed store: one `<key>.json` file per key in a directory.
///
/// The directory is created on first write.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    /// Create a store that persists to the given directory.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Directory holding the files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(path)?))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);
        // Readers only ever see a complete file
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        log::debug!("Saved '{}' to {:?}", key, path);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            std::fs::remove_file(&path)?;
            log::debug!("Deleted '{}' from {:?}", key, path);
        }
        Ok(())
    }
}

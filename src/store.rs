//! Persistent key/value state.
//!
//! The node keeps its adoption state in an opaque string-to-string map
//! behind the [`DataStore`] trait. The meaning of the data is the node's
//! business; persistence and thread safety are the store's. Implementations
//! may be called from any thread.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::info;

use crate::error::{Error, Result};

/// Keys the node lifecycle reads and writes.
pub mod keys {
    /// `"1"` iff this node holds a valid adoption.
    pub const ADOPTION_VALID: &str = "adoption.valid";
    /// Shared HMAC secret issued at adoption.
    pub const ADOPTION_SECRET: &str = "adoption.secret";
    pub const SERVER_UUID: &str = "server.uuid";
    pub const SERVER_HOST: &str = "server.host";
    pub const SERVER_PORT: &str = "server.port";
    pub const RT_HOST: &str = "rt.host";
    pub const RT_PORT: &str = "rt.port";
}

/// Opaque key/value store for node state.
///
/// Invariant maintained by the callers: when `adoption.valid` is `"1"`,
/// the secret and both endpoint address pairs are present.
pub trait DataStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn has_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Volatile store for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryDataStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataStore for MemoryDataStore {
    fn get(&self, key: &str) -> Option<String> {
        self.map.lock().expect("store lock poisoned").get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.map
            .lock()
            .expect("store lock poisoned")
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// Write-through store persisting the map as a JSON file.
pub struct FileDataStore {
    path: PathBuf,
    map: Mutex<HashMap<String, String>>,
}

impl FileDataStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let map = if path.exists() {
            let raw = fs::read_to_string(path)
                .map_err(|e| Error::Store(format!("could not read {path:?}: {e}")))?;
            serde_json::from_str(&raw)
                .map_err(|e| Error::Store(format!("corrupt store {path:?}: {e}")))?
        } else {
            HashMap::new()
        };

        info!("data store at {path:?} ({} keys)", map.len());
        Ok(Self {
            path: path.to_path_buf(),
            map: Mutex::new(map),
        })
    }

    /// Persist the current map. Called under the map lock so writers are
    /// serialised.
    fn flush(&self, map: &HashMap<String, String>) -> Result<()> {
        let raw = serde_json::to_string_pretty(map)
            .map_err(|e| Error::Store(format!("could not serialise store: {e}")))?;
        fs::write(&self.path, raw)
            .map_err(|e| Error::Store(format!("could not write {:?}: {e}", self.path)))
    }
}

impl DataStore for FileDataStore {
    fn get(&self, key: &str) -> Option<String> {
        self.map.lock().expect("store lock poisoned").get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self.map.lock().expect("store lock poisoned");
        map.insert(key.to_string(), value.to_string());
        self.flush(&map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryDataStore::new();
        assert!(!store.has_key(keys::ADOPTION_VALID));

        store.set(keys::ADOPTION_VALID, "1").unwrap();
        assert_eq!(store.get(keys::ADOPTION_VALID).as_deref(), Some("1"));
        assert!(store.has_key(keys::ADOPTION_VALID));
    }

    #[test]
    fn memory_store_overwrites() {
        let store = MemoryDataStore::new();
        store.set(keys::SERVER_HOST, "10.0.0.1").unwrap();
        store.set(keys::SERVER_HOST, "10.0.0.2").unwrap();
        assert_eq!(store.get(keys::SERVER_HOST).as_deref(), Some("10.0.0.2"));
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = std::env::temp_dir().join(format!("licht-store-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.json");

        {
            let store = FileDataStore::open(&path).unwrap();
            store.set(keys::ADOPTION_SECRET, "hunter2").unwrap();
            store.set(keys::SERVER_PORT, "7421").unwrap();
        }

        let store = FileDataStore::open(&path).unwrap();
        assert_eq!(store.get(keys::ADOPTION_SECRET).as_deref(), Some("hunter2"));
        assert_eq!(store.get(keys::SERVER_PORT).as_deref(), Some("7421"));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn file_store_rejects_corrupt_json() {
        let dir = std::env::temp_dir().join(format!("licht-store-bad-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.json");
        fs::write(&path, "{not json").unwrap();

        assert!(matches!(FileDataStore::open(&path), Err(Error::Store(_))));
        fs::remove_dir_all(&dir).ok();
    }
}

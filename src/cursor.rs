//! Durable resume-cursor storage.
//!
//! The cursor is the sequence number of the last room event a client has
//! applied. It is stored per room under `room:{room_id}:last_seq` in a
//! pluggable [`KeyValueStore`] so a reconnect (or a fresh process) can ask the
//! server to replay only the events it missed.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::warn;

/// Errors produced by persistent key-value backends.
#[derive(Debug, Error)]
pub enum CursorStoreError {
    /// Backing file could not be read or written.
    #[error("cursor store io error: {0}")]
    Io(#[from] io::Error),

    /// Backing file contents could not be encoded or decoded.
    #[error("cursor store json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// String key-value backend used by [`CursorStore`].
pub trait KeyValueStore: Send + Sync {
    /// Returns the raw value stored under `key`.
    fn get(&self, key: &str) -> Option<String>;

    /// Stores `value` under `key`, replacing any prior value.
    fn set(&self, key: &str, value: String) -> Result<(), CursorStoreError>;
}

/// Process-local backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        lock_entries(&self.entries).get(key).cloned()
    }

    fn set(&self, key: &str, value: String) -> Result<(), CursorStoreError> {
        lock_entries(&self.entries).insert(key.to_string(), value);
        Ok(())
    }
}

/// Backend persisted as a flat JSON object on disk.
///
/// The whole file is rewritten on every `set`. A missing file reads as empty.
///
/// Writes are blocking `std::fs` calls made on the thread that dispatches
/// room events, once per snapshot and event. Keep the file on local disk.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Opens (or lazily creates) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CursorStoreError> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_json::from_str(&text)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        lock_entries(&self.entries).get(key).cloned()
    }

    fn set(&self, key: &str, value: String) -> Result<(), CursorStoreError> {
        let encoded = {
            let mut entries = lock_entries(&self.entries);
            entries.insert(key.to_string(), value);
            serde_json::to_string_pretty(&*entries)?
        };
        fs::write(&self.path, encoded)?;
        Ok(())
    }
}

fn lock_entries(
    entries: &Mutex<BTreeMap<String, String>>,
) -> MutexGuard<'_, BTreeMap<String, String>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Storage key for a room's cursor.
pub fn cursor_key(room_id: u64) -> String {
    format!("room:{room_id}:last_seq")
}

/// Per-room cursor accessor over a shared backend.
#[derive(Clone)]
pub struct CursorStore {
    backend: Arc<dyn KeyValueStore>,
}

impl CursorStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    /// Store backed by a fresh [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Reads the stored cursor for `room_id`.
    ///
    /// Returns `default` when nothing is stored or the stored value is not an
    /// integer.
    pub fn get(&self, room_id: u64, default: Option<i64>) -> Option<i64> {
        let Some(raw) = self.backend.get(&cursor_key(room_id)) else {
            return default;
        };
        match raw.trim().parse::<i64>() {
            Ok(cursor) => Some(cursor),
            Err(_) => {
                warn!(event = "cursor_malformed", room_id, raw = %raw);
                default
            }
        }
    }

    /// Writes the cursor for `room_id`, overwriting any previous value.
    pub fn set(&self, room_id: u64, cursor: i64) -> Result<(), CursorStoreError> {
        self.backend.set(&cursor_key(room_id), cursor.to_string())
    }

    /// Raw backend, for callers sharing it with other key-value consumers.
    pub fn backend(&self) -> &Arc<dyn KeyValueStore> {
        &self.backend
    }
}

impl Default for CursorStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl std::fmt::Debug for CursorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorStore").finish_non_exhaustive()
    }
}

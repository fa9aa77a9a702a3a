//! Persisted key/value storage
//!
//! Every persisted record lives under a stable key as `{"value": ...}`.
//! Writers never merge: the last write wins. Observers (the UI, the runtime)
//! subscribe to [`StoreChange`] notifications and re-read the key.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

/// Capacity of the change notification channel
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Stable storage keys
pub mod keys {
    pub const RULES: &str = "swift-rules";
    pub const ENABLED: &str = "swift-enabled";
    pub const DISCONNECT_ON_UNMATCHED: &str = "swift-disconnect-on-unmatched";
    pub const DEBUG: &str = "swift-debug";
    pub const ACTIVE_RULE: &str = "swift-active-rule";
    pub const BLOCKED_SITE: &str = "swift-blocked-site";
    pub const HEARTBEAT: &str = "swift-heartbeat";
}

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A key was written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
}

/// Raw JSON storage with change notifications
pub trait Store: Send + Sync {
    fn get_raw(&self, key: &str) -> Result<Option<Value>, StoreError>;

    fn set_raw(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Receive a notification after every write.
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}

#[derive(Serialize, Deserialize)]
struct Slot<T> {
    value: T,
}

/// Typed handle over one storage key
pub struct StorageItem<T> {
    key: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StorageItem<T> {
    pub const fn new(key: &'static str) -> Self {
        Self {
            key,
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }
}

impl<T: Serialize + DeserializeOwned> StorageItem<T> {
    /// Read the slot. `Ok(None)` when it was never written.
    pub fn get(&self, store: &dyn Store) -> Result<Option<T>, StoreError> {
        let Some(raw) = store.get_raw(self.key)? else {
            return Ok(None);
        };

        let slot: Slot<T> = serde_json::from_value(raw).map_err(|source| StoreError::Decode {
            key: self.key.to_string(),
            source,
        })?;
        Ok(Some(slot.value))
    }

    pub fn set(&self, store: &dyn Store, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_value(Slot { value }).map_err(|source| StoreError::Encode {
            key: self.key.to_string(),
            source,
        })?;
        store.set_raw(self.key, raw)
    }
}

/// In-memory store
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
    changes: broadcast::Sender<StoreChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            values: Mutex::new(HashMap::new()),
            changes,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn get_raw(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set_raw(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.values.lock().insert(key.to_string(), value);
        trace!("Stored {}", key);
        // No subscribers is fine
        let _ = self.changes.send(StoreChange {
            key: key.to_string(),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

/// Store persisted as a single JSON document on disk
pub struct FileStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
    changes: broadcast::Sender<StoreChange>,
}

impl FileStore {
    /// Open (or create on first write) the document at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let values = match fs::read_to_string(&path) {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|source| StoreError::Decode {
                    key: path.display().to_string(),
                    source,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };

        info!("Opened store {} ({} keys)", path.display(), values.len());

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            path,
            values: Mutex::new(values),
            changes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write to a temp file, then rename over the document.
    fn persist(&self, values: &Map<String, Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp_path = self.path.with_extension("tmp");
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, values).map_err(|source| StoreError::Encode {
            key: self.path.display().to_string(),
            source,
        })?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl Store for FileStore {
    fn get_raw(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set_raw(&self, key: &str, value: Value) -> Result<(), StoreError> {
        {
            let mut values = self.values.lock();
            let mut next = values.clone();
            next.insert(key.to_string(), value);
            // Memory only follows a successful write
            self.persist(&next)?;
            *values = next;
        }

        debug!("Persisted {} to {}", key, self.path.display());
        let _ = self.changes.send(StoreChange {
            key: key.to_string(),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

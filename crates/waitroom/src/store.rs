//! Resume store: the small persisted record that survives reloads.
//!
//! Stores are plain key-value media keyed by [`ClientIdentity`] holding the
//! serialized [`PersistedRecord`]. They do no validation of their own; the
//! controller decides whether a loaded payload is usable.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::ClientIdentity;
use crate::machine::Progress;
use crate::status::AdmissionStatus;

/// Last known admission progress for one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRecord {
    pub client_identity: ClientIdentity,
    pub last_status: AdmissionStatus,
    pub last_position: u32,
    pub consecutive_error_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl PersistedRecord {
    /// Stamp a record with the current time.
    pub fn new(client_identity: ClientIdentity, progress: Progress) -> Self {
        Self {
            client_identity,
            last_status: progress.status,
            last_position: progress.position,
            consecutive_error_count: progress.consecutive_errors,
            updated_at: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        match chrono::Duration::from_std(max_age) {
            Ok(max_age) => now.signed_duration_since(self.updated_at) > max_age,
            // Out of chrono's range: nothing is ever that old.
            Err(_) => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("resume store I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("resume store lock poisoned")]
    Poisoned,
}

/// Durable key-value medium for persisted records.
pub trait ResumeStore: Send + Sync {
    /// Raw payload last saved for `identity`, if any.
    fn load(&self, identity: &ClientIdentity) -> Result<Option<String>, StoreError>;

    fn save(&self, identity: &ClientIdentity, payload: &str) -> Result<(), StoreError>;

    /// Remove the payload. Clearing an absent entry is not an error.
    fn clear(&self, identity: &ClientIdentity) -> Result<(), StoreError>;
}

/// In-memory store, mostly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<ClientIdentity, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entry with an arbitrary payload (including garbage).
    pub fn insert_raw(&self, identity: &ClientIdentity, payload: impl Into<String>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(identity.clone(), payload.into());
        }
    }

    /// Decoded record for `identity`, if present and well-formed.
    pub fn record(&self, identity: &ClientIdentity) -> Option<PersistedRecord> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(identity)
            .and_then(|payload| PersistedRecord::decode(payload).ok())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().map(|e| e.is_empty()).unwrap_or(true)
    }
}

impl ResumeStore for MemoryStore {
    fn load(&self, identity: &ClientIdentity) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(identity).cloned())
    }

    fn save(&self, identity: &ClientIdentity, payload: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(identity.clone(), payload.to_string());
        Ok(())
    }

    fn clear(&self, identity: &ClientIdentity) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.remove(identity);
        Ok(())
    }
}

/// One JSON file per identity inside a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, identity: &ClientIdentity) -> PathBuf {
        let name: String = identity
            .as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }

    fn io_error(path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl ResumeStore for FileStore {
    fn load(&self, identity: &ClientIdentity) -> Result<Option<String>, StoreError> {
        let path = self.path_for(identity);
        match std::fs::read_to_string(&path) {
            Ok(payload) => Ok(Some(payload)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_error(&path, e)),
        }
    }

    fn save(&self, identity: &ClientIdentity, payload: &str) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| Self::io_error(&self.dir, e))?;

        let path = self.path_for(identity);
        // Write-then-rename so a crash never leaves a half-written record.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, payload).map_err(|e| Self::io_error(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| Self::io_error(&path, e))
    }

    fn clear(&self, identity: &ClientIdentity) -> Result<(), StoreError> {
        let path = self.path_for(identity);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error(&path, e)),
        }
    }
}

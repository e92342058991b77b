//! Round-Scoped Plugin State
//!
//! The engine calls the plugin in discrete rounds. Everything that must
//! survive from one round to the next goes through a state store:
//! - `read` returns the snapshot as of the start of the current round
//! - `write` stages a snapshot that only becomes readable next round
//!
//! Two stores are provided: an in-memory one and a file-backed one that
//! keeps state in `.arrayrunner/{task}-{digest}.state` for crash recovery.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Default directory for state files.
pub const STATE_DIR: &str = ".arrayrunner";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state (de)serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("state file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("state store lock poisoned")]
    Poisoned,
}

/// Opaque serialized plugin state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot(Vec<u8>);

impl Snapshot {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Serializes a value into a snapshot.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, StateError> {
        Ok(Self(serde_json::to_vec(value)?))
    }

    /// Deserializes a snapshot into a value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StateError> {
        Ok(serde_json::from_slice(&self.0)?)
    }
}

/// Reads the state as of the start of the current round.
pub trait PluginStateReader: Send + Sync {
    /// Returns the current snapshot, or `None` before the first write lands.
    fn read(&self) -> Result<Option<Snapshot>, StateError>;
}

/// Stages state for the next round.
pub trait PluginStateWriter: Send + Sync {
    /// Stages `snapshot`; the last write of a round wins.
    fn write(&self, snapshot: Snapshot) -> Result<(), StateError>;
}

/// Reads and decodes the current state.
pub fn read_state<T: DeserializeOwned>(
    reader: &dyn PluginStateReader,
) -> Result<Option<T>, StateError> {
    reader.read()?.map(|s| s.decode()).transpose()
}

/// Encodes and stages a new state.
pub fn write_state<T: Serialize>(writer: &dyn PluginStateWriter, value: &T) -> Result<(), StateError> {
    writer.write(Snapshot::encode(value)?)
}

#[derive(Debug, Default)]
struct Slots {
    round: u64,
    current: Option<Snapshot>,
    staged: Option<Snapshot>,
}

/// In-memory round-scoped store.
#[derive(Debug, Default)]
pub struct RoundStateStore {
    slots: Mutex<Slots>,
}

impl RoundStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new round, making the last staged snapshot current.
    ///
    /// Returns the new round number.
    pub fn begin_round(&self) -> Result<u64, StateError> {
        let mut slots = self.slots.lock().map_err(|_| StateError::Poisoned)?;
        if let Some(staged) = slots.staged.take() {
            slots.current = Some(staged);
        }
        slots.round += 1;
        Ok(slots.round)
    }

    /// Current round number (0 before the first round starts).
    pub fn round(&self) -> u64 {
        self.slots.lock().map(|s| s.round).unwrap_or(0)
    }
}

impl PluginStateReader for RoundStateStore {
    fn read(&self) -> Result<Option<Snapshot>, StateError> {
        let slots = self.slots.lock().map_err(|_| StateError::Poisoned)?;
        Ok(slots.current.clone())
    }
}

impl PluginStateWriter for RoundStateStore {
    fn write(&self, snapshot: Snapshot) -> Result<(), StateError> {
        let mut slots = self.slots.lock().map_err(|_| StateError::Poisoned)?;
        slots.staged = Some(snapshot);
        Ok(())
    }
}

/// File-backed round-scoped store.
///
/// Staged writes go to `{stem}.state.next`; the next [`begin_round`]
/// renames that file over `{stem}.state`, so a crash mid-round never
/// exposes a half-finished round's state.
///
/// [`begin_round`]: FileStateStore::begin_round
#[derive(Debug)]
pub struct FileStateStore {
    state_path: PathBuf,
    staged_path: PathBuf,
    current: Mutex<Option<Snapshot>>,
}

impl FileStateStore {
    /// Creates a store for `task_name` under `dir`.
    pub fn new(dir: impl AsRef<Path>, task_name: &str) -> Self {
        let stem = Self::file_stem(task_name);
        let dir = dir.as_ref();
        Self {
            state_path: dir.join(format!("{}.state", stem)),
            staged_path: dir.join(format!("{}.state.next", stem)),
            current: Mutex::new(None),
        }
    }

    /// Returns the path of the committed state file.
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Promotes the staged file, then loads the committed state.
    pub fn begin_round(&self) -> Result<(), StateError> {
        if self.staged_path.exists() {
            fs::rename(&self.staged_path, &self.state_path).map_err(|e| self.io_err(&self.state_path, e))?;
            debug!("Promoted staged state to {}", self.state_path.display());
        }

        let loaded = match fs::read(&self.state_path) {
            Ok(bytes) => Some(Snapshot::from_bytes(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(self.io_err(&self.state_path, e)),
        };

        if loaded.is_some() {
            info!("Loaded plugin state from {}", self.state_path.display());
        }
        *self.current.lock().map_err(|_| StateError::Poisoned)? = loaded;
        Ok(())
    }

    /// Deletes both committed and staged state files.
    pub fn delete(&self) -> Result<(), StateError> {
        for path in [&self.state_path, &self.staged_path] {
            if path.exists() {
                fs::remove_file(path).map_err(|e| self.io_err(path, e))?;
                info!("Deleted state file: {}", path.display());
            }
        }
        Ok(())
    }

    /// Readable stem plus a short digest of the raw name, so names that
    /// sanitize alike still get distinct files.
    fn file_stem(task_name: &str) -> String {
        let readable: String = task_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let readable = if readable.is_empty() { "task" } else { readable.as_str() };
        let digest = hex::encode(Sha256::digest(task_name.as_bytes()));
        format!("{}-{}", readable, &digest[..8])
    }

    fn io_err(&self, path: &Path, source: std::io::Error) -> StateError {
        StateError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl PluginStateReader for FileStateStore {
    fn read(&self) -> Result<Option<Snapshot>, StateError> {
        Ok(self.current.lock().map_err(|_| StateError::Poisoned)?.clone())
    }
}

impl PluginStateWriter for FileStateStore {
    fn write(&self, snapshot: Snapshot) -> Result<(), StateError> {
        if let Some(parent) = self.staged_path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_err(parent, e))?;
        }

        // Write-then-rename keeps the staged file whole if we crash mid-write
        let tmp = self.staged_path.with_extension("next.tmp");
        fs::write(&tmp, snapshot.as_bytes()).map_err(|e| self.io_err(&tmp, e))?;
        fs::rename(&tmp, &self.staged_path).map_err(|e| self.io_err(&self.staged_path, e))?;

        debug!("Staged plugin state at {}", self.staged_path.display());
        Ok(())
    }
}

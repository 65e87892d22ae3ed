//! Persisted session position.
//!
//! A snapshot is written after every acknowledged step once the staging area
//! has been erased, so a restarted process can pick the transfer up at the
//! block it stopped on instead of erasing again.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::payload::CodeBlockSource;
use crate::protocol::AccessKey;
use crate::state::Phase;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid snapshot: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Cannot serialize snapshot: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Resumable position of an update session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// CRC-32 of the image being transferred.
    pub fingerprint: u32,
    pub block_size: usize,
    pub total_blocks: usize,
    pub phase: Phase,
    pub current_index: usize,
    pub access_key: AccessKey,
}

impl SessionSnapshot {
    /// Why this snapshot cannot be resumed against `source`, if it cannot.
    pub fn mismatch(&self, source: &dyn CodeBlockSource) -> Option<String> {
        if self.fingerprint != source.fingerprint() {
            return Some(format!(
                "image fingerprint 0x{:08X} does not match snapshot 0x{:08X}",
                source.fingerprint(),
                self.fingerprint
            ));
        }
        if self.block_size != source.block_size() {
            return Some(format!(
                "block size {} does not match snapshot {}",
                source.block_size(),
                self.block_size
            ));
        }
        if self.total_blocks != source.total_blocks() {
            return Some(format!(
                "block count {} does not match snapshot {}",
                source.total_blocks(),
                self.total_blocks
            ));
        }
        if self.access_key.value() == 0 {
            return Some("snapshot carries no access key".to_string());
        }
        if !self.phase.is_resumable() {
            return Some(format!("phase {} cannot be resumed", self.phase));
        }
        if self.current_index >= self.total_blocks {
            return Some(format!(
                "index {} is past the last block",
                self.current_index
            ));
        }
        None
    }
}

/// Storage for the single persisted session.
pub trait SnapshotStore: Send {
    fn load(&self) -> Result<Option<SessionSnapshot>, SnapshotError>;
    fn save(&self, snapshot: &SessionSnapshot) -> Result<(), SnapshotError>;
    fn clear(&self) -> Result<(), SnapshotError>;
}

/// TOML file on disk.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self) -> Result<Option<SessionSnapshot>, SnapshotError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(toml::from_str(&content)?))
    }

    fn save(&self, snapshot: &SessionSnapshot) -> Result<(), SnapshotError> {
        let content = toml::to_string_pretty(snapshot)?;
        // Write-then-rename so a crash never leaves a half-written file.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(
            path = %self.path.display(),
            phase = %snapshot.phase,
            index = snapshot.current_index,
            "Snapshot saved"
        );
        Ok(())
    }

    fn clear(&self) -> Result<(), SnapshotError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    slot: Arc<Mutex<Option<SessionSnapshot>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current content without going through the trait.
    pub fn get(&self) -> Option<SessionSnapshot> {
        self.slot.lock().unwrap().clone()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self) -> Result<Option<SessionSnapshot>, SnapshotError> {
        Ok(self.get())
    }

    fn save(&self, snapshot: &SessionSnapshot) -> Result<(), SnapshotError> {
        *self.slot.lock().unwrap() = Some(snapshot.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), SnapshotError> {
        *self.slot.lock().unwrap() = None;
        Ok(())
    }
}

//! Snapshot persistence.
//!
//! One `SnapshotStore` interface with atomic write semantics replaces
//! per-subsystem ad hoc read/backup/write sequences. The file store writes
//! every document to a temp file and renames it into place, so a crash
//! mid-write never leaves a partial snapshot behind. Large opaque state
//! (model weights etc.) lives in a separate raw artifact referenced from
//! the snapshot document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::registry::ComponentStatus;
use crate::types::{Error, Result};

// =============================================================================
// Persisted documents
// =============================================================================

/// Per-component snapshot document, written at sleep time and consumed at
/// wake time.
///
/// Invariant: a snapshot for a critical component must never exist
/// (`is_critical` is persisted as a tripwire for manual inspection).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub component_name: String,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub previous_status: ComponentStatus,
    pub config: Map<String, Value>,
    pub stats: Map<String, Value>,
    pub is_critical: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serialized_state_ref: Option<String>,
}

/// Registry-wide index document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryIndex {
    pub version: u32,
    pub last_updated: DateTime<Utc>,
    pub components: HashMap<String, IndexEntry>,
    pub statistics: IndexStatistics,
}

/// One component's line in the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub status: ComponentStatus,
    pub is_critical: bool,
    pub dependencies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sleep_time: Option<DateTime<Utc>>,
}

/// Aggregate counts in the index.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IndexStatistics {
    pub total: usize,
    pub active: usize,
    pub sleeping: usize,
    pub critical: usize,
}

pub const INDEX_VERSION: u32 = 1;

// =============================================================================
// Store interface
// =============================================================================

/// Durable storage for snapshots, state artifacts, and the registry index.
///
/// Backing store choice (file, embedded KV, database) is behind this seam;
/// the orchestrator only requires atomic per-document writes.
pub trait SnapshotStore: Send + Sync + fmt::Debug {
    fn save(&self, snapshot: &Snapshot) -> Result<()>;
    fn load(&self, component: &str) -> Result<Option<Snapshot>>;
    fn delete(&self, component: &str) -> Result<()>;
    /// Move a consumed snapshot aside instead of deleting it.
    fn archive(&self, component: &str) -> Result<()>;
    /// Persist raw serialized state; returns the reference to store in the
    /// snapshot document.
    fn save_state_artifact(&self, component: &str, bytes: &[u8]) -> Result<String>;
    fn load_state_artifact(&self, state_ref: &str) -> Result<Vec<u8>>;
    fn save_index(&self, index: &RegistryIndex) -> Result<()>;
    fn load_index(&self) -> Result<Option<RegistryIndex>>;
}

// =============================================================================
// File store
// =============================================================================

/// File-backed store: `<root>/<name>.snapshot.json`, `<root>/<name>.state.bin`,
/// `<root>/index.json`, archives under `<root>/archive/`.
#[derive(Debug)]
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("archive"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshot_path(&self, component: &str) -> PathBuf {
        self.root.join(format!("{component}.snapshot.json"))
    }

    fn state_path(&self, component: &str) -> PathBuf {
        self.root.join(format!("{component}.state.bin"))
    }

    /// Write-to-temp then rename; rename is atomic on the same filesystem.
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn remove_if_exists(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        self.write_atomic(&self.snapshot_path(&snapshot.component_name), &bytes)
    }

    fn load(&self, component: &str) -> Result<Option<Snapshot>> {
        let path = self.snapshot_path(component);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn delete(&self, component: &str) -> Result<()> {
        Self::remove_if_exists(&self.snapshot_path(component))?;
        Self::remove_if_exists(&self.state_path(component))
    }

    fn archive(&self, component: &str) -> Result<()> {
        let from = self.snapshot_path(component);
        if !from.exists() {
            return Ok(());
        }
        let archived = self
            .root
            .join("archive")
            .join(format!("{component}.{}.snapshot.json", uuid::Uuid::new_v4()));
        fs::rename(&from, &archived)?;
        // The live component owns its state again; the artifact is spent.
        Self::remove_if_exists(&self.state_path(component))
    }

    fn save_state_artifact(&self, component: &str, bytes: &[u8]) -> Result<String> {
        let path = self.state_path(component);
        self.write_atomic(&path, bytes)?;
        Ok(format!("{component}.state.bin"))
    }

    fn load_state_artifact(&self, state_ref: &str) -> Result<Vec<u8>> {
        let path = self.root.join(state_ref);
        fs::read(&path).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                Error::not_found(format!("state artifact missing: {state_ref}"))
            } else {
                err.into()
            }
        })
    }

    fn save_index(&self, index: &RegistryIndex) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(index)?;
        self.write_atomic(&self.root.join("index.json"), &bytes)
    }

    fn load_index(&self) -> Result<Option<RegistryIndex>> {
        let path = self.root.join("index.json");
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

// =============================================================================
// Memory store
// =============================================================================

/// In-memory store for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<String, Snapshot>>,
    artifacts: Mutex<HashMap<String, Vec<u8>>>,
    archived: Mutex<Vec<Snapshot>>,
    index: Mutex<Option<RegistryIndex>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot_count(&self) -> usize {
        lock(&self.snapshots).len()
    }

    pub fn archived_count(&self) -> usize {
        lock(&self.archived).len()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        lock(&self.snapshots).insert(snapshot.component_name.clone(), snapshot.clone());
        Ok(())
    }

    fn load(&self, component: &str) -> Result<Option<Snapshot>> {
        Ok(lock(&self.snapshots).get(component).cloned())
    }

    fn delete(&self, component: &str) -> Result<()> {
        lock(&self.snapshots).remove(component);
        lock(&self.artifacts).remove(component);
        Ok(())
    }

    fn archive(&self, component: &str) -> Result<()> {
        if let Some(snapshot) = lock(&self.snapshots).remove(component) {
            lock(&self.archived).push(snapshot);
        }
        lock(&self.artifacts).remove(component);
        Ok(())
    }

    fn save_state_artifact(&self, component: &str, bytes: &[u8]) -> Result<String> {
        lock(&self.artifacts).insert(component.to_string(), bytes.to_vec());
        Ok(component.to_string())
    }

    fn load_state_artifact(&self, state_ref: &str) -> Result<Vec<u8>> {
        lock(&self.artifacts)
            .get(state_ref)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("state artifact missing: {state_ref}")))
    }

    fn save_index(&self, index: &RegistryIndex) -> Result<()> {
        *lock(&self.index) = Some(index.clone());
        Ok(())
    }

    fn load_index(&self) -> Result<Option<RegistryIndex>> {
        Ok(lock(&self.index).clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

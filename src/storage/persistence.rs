//! File-backed durable store for the stand tracker

use super::DurableStore;
use crate::core::{Result, TrackerError};
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

pub const STATE_FILE_NAME: &str = "tracker-state.json";
pub const LOCK_FILE_NAME: &str = "tracker-state.lock";

// ============================================================================
// File Store
// ============================================================================

/// Keeps every key in one JSON object on disk.
///
/// Nothing is cached: every read loads the file under a shared lock and every
/// mutation reloads, applies and rewrites it under an exclusive lock, so
/// several processes can share one data directory. Writes go through a temp
/// file in the same directory followed by an atomic rename, so a crash leaves
/// either the old or the new state and never a torn file.
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileStore {
    /// Open (or create) the store inside `data_dir`.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir).map_err(|e| {
            TrackerError::Storage(format!(
                "Failed to create data directory '{}': {}",
                data_dir.display(),
                e
            ))
        })?;

        let store = Self {
            path: data_dir.join(STATE_FILE_NAME),
            lock_path: data_dir.join(LOCK_FILE_NAME),
        };
        let keys = store.read(|entries| entries.len())?;
        debug!(path = %store.path.display(), keys, "file store opened");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_file(&self) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| {
                TrackerError::Storage(format!(
                    "Failed to open lock file '{}': {}",
                    self.lock_path.display(),
                    e
                ))
            })
    }

    fn read<T, F>(&self, view: F) -> Result<T>
    where
        F: FnOnce(&BTreeMap<String, String>) -> T,
    {
        let lock = self.lock_file()?;
        FileExt::lock_shared(&lock)
            .map_err(|e| TrackerError::Storage(format!("Failed to lock state file: {}", e)))?;
        let entries = load_entries(&self.path);
        // The lock is released when `lock` is closed.
        drop(lock);
        Ok(view(&entries?))
    }

    /// Reload, apply, rewrite. `apply` returns whether anything changed.
    fn mutate<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<String, String>) -> bool,
    {
        let lock = self.lock_file()?;
        FileExt::lock_exclusive(&lock)
            .map_err(|e| TrackerError::Storage(format!("Failed to lock state file: {}", e)))?;
        let mut entries = load_entries(&self.path)?;
        if apply(&mut entries) {
            write_entries(&self.path, &entries)?;
        }
        drop(lock);
        Ok(())
    }
}

fn load_entries(path: &Path) -> Result<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }

    let file = File::open(path).map_err(|e| {
        TrackerError::Storage(format!("Failed to open state file '{}': {}", path.display(), e))
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| {
        warn!(path = %path.display(), error = %e, "state file is not a JSON object");
        TrackerError::Serialization(format!(
            "Failed to parse state file '{}': {}",
            path.display(),
            e
        ))
    })
}

fn write_entries(path: &Path, entries: &BTreeMap<String, String>) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| TrackerError::Storage("State file has no parent directory".to_string()))?;

    let temp = NamedTempFile::new_in(dir)
        .map_err(|e| TrackerError::Storage(format!("Failed to create temp file: {}", e)))?;
    {
        let mut writer = BufWriter::new(temp.as_file());
        serde_json::to_writer_pretty(&mut writer, entries)?;
        writer
            .flush()
            .map_err(|e| TrackerError::Storage(format!("Failed to flush state file: {}", e)))?;
    }
    temp.as_file()
        .sync_all()
        .map_err(|e| TrackerError::Storage(format!("Failed to sync state file: {}", e)))?;
    temp.persist(path)
        .map_err(|e| TrackerError::Storage(format!("Failed to rename state file: {}", e.error)))?;
    Ok(())
}

impl DurableStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.read(|entries| entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.mutate(|entries| {
            entries.insert(key.to_string(), value.to_string()).as_deref() != Some(value)
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.mutate(|entries| entries.remove(key).is_some())
    }

    fn clear(&self) -> Result<()> {
        self.mutate(|entries| {
            entries.clear();
            true
        })
    }

    fn keys(&self) -> Result<Vec<String>> {
        self.read(|entries| entries.keys().cloned().collect())
    }
}

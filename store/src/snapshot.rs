//! File-based snapshots of the vote table
//!
//! The store lives in memory; snapshots are written off the request path
//! (e.g. on a timer or at election close) and loaded on startup.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),
}

/// Writes each snapshot twice: JSON for inspection, bincode for fast loads.
pub struct SnapshotStore {
    data_dir: PathBuf,
}

impl SnapshotStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let data_dir = path.as_ref().to_path_buf();
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir)?;
        }
        Ok(Self { data_dir })
    }

    pub fn save<T: Serialize>(&self, name: &str, data: &T) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(data)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        fs::write(self.data_dir.join(format!("{}.json", name)), json)?;

        let bin = bincode::serialize(data).map_err(|e| StoreError::Serialization(e.to_string()))?;
        fs::write(self.data_dir.join(format!("{}.bin", name)), bin)?;

        Ok(())
    }

    /// Load a snapshot, preferring the bincode copy.
    pub fn load<T: for<'de> Deserialize<'de>>(&self, name: &str) -> Result<T, StoreError> {
        let bin_path = self.data_dir.join(format!("{}.bin", name));
        if bin_path.exists() {
            let data = fs::read(&bin_path)?;
            return bincode::deserialize(&data)
                .map_err(|e| StoreError::Serialization(e.to_string()));
        }

        let json_path = self.data_dir.join(format!("{}.json", name));
        if json_path.exists() {
            let data = fs::read_to_string(&json_path)?;
            return serde_json::from_str(&data)
                .map_err(|e| StoreError::Serialization(e.to_string()));
        }

        Err(StoreError::SnapshotNotFound(name.to_string()))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.data_dir.join(format!("{}.bin", name)).exists()
            || self.data_dir.join(format!("{}.json", name)).exists()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

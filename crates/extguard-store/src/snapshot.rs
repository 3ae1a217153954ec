use crate::{fsync_dir, StoreError};
use extguard_schema::ClusterExtension;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

const SNAPSHOT_FILE: &str = "clusterextensions.json";

/// Durable image of a store: every live object plus the revision counter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredState {
    pub revision: u64,
    pub items: Vec<ClusterExtension>,
    /// blake3 checksum of the state with this field cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl StoredState {
    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

/// Snapshot file inside a data directory, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    dir: PathBuf,
}

impl SnapshotFile {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    pub fn save(&self, state: &StoredState) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let mut with_checksum = state.clone();
        with_checksum.checksum = Some(state.compute_checksum()?);
        let content = serde_json::to_string_pretty(&with_checksum)?;

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path()).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&self.dir)?;
        Ok(())
    }

    /// Load the last saved state, or `None` for a fresh directory.
    pub fn load(&self) -> Result<Option<StoredState>, StoreError> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let state: StoredState = serde_json::from_str(&content)?;

        if let Some(ref expected) = state.checksum {
            let actual = state.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    path: path.display().to_string(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(Some(state))
    }
}

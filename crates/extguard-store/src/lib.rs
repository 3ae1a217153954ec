//! Object store contract and reference store for extguard.
//!
//! This crate provides the storage layer the guard sits in front of: the
//! `ExtensionStore` trait (atomic single-object create/update with
//! optimistic-concurrency tokens, full list, resumable ordered watch), the
//! `WatchStream` change feed, and `MemoryStore`, an in-process store with an
//! optional durable snapshot guarded by a `DataDirLock`.

pub mod lock;
pub mod memory;
pub mod snapshot;
pub mod watch;

pub use lock::DataDirLock;
pub use memory::{MemoryStore, DEFAULT_HISTORY_LIMIT};
pub use snapshot::{SnapshotFile, StoredState};
pub use watch::{EventType, Next, WatchEvent, WatchStream};

use extguard_schema::{ClusterExtension, PackageName, ResourceName, ResourceVersion, SchemaError};
use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid object: {0}")]
    Invalid(#[from] SchemaError),
    #[error("ClusterExtension \"{0}\" already exists")]
    AlreadyExists(ResourceName),
    #[error("ClusterExtension \"{0}\" not found")]
    NotFound(ResourceName),
    #[error("version conflict on ClusterExtension \"{name}\": expected {expected}, found {actual}")]
    VersionConflict {
        name: ResourceName,
        expected: ResourceVersion,
        actual: ResourceVersion,
    },
    #[error("Package \"{package}\" is already installed via ClusterExtension \"{owner}\"")]
    IdentifierConflict {
        package: PackageName,
        owner: ResourceName,
    },
    #[error("watch from revision {requested} expired, oldest retained event is {oldest}")]
    Expired { requested: u64, oldest: u64 },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("integrity check failed for snapshot '{path}': expected {expected}, got {actual}")]
    IntegrityFailure {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
}

impl StoreError {
    /// Transient failures that a caller may retry unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Io(_))
    }
}

/// A consistent full listing together with the revision it was taken at.
///
/// Passing `revision` to [`ExtensionStore::watch`] resumes the change feed
/// exactly after this listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub revision: u64,
    pub items: Vec<ClusterExtension>,
}

/// The authoritative object store the guard delegates every write to.
///
/// Implementations must make each single-object operation atomic and assign
/// a strictly increasing `resourceVersion` on every successful write.
pub trait ExtensionStore: Send + Sync {
    fn get(&self, name: &ResourceName) -> Result<ClusterExtension, StoreError>;

    fn list(&self) -> Result<Snapshot, StoreError>;

    /// Insert a new object. Fails with `AlreadyExists` if the name is taken,
    /// or `IdentifierConflict` when the store enforces package uniqueness.
    fn create(&self, obj: &ClusterExtension) -> Result<ClusterExtension, StoreError>;

    /// Replace an object, provided its current version equals `expected`.
    fn update(
        &self,
        obj: &ClusterExtension,
        expected: ResourceVersion,
    ) -> Result<ClusterExtension, StoreError>;

    /// Remove an object and return its last committed state.
    fn delete(&self, name: &ResourceName) -> Result<ClusterExtension, StoreError>;

    /// Ordered change feed of every write after revision `since`.
    ///
    /// Fails with `Expired` when events after `since` are no longer retained;
    /// the caller must re-list and watch from the new snapshot.
    fn watch(&self, since: u64) -> Result<WatchStream, StoreError>;

    /// Whether `create`/`update` reject a second live claimant of a package
    /// at commit time.
    fn enforces_unique_packages(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_conflict_display_names_owner() {
        let e = StoreError::IdentifierConflict {
            package: "package1".into(),
            owner: "test-extension-first".into(),
        };
        assert_eq!(
            e.to_string(),
            "Package \"package1\" is already installed via ClusterExtension \"test-extension-first\""
        );
    }

    #[test]
    fn version_conflict_display() {
        let e = StoreError::VersionConflict {
            name: "ext".into(),
            expected: ResourceVersion::new(2),
            actual: ResourceVersion::new(5),
        };
        let msg = e.to_string();
        assert!(msg.contains("ext"));
        assert!(msg.contains('2'));
        assert!(msg.contains('5'));
    }

    #[test]
    fn expired_display() {
        let e = StoreError::Expired {
            requested: 3,
            oldest: 10,
        };
        assert!(e.to_string().contains("10"));
    }

    #[test]
    fn transient_classification() {
        assert!(StoreError::Unavailable("down".to_owned()).is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
        assert!(!StoreError::AlreadyExists("x".into()).is_transient());
    }
}

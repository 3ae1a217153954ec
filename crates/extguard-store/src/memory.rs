use crate::lock::DataDirLock;
use crate::snapshot::{SnapshotFile, StoredState};
use crate::watch::{EventType, WatchEvent, WatchStream};
use crate::{ExtensionStore, Snapshot, StoreError};
use extguard_schema::{generated_name, ClusterExtension, ResourceName, ResourceVersion};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Number of committed events kept for resuming watches.
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;
const GENERATE_NAME_ATTEMPTS: u64 = 8;

struct Inner {
    objects: BTreeMap<ResourceName, ClusterExtension>,
    revision: u64,
    history: VecDeque<WatchEvent>,
    watchers: Vec<Sender<WatchEvent>>,
}

struct Durability {
    file: SnapshotFile,
    _lock: DataDirLock,
}

/// In-process store with atomic single-object writes and a resumable watch.
///
/// All operations serialize on one mutex, so each create/update/delete is
/// atomic and events are produced in commit order. Package uniqueness is only
/// enforced at commit when built with [`MemoryStore::with_unique_packages`];
/// otherwise the store behaves like a plain object store and two names may
/// claim the same package.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unique_packages: bool,
    history_limit: usize,
    available: AtomicBool,
    durability: Option<Durability>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                revision: 0,
                history: VecDeque::new(),
                watchers: Vec::new(),
            }),
            unique_packages: false,
            history_limit: DEFAULT_HISTORY_LIMIT,
            available: AtomicBool::new(true),
            durability: None,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a durable store in `dir`, restoring the last saved snapshot.
    ///
    /// The directory is locked for the lifetime of the store. Event history
    /// does not survive a restart: watches must start from the loaded revision.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        let lock = DataDirLock::try_acquire(&dir.join("store.lock"))?.ok_or_else(|| {
            StoreError::LockFailed(format!("{} is in use by another process", dir.display()))
        })?;
        let file = SnapshotFile::new(dir);
        let store = Self::default();
        if let Some(state) = file.load()? {
            info!(
                "restored {} objects at revision {} from {}",
                state.items.len(),
                state.revision,
                file.path().display()
            );
            let mut inner = store.lock()?;
            inner.revision = state.revision;
            inner.objects = state
                .items
                .into_iter()
                .map(|obj| (obj.name().clone(), obj))
                .collect();
        }
        Ok(Self {
            durability: Some(Durability { file, _lock: lock }),
            ..store
        })
    }

    /// Reject a second live claimant of a package at commit time.
    #[must_use]
    pub fn with_unique_packages(mut self, enabled: bool) -> Self {
        self.unique_packages = enabled;
        self
    }

    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Simulate an outage: while unavailable every call fails with
    /// `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// End every open watch stream, as a dropped connection would.
    pub fn disconnect_watchers(&self) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        debug!("disconnecting {} watchers", inner.watchers.len());
        inner.watchers.clear();
        Ok(())
    }

    pub fn revision(&self) -> Result<u64, StoreError> {
        Ok(self.lock()?.revision)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("mutex poisoned: {e}")))
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store is offline".to_owned()))
        }
    }

    /// Find a different live object already holding `obj`'s package.
    fn package_holder<'a>(
        inner: &'a Inner,
        obj: &ClusterExtension,
    ) -> Option<&'a ClusterExtension> {
        inner
            .objects
            .values()
            .find(|o| o.package() == obj.package() && o.name() != obj.name())
    }

    fn persist(&self, inner: &Inner) -> Result<(), StoreError> {
        if let Some(ref d) = self.durability {
            d.file.save(&StoredState {
                revision: inner.revision,
                items: inner.objects.values().cloned().collect(),
                checksum: None,
            })?;
        }
        Ok(())
    }

    fn publish(&self, inner: &mut Inner, kind: EventType, object: ClusterExtension) {
        let event = WatchEvent {
            kind,
            object,
            revision: inner.revision,
        };
        inner.watchers.retain(|tx| tx.send(event.clone()).is_ok());
        inner.history.push_back(event);
        while inner.history.len() > self.history_limit {
            inner.history.pop_front();
        }
    }

    fn resolve_name(inner: &Inner, obj: &ClusterExtension) -> Result<ResourceName, StoreError> {
        if !obj.name().is_empty() {
            return Ok(obj.name().clone());
        }
        let prefix = obj.metadata.generate_name.as_deref().unwrap_or_default();
        for attempt in 0..GENERATE_NAME_ATTEMPTS {
            let candidate = generated_name(prefix, inner.revision + 1 + attempt);
            if !inner.objects.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(StoreError::AlreadyExists(generated_name(prefix, inner.revision + 1)))
    }
}

impl ExtensionStore for MemoryStore {
    fn get(&self, name: &ResourceName) -> Result<ClusterExtension, StoreError> {
        self.check_available()?;
        self.lock()?
            .objects
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.clone()))
    }

    fn list(&self) -> Result<Snapshot, StoreError> {
        self.check_available()?;
        let inner = self.lock()?;
        Ok(Snapshot {
            revision: inner.revision,
            items: inner.objects.values().cloned().collect(),
        })
    }

    fn create(&self, obj: &ClusterExtension) -> Result<ClusterExtension, StoreError> {
        self.check_available()?;
        obj.validate()?;
        let mut inner = self.lock()?;

        let name = Self::resolve_name(&inner, obj)?;
        if inner.objects.contains_key(&name) {
            return Err(StoreError::AlreadyExists(name));
        }
        let mut committed = obj.clone();
        committed.metadata.name = name.clone();
        if self.unique_packages {
            if let Some(holder) = Self::package_holder(&inner, &committed) {
                return Err(StoreError::IdentifierConflict {
                    package: committed.package().clone(),
                    owner: holder.name().clone(),
                });
            }
        }

        inner.revision += 1;
        committed.metadata.resource_version = Some(ResourceVersion::new(inner.revision));
        committed.metadata.creation_timestamp = Some(chrono::Utc::now().to_rfc3339());
        inner.objects.insert(name.clone(), committed.clone());
        if let Err(e) = self.persist(&inner) {
            inner.objects.remove(&name);
            inner.revision -= 1;
            return Err(e);
        }
        self.publish(&mut inner, EventType::Added, committed.clone());
        debug!("created {name} (package {}, rev {})", committed.package(), inner.revision);
        Ok(committed)
    }

    fn update(
        &self,
        obj: &ClusterExtension,
        expected: ResourceVersion,
    ) -> Result<ClusterExtension, StoreError> {
        self.check_available()?;
        obj.validate()?;
        let mut inner = self.lock()?;

        let name = obj.name().clone();
        let current = inner
            .objects
            .get(&name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;
        let actual = current.version().unwrap_or(ResourceVersion::new(0));
        if actual != expected {
            return Err(StoreError::VersionConflict {
                name,
                expected,
                actual,
            });
        }
        if self.unique_packages {
            if let Some(holder) = Self::package_holder(&inner, obj) {
                return Err(StoreError::IdentifierConflict {
                    package: obj.package().clone(),
                    owner: holder.name().clone(),
                });
            }
        }

        inner.revision += 1;
        let mut committed = obj.clone();
        committed.metadata.generate_name = current.metadata.generate_name.clone();
        committed.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        committed.metadata.resource_version = Some(ResourceVersion::new(inner.revision));
        inner.objects.insert(name.clone(), committed.clone());
        if let Err(e) = self.persist(&inner) {
            inner.objects.insert(name, current);
            inner.revision -= 1;
            return Err(e);
        }
        self.publish(&mut inner, EventType::Modified, committed.clone());
        debug!("updated {name} (package {}, rev {})", committed.package(), inner.revision);
        Ok(committed)
    }

    fn delete(&self, name: &ResourceName) -> Result<ClusterExtension, StoreError> {
        self.check_available()?;
        let mut inner = self.lock()?;
        let removed = inner
            .objects
            .remove(name)
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;
        inner.revision += 1;
        if let Err(e) = self.persist(&inner) {
            inner.objects.insert(name.clone(), removed);
            inner.revision -= 1;
            return Err(e);
        }
        self.publish(&mut inner, EventType::Deleted, removed.clone());
        debug!("deleted {name} (rev {})", inner.revision);
        Ok(removed)
    }

    fn watch(&self, since: u64) -> Result<WatchStream, StoreError> {
        self.check_available()?;
        let mut inner = self.lock()?;
        if since < inner.revision {
            let oldest = inner.history.front().map_or(inner.revision + 1, |e| e.revision);
            if oldest > since + 1 {
                return Err(StoreError::Expired {
                    requested: since,
                    oldest,
                });
            }
        }
        let (tx, rx) = mpsc::channel();
        for event in inner.history.iter().filter(|e| e.revision > since) {
            // The receiver is still in scope, so this cannot fail.
            let _ = tx.send(event.clone());
        }
        inner.watchers.push(tx);
        Ok(WatchStream::new(rx))
    }

    fn enforces_unique_packages(&self) -> bool {
        self.unique_packages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::Next;
    use std::time::Duration;

    const POLL: Duration = Duration::from_millis(50);

    fn next_event(stream: &WatchStream) -> WatchEvent {
        match stream.next_timeout(POLL) {
            Next::Event(e) => e,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn create_assigns_increasing_versions() {
        let store = MemoryStore::new();
        let a = store.create(&ClusterExtension::new("a", "p1")).unwrap();
        let b = store.create(&ClusterExtension::new("b", "p2")).unwrap();
        assert!(a.version().unwrap() < b.version().unwrap());
        assert!(a.metadata.creation_timestamp.is_some());
    }

    #[test]
    fn create_duplicate_name_fails() {
        let store = MemoryStore::new();
        store.create(&ClusterExtension::new("a", "p1")).unwrap();
        assert!(matches!(
            store.create(&ClusterExtension::new("a", "p2")),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn plain_store_accepts_duplicate_packages() {
        let store = MemoryStore::new();
        store.create(&ClusterExtension::new("a", "p1")).unwrap();
        assert!(store.create(&ClusterExtension::new("b", "p1")).is_ok());
    }

    #[test]
    fn unique_store_rejects_duplicate_packages() {
        let store = MemoryStore::new().with_unique_packages(true);
        store.create(&ClusterExtension::new("a", "p1")).unwrap();
        match store.create(&ClusterExtension::new("b", "p1")) {
            Err(StoreError::IdentifierConflict { package, owner }) => {
                assert_eq!(package, "p1");
                assert_eq!(owner, "a");
            }
            other => panic!("expected IdentifierConflict, got {other:?}"),
        }
    }

    #[test]
    fn unique_store_allows_self_update() {
        let store = MemoryStore::new().with_unique_packages(true);
        let a = store.create(&ClusterExtension::new("a", "p1")).unwrap();
        assert!(store.update(&a, a.version().unwrap()).is_ok());
    }

    #[test]
    fn update_with_stale_version_fails() {
        let store = MemoryStore::new();
        let a = store.create(&ClusterExtension::new("a", "p1")).unwrap();
        let v1 = a.version().unwrap();
        store.update(&ClusterExtension::new("a", "p2"), v1).unwrap();
        assert!(matches!(
            store.update(&ClusterExtension::new("a", "p3"), v1),
            Err(StoreError::VersionConflict { .. })
        ));
    }

    #[test]
    fn update_preserves_creation_timestamp() {
        let store = MemoryStore::new();
        let a = store.create(&ClusterExtension::new("a", "p1")).unwrap();
        let b = store
            .update(&ClusterExtension::new("a", "p2"), a.version().unwrap())
            .unwrap();
        assert_eq!(a.metadata.creation_timestamp, b.metadata.creation_timestamp);
    }

    #[test]
    fn update_and_delete_missing_fail() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.update(&ClusterExtension::new("x", "p1"), ResourceVersion::new(1)),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.delete(&"x".into()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn generate_name_assigns_fresh_name() {
        let store = MemoryStore::new();
        let a = store
            .create(&ClusterExtension::with_generate_name("test-extension-", "p1"))
            .unwrap();
        let b = store
            .create(&ClusterExtension::with_generate_name("test-extension-", "p2"))
            .unwrap();
        assert!(a.name().starts_with("test-extension-"));
        assert_ne!(a.name(), b.name());
    }

    #[test]
    fn watch_replays_history_after_revision() {
        let store = MemoryStore::new();
        store.create(&ClusterExtension::new("a", "p1")).unwrap();
        let snap = store.list().unwrap();
        store.create(&ClusterExtension::new("b", "p2")).unwrap();
        store.delete(&"a".into()).unwrap();

        let stream = store.watch(snap.revision).unwrap();
        let e1 = next_event(&stream);
        assert_eq!(e1.kind, EventType::Added);
        assert_eq!(e1.object.name(), "b");
        let e2 = next_event(&stream);
        assert_eq!(e2.kind, EventType::Deleted);
        assert_eq!(e2.object.name(), "a");
        assert!(e2.revision > e1.revision);
    }

    #[test]
    fn watch_receives_live_events() {
        let store = MemoryStore::new();
        let stream = store.watch(0).unwrap();
        store.create(&ClusterExtension::new("a", "p1")).unwrap();
        assert_eq!(next_event(&stream).object.name(), "a");
    }

    #[test]
    fn watch_from_compacted_revision_expires() {
        let store = MemoryStore::new().with_history_limit(2);
        for i in 0..5 {
            store
                .create(&ClusterExtension::new(format!("e{i}"), format!("p{i}")))
                .unwrap();
        }
        assert!(matches!(store.watch(0), Err(StoreError::Expired { .. })));
        assert!(store.watch(3).is_ok());
    }

    #[test]
    fn disconnect_closes_streams() {
        let store = MemoryStore::new();
        let stream = store.watch(0).unwrap();
        store.disconnect_watchers().unwrap();
        assert!(matches!(stream.next_timeout(POLL), Next::Closed));
    }

    #[test]
    fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(store.list(), Err(StoreError::Unavailable(_))));
        assert!(matches!(
            store.create(&ClusterExtension::new("a", "p1")),
            Err(StoreError::Unavailable(_))
        ));
        store.set_available(true);
        assert!(store.list().is_ok());
    }

    #[test]
    fn durable_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = MemoryStore::open(dir.path()).unwrap();
            store.create(&ClusterExtension::new("a", "p1")).unwrap();
            store.create(&ClusterExtension::new("b", "p2")).unwrap();
            store.delete(&"b".into()).unwrap();
        }
        let store = MemoryStore::open(dir.path()).unwrap();
        let snap = store.list().unwrap();
        assert_eq!(snap.revision, 3);
        assert_eq!(snap.items.len(), 1);
        assert_eq!(snap.items[0].package(), "p1");
        let c = store.create(&ClusterExtension::new("c", "p3")).unwrap();
        assert_eq!(c.version(), Some(ResourceVersion::new(4)));
    }

    #[test]
    fn durable_store_refuses_second_opener() {
        let dir = tempfile::tempdir().unwrap();
        let _first = MemoryStore::open(dir.path()).unwrap();
        assert!(matches!(
            MemoryStore::open(dir.path()),
            Err(StoreError::LockFailed(_))
        ));
    }

    #[test]
    fn reopened_store_expires_old_watch() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = MemoryStore::open(dir.path()).unwrap();
            store.create(&ClusterExtension::new("a", "p1")).unwrap();
        }
        let store = MemoryStore::open(dir.path()).unwrap();
        assert!(matches!(store.watch(0), Err(StoreError::Expired { .. })));
        assert!(store.watch(1).is_ok());
    }
}

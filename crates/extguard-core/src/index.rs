use extguard_schema::{ClusterExtension, PackageName, ResourceName, ResourceVersion};
use extguard_store::{EventType, Snapshot, WatchEvent};
use std::collections::HashMap;
use std::sync::{Condvar, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// The resource currently holding a package, as last seen by the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub name: ResourceName,
    pub version: ResourceVersion,
}

#[derive(Debug, Clone)]
struct Claim {
    package: PackageName,
    version: ResourceVersion,
}

#[derive(Debug, Default)]
struct IndexState {
    by_package: HashMap<PackageName, Owner>,
    by_name: HashMap<ResourceName, Claim>,
    revision: u64,
    stale: bool,
}

impl IndexState {
    /// Record `name` as holding `claim.package`. A package already held by a
    /// different live name keeps its earlier owner.
    fn insert(&mut self, name: &ResourceName, claim: Claim) {
        if let Some(previous) = self.by_name.insert(name.clone(), claim.clone()) {
            if previous.package != claim.package {
                self.release(&previous.package, name);
            }
        }
        let holder = self
            .by_package
            .get(&claim.package)
            .filter(|o| o.name != *name)
            .map(|o| o.name.clone());
        if let Some(existing) = holder {
            warn!(
                "package {} is held by both {existing} and {name}; keeping the earlier owner",
                claim.package
            );
        } else {
            let owner = Owner {
                name: name.clone(),
                version: claim.version,
            };
            self.by_package.insert(claim.package, owner);
        }
    }

    /// Drop `name`'s hold on `package`, promoting any other holder.
    fn release(&mut self, package: &PackageName, name: &ResourceName) {
        if self.by_package.get(package).is_some_and(|o| o.name == *name) {
            self.by_package.remove(package);
            let successor = self
                .by_name
                .iter()
                .filter(|(n, c)| c.package == *package && *n != name)
                .min_by_key(|(_, c)| c.version);
            if let Some((n, c)) = successor {
                let owner = Owner {
                    name: n.clone(),
                    version: c.version,
                };
                self.by_package.insert(package.clone(), owner);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Progress {
    revision: u64,
    synced: bool,
}

/// Derived, non-owning cache of package → owner.
///
/// Only a fast path: it may lag the store by one event-propagation delay and
/// is never the final word on a claim. Mutated exclusively through
/// [`apply`](Self::apply), [`rebuild`](Self::rebuild) and
/// [`mark_stale`](Self::mark_stale). Starts stale until the first rebuild.
pub struct UniquenessIndex {
    state: RwLock<IndexState>,
    progress: Mutex<Progress>,
    advanced: Condvar,
}

impl Default for UniquenessIndex {
    fn default() -> Self {
        Self {
            state: RwLock::new(IndexState {
                stale: true,
                ..IndexState::default()
            }),
            progress: Mutex::new(Progress::default()),
            advanced: Condvar::new(),
        }
    }
}

impl UniquenessIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, package: &PackageName) -> Option<Owner> {
        self.read().by_package.get(package).cloned()
    }

    /// Apply one watch event. Events must arrive in store order; an event not
    /// newer than the index revision is a replay and is ignored.
    ///
    /// Returns whether the event changed the index.
    pub fn apply(&self, event: &WatchEvent) -> bool {
        let mut state = self.write();
        if event.revision <= state.revision {
            debug!(
                "ignoring {} event for {} at rev {} (index at {})",
                event.kind,
                event.object.name(),
                event.revision,
                state.revision
            );
            return false;
        }
        let name = event.object.name();
        match event.kind {
            EventType::Added | EventType::Modified => {
                let claim = claim_of(&event.object, event.revision);
                state.insert(name, claim);
            }
            EventType::Deleted => {
                if let Some(claim) = state.by_name.remove(name) {
                    state.release(&claim.package, name);
                }
            }
        }
        state.revision = event.revision;
        drop(state);
        self.advance(event.revision, false);
        true
    }

    /// Replace the whole map from a full listing and leave the staleness
    /// window.
    pub fn rebuild(&self, snapshot: &Snapshot) {
        let mut fresh = IndexState {
            revision: snapshot.revision,
            ..IndexState::default()
        };
        let mut items: Vec<&ClusterExtension> = snapshot.items.iter().collect();
        items.sort_by_key(|obj| obj.version());
        for obj in items {
            fresh.insert(obj.name(), claim_of(obj, snapshot.revision));
        }
        debug!(
            "index rebuilt: {} packages at rev {}",
            fresh.by_package.len(),
            snapshot.revision
        );
        *self.write() = fresh;
        self.advance(snapshot.revision, true);
    }

    /// Enter the staleness window: lookups stay answerable, but callers must
    /// not trust a miss until the next rebuild.
    pub fn mark_stale(&self) {
        let mut state = self.write();
        if !state.stale {
            debug!("index marked stale at rev {}", state.revision);
        }
        state.stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.read().stale
    }

    pub fn revision(&self) -> u64 {
        self.read().revision
    }

    pub fn len(&self) -> usize {
        self.read().by_package.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current claims, sorted by package.
    pub fn owners(&self) -> Vec<(PackageName, Owner)> {
        let mut all: Vec<_> = self
            .read()
            .by_package
            .iter()
            .map(|(p, o)| (p.clone(), o.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Block until the index has been rebuilt at least once and has observed
    /// `revision`. Returns `false` on timeout.
    pub fn wait_for_revision(&self, revision: u64, timeout: Duration) -> bool {
        let progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        let (progress, result) = self
            .advanced
            .wait_timeout_while(progress, timeout, |p| !p.synced || p.revision < revision)
            .unwrap_or_else(PoisonError::into_inner);
        drop(progress);
        !result.timed_out()
    }

    /// Block until the first rebuild has happened.
    pub fn wait_synced(&self, timeout: Duration) -> bool {
        self.wait_for_revision(0, timeout)
    }

    fn advance(&self, revision: u64, rebuilt: bool) {
        let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        progress.revision = revision;
        progress.synced |= rebuilt;
        self.advanced.notify_all();
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn claim_of(obj: &ClusterExtension, fallback: u64) -> Claim {
    Claim {
        package: obj.package().clone(),
        version: obj.version().unwrap_or(ResourceVersion::new(fallback)),
    }
}

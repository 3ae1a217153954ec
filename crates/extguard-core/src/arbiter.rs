use crate::claims::ClaimLocks;
use crate::config::GuardConfig;
use crate::index::UniquenessIndex;
use crate::sync::IndexSync;
use crate::validator::{Validator, Verdict};
use crate::GuardError;
use extguard_schema::{ClusterExtension, PackageName, ResourceName, ResourceVersion, SchemaError};
use extguard_store::{ExtensionStore, Snapshot, StoreError};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Single front for every write to `ClusterExtension` objects.
///
/// Each create/update is checked against the [`UniquenessIndex`] first and
/// then committed through one arbitration point: the store's native package
/// check, or the per-package [`ClaimLocks`] with a live re-check of the store
/// right before commit. The index is never updated from here; it converges
/// through the watch feed.
pub struct Arbiter<S: ExtensionStore + ?Sized> {
    store: Arc<S>,
    index: Arc<UniquenessIndex>,
    claims: Arc<ClaimLocks>,
    config: GuardConfig,
    store_arbitrates: bool,
    sync: Option<IndexSync>,
}

impl<S: ExtensionStore + ?Sized + 'static> Arbiter<S> {
    /// Build an arbiter and start its index reflector.
    ///
    /// Waits up to `initial_sync_timeout` for the first full list. If the
    /// store is not reachable yet the arbiter still starts; writes skip the
    /// fast path until the index catches up.
    pub fn start(store: Arc<S>, config: GuardConfig) -> Result<Self, GuardError> {
        let index = Arc::new(UniquenessIndex::new());
        let sync = IndexSync::spawn(Arc::clone(&store), Arc::clone(&index), &config)?;
        if !index.wait_synced(config.initial_sync_timeout()) {
            warn!(
                "index not synced after {:?}; every write will be confirmed against the store",
                config.initial_sync_timeout()
            );
        }
        let mut arbiter = Self::new(store, index, config)?;
        arbiter.sync = Some(sync);
        Ok(arbiter)
    }
}

impl<S: ExtensionStore + ?Sized> Arbiter<S> {
    /// Build an arbiter over an index the caller keeps current.
    pub fn new(
        store: Arc<S>,
        index: Arc<UniquenessIndex>,
        config: GuardConfig,
    ) -> Result<Self, GuardError> {
        let store_arbitrates = config.use_store_arbitration(store.enforces_unique_packages())?;
        debug!(
            "arbitration: {}",
            if store_arbitrates { "store" } else { "local claim locks" }
        );
        Ok(Self {
            store,
            index,
            claims: Arc::new(ClaimLocks::new()),
            config,
            store_arbitrates,
            sync: None,
        })
    }

    /// Share a serialization point with other arbiters over the same store.
    #[must_use]
    pub fn with_claims(mut self, claims: Arc<ClaimLocks>) -> Self {
        self.claims = claims;
        self
    }

    pub fn index(&self) -> &Arc<UniquenessIndex> {
        &self.index
    }

    /// Whether the index reflector is still following the store.
    pub fn is_syncing(&self) -> bool {
        self.sync.as_ref().is_some_and(IndexSync::is_running)
    }

    pub fn get(&self, name: &ResourceName) -> Result<ClusterExtension, GuardError> {
        Ok(self.store.get(name)?)
    }

    pub fn list(&self) -> Result<Snapshot, GuardError> {
        Ok(self.store.list()?)
    }

    pub fn delete(&self, name: &ResourceName) -> Result<ClusterExtension, GuardError> {
        let removed = self.store.delete(name)?;
        info!("deleted {name}, released package {}", removed.package());
        Ok(removed)
    }

    pub fn create(&self, intent: &ClusterExtension) -> Result<ClusterExtension, GuardError> {
        intent.validate()?;
        let package = intent.package();
        self.fast_path(Validator::new(&self.index).validate_create(intent), package)?;

        let committed = if self.store_arbitrates {
            self.store.create(intent)
        } else {
            let _claim = self.claims.acquire(package, self.config.claim_timeout())?;
            self.ensure_unclaimed(package, intent.name())?;
            self.store.create(intent)
        };
        let committed = committed.inspect_err(|e| log_rejection(intent, e))?;
        info!("admitted {} claiming package {package}", committed.name());
        Ok(committed)
    }

    /// Replace an object's spec.
    ///
    /// With `metadata.resourceVersion` set, the write only succeeds against
    /// that exact version. Without it the current version is used, and a
    /// concurrent write in between is retried once against fresh state.
    pub fn update(&self, intent: &ClusterExtension) -> Result<ClusterExtension, GuardError> {
        intent.validate()?;
        if intent.name().is_empty() {
            let reason = "metadata.name is required on update".to_owned();
            return Err(SchemaError::InvalidName(reason).into());
        }
        let committed = match self.try_update(intent) {
            Err(GuardError::StaleView { package }) => {
                debug!("{} changed underneath {package} claim; retrying once", intent.name());
                self.try_update(intent)
            }
            other => other,
        };
        let committed = match committed {
            Err(GuardError::StaleView { .. }) => Err(self.refresh_version_conflict(intent)?),
            other => other,
        }?;
        info!("updated {} to package {}", committed.name(), committed.package());
        Ok(committed)
    }

    /// Authoritative uniqueness pre-check for reconciliation code.
    ///
    /// Returns the live owner of `package` other than `name`, if any.
    pub fn precheck(
        &self,
        package: &PackageName,
        name: &ResourceName,
    ) -> Result<Option<ResourceName>, GuardError> {
        self.live_owner(package, name)
    }

    fn try_update(&self, intent: &ClusterExtension) -> Result<ClusterExtension, GuardError> {
        let current = self.store.get(intent.name())?;
        let pinned = intent.version().is_some();
        let expected = intent
            .version()
            .or(current.version())
            .ok_or_else(|| GuardError::NotFound(intent.name().clone()))?;
        let package = intent.package();

        let verdict = self.fast_path(
            Validator::new(&self.index).validate_update(intent, &current),
            package,
        )?;

        let result = if verdict == Verdict::Unchanged || self.store_arbitrates {
            self.store.update(intent, expected)
        } else {
            let _claim = self.claims.acquire(package, self.config.claim_timeout())?;
            self.ensure_unclaimed(package, intent.name())?;
            self.store.update(intent, expected)
        };

        match result {
            Err(StoreError::VersionConflict { .. }) if !pinned => Err(GuardError::StaleView {
                package: package.clone(),
            }),
            other => other
                .inspect_err(|e| log_rejection(intent, e))
                .map_err(GuardError::from),
        }
    }

    /// Turn a fast-path rejection into a confirmed one, or let the intent
    /// through to arbitration when the index was merely behind.
    fn fast_path(
        &self,
        decision: Result<Verdict, GuardError>,
        package: &PackageName,
    ) -> Result<Verdict, GuardError> {
        match decision {
            Ok(Verdict::Unverified) => {
                debug!("index stale; {package} will be confirmed at commit");
                Ok(Verdict::Unverified)
            }
            Err(GuardError::PackageAlreadyClaimed { owner, .. }) => {
                match self.confirm_claim(package, &owner) {
                    GuardError::StaleView { .. } => {
                        debug!("index names {owner} for {package} but the store disagrees");
                        Ok(Verdict::Unverified)
                    }
                    confirmed => Err(confirmed),
                }
            }
            other => other,
        }
    }

    /// Check the index's owner against the store. Yields the rejection when it
    /// still holds the package, `StaleView` otherwise.
    fn confirm_claim(&self, package: &PackageName, owner: &ResourceName) -> GuardError {
        match self.store.get(owner) {
            Ok(obj) if obj.package() == package => {
                info!("rejecting claim on {package}: held by {owner}");
                GuardError::PackageAlreadyClaimed {
                    package: package.clone(),
                    owner: owner.clone(),
                }
            }
            Ok(_) | Err(StoreError::NotFound(_)) => GuardError::StaleView {
                package: package.clone(),
            },
            Err(e) => e.into(),
        }
    }

    /// Live re-check under the claim slot, immediately before commit.
    fn ensure_unclaimed(
        &self,
        package: &PackageName,
        name: &ResourceName,
    ) -> Result<(), GuardError> {
        match self.live_owner(package, name)? {
            Some(owner) => {
                info!("rejecting claim on {package}: held by {owner}");
                Err(GuardError::PackageAlreadyClaimed {
                    package: package.clone(),
                    owner,
                })
            }
            None => Ok(()),
        }
    }

    /// The earliest-committed live holder of `package` other than `name`.
    fn live_owner(
        &self,
        package: &PackageName,
        name: &ResourceName,
    ) -> Result<Option<ResourceName>, GuardError> {
        let snapshot = self.store.list()?;
        Ok(snapshot
            .items
            .into_iter()
            .filter(|obj| obj.package() == package && obj.name() != name)
            .min_by_key(ClusterExtension::version)
            .map(|obj| obj.metadata.name))
    }

    /// The conflict to report after the retry also lost. Store failures
    /// while reading the current version are returned as the error.
    fn refresh_version_conflict(
        &self,
        intent: &ClusterExtension,
    ) -> Result<GuardError, GuardError> {
        let actual = self
            .store
            .get(intent.name())?
            .version()
            .unwrap_or(ResourceVersion::new(0));
        Ok(GuardError::VersionConflict {
            name: intent.name().clone(),
            expected: intent.version().unwrap_or(ResourceVersion::new(0)),
            actual,
        })
    }
}

fn log_rejection(intent: &ClusterExtension, e: &StoreError) {
    match e {
        StoreError::IdentifierConflict { package, owner } => {
            info!("store rejected {} claiming {package}: held by {owner}", intent.name());
        }
        StoreError::Unavailable(msg) => warn!("store unavailable: {msg}"),
        other => debug!("write of {} failed: {other}", intent.name()),
    }
}

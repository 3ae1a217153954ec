//! Package-uniqueness enforcement for `ClusterExtension` resources.
//!
//! This crate sits between writers and the authoritative store. The
//! `UniquenessIndex` is a watch-fed cache of package → owner used by the
//! `Validator` to reject obvious conflicts without a round trip; the `Arbiter`
//! funnels every accepted write through a single arbitration point (the
//! store's native check, or the per-package `ClaimLocks`) so that exactly one
//! of any set of racing claimants commits. `IndexSync` keeps the index current
//! from the store's list+watch feed.

pub mod arbiter;
pub mod claims;
pub mod config;
pub mod index;
pub mod sync;
pub mod validator;

pub use arbiter::Arbiter;
pub use claims::{ClaimGuard, ClaimLocks};
pub use config::{Arbitration, GuardConfig};
pub use index::{Owner, UniquenessIndex};
pub use sync::IndexSync;
pub use validator::{Validator, Verdict};

use extguard_schema::{PackageName, ResourceName, ResourceVersion, SchemaError};
use extguard_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuardError {
    /// Permanent rejection: another live resource holds the package.
    #[error("Package \"{package}\" is already installed via ClusterExtension \"{owner}\"")]
    PackageAlreadyClaimed {
        package: PackageName,
        owner: ResourceName,
    },
    /// The index named an owner the store no longer agrees with.
    #[error("uniqueness index is behind the store for package \"{package}\"")]
    StaleView { package: PackageName },
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("timed out waiting to commit a claim on package \"{package}\"")]
    Timeout { package: PackageName },
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
    #[error("invalid ClusterExtension: {0}")]
    Invalid(#[from] SchemaError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(StoreError),
}

impl GuardError {
    /// Whether resubmitting the same request later may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            GuardError::StoreUnavailable(_) | GuardError::Timeout { .. }
        )
    }
}

impl From<StoreError> for GuardError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::IdentifierConflict { package, owner } => {
                GuardError::PackageAlreadyClaimed { package, owner }
            }
            StoreError::AlreadyExists(name) => GuardError::AlreadyExists(name),
            StoreError::NotFound(name) => GuardError::NotFound(name),
            StoreError::VersionConflict {
                name,
                expected,
                actual,
            } => GuardError::VersionConflict {
                name,
                expected,
                actual,
            },
            StoreError::Invalid(e) => GuardError::Invalid(e),
            StoreError::Unavailable(msg) => GuardError::StoreUnavailable(msg),
            transient if transient.is_transient() => {
                GuardError::StoreUnavailable(transient.to_string())
            }
            other => GuardError::Store(other),
        }
    }
}

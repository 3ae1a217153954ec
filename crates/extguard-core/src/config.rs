use crate::GuardError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Where races between claimants of one package are decided.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Arbitration {
    /// The store's native check when it has one, local claim locks otherwise.
    #[default]
    Auto,
    /// Require the store to reject duplicate packages at commit.
    Store,
    /// Always serialize claims through the in-process `ClaimLocks`.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct GuardConfig {
    pub arbitration: Arbitration,
    /// Upper bound on waiting for a package's claim slot.
    pub claim_timeout_ms: u64,
    /// Pause between a broken watch and the next full re-list.
    pub resync_backoff_ms: u64,
    /// How long `Arbiter::start` waits for the first index rebuild.
    pub initial_sync_timeout_ms: u64,
    /// Watch poll interval; bounds how quickly the reflector notices shutdown.
    pub watch_poll_ms: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            arbitration: Arbitration::Auto,
            claim_timeout_ms: 5_000,
            resync_backoff_ms: 200,
            initial_sync_timeout_ms: 5_000,
            watch_poll_ms: 100,
        }
    }
}

impl GuardConfig {
    pub fn load(path: &Path) -> Result<Self, GuardError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| GuardError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(s: &str) -> Result<Self, GuardError> {
        toml::from_str(s).map_err(|e| GuardError::Config(e.to_string()))
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }

    pub fn resync_backoff(&self) -> Duration {
        Duration::from_millis(self.resync_backoff_ms)
    }

    pub fn initial_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_sync_timeout_ms)
    }

    pub fn watch_poll(&self) -> Duration {
        Duration::from_millis(self.watch_poll_ms.max(1))
    }

    /// Decide whether commits rely on the store's native package check.
    pub fn use_store_arbitration(&self, store_is_native: bool) -> Result<bool, GuardError> {
        match self.arbitration {
            Arbitration::Auto => Ok(store_is_native),
            Arbitration::Local => Ok(false),
            Arbitration::Store if store_is_native => Ok(true),
            Arbitration::Store => Err(GuardError::Config(
                "arbitration = \"store\" requires a store that enforces unique packages"
                    .to_owned(),
            )),
        }
    }
}

use crate::GuardError;
use extguard_schema::PackageName;
use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Process-local serialization point for package claims.
///
/// At most one [`ClaimGuard`] exists per package at a time. Slots are keyed by
/// package, so claimants of different packages never wait on each other; the
/// table mutex is only held for the insert/remove itself.
#[derive(Default)]
pub struct ClaimLocks {
    held: Mutex<HashSet<PackageName>>,
    released: Condvar,
}

impl ClaimLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the slot for `package`, waiting at most `timeout`.
    ///
    /// On timeout nothing is held and the caller must not commit.
    pub fn acquire(
        &self,
        package: &PackageName,
        timeout: Duration,
    ) -> Result<ClaimGuard<'_>, GuardError> {
        let deadline = Instant::now() + timeout;
        let mut held = self.table();
        while held.contains(package) {
            let now = Instant::now();
            if now >= deadline {
                debug!("claim on {package} timed out after {timeout:?}");
                return Err(GuardError::Timeout {
                    package: package.clone(),
                });
            }
            held = self
                .released
                .wait_timeout(held, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        held.insert(package.clone());
        Ok(ClaimGuard {
            locks: self,
            package: package.clone(),
        })
    }

    pub fn is_held(&self, package: &PackageName) -> bool {
        self.table().contains(package)
    }

    fn table(&self) -> MutexGuard<'_, HashSet<PackageName>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive right to commit a claim on one package. Released on drop.
pub struct ClaimGuard<'a> {
    locks: &'a ClaimLocks,
    package: PackageName,
}

impl ClaimGuard<'_> {
    pub fn package(&self) -> &PackageName {
        &self.package
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.locks.table().remove(&self.package);
        self.locks.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn acquire_and_release() {
        let locks = ClaimLocks::new();
        let pkg = PackageName::new("p1");
        {
            let guard = locks.acquire(&pkg, WAIT).unwrap();
            assert_eq!(guard.package(), "p1");
            assert!(locks.is_held(&pkg));
        }
        assert!(!locks.is_held(&pkg));
    }

    #[test]
    fn second_claimant_times_out_while_held() {
        let locks = ClaimLocks::new();
        let pkg = PackageName::new("p1");
        let _guard = locks.acquire(&pkg, WAIT).unwrap();
        let err = locks.acquire(&pkg, Duration::from_millis(20)).err().unwrap();
        assert!(matches!(err, GuardError::Timeout { .. }));
    }

    #[test]
    fn different_packages_do_not_block() {
        let locks = ClaimLocks::new();
        let _a = locks.acquire(&"p1".into(), WAIT).unwrap();
        assert!(locks.acquire(&"p2".into(), Duration::ZERO).is_ok());
    }

    #[test]
    fn waiter_proceeds_after_release() {
        let locks = Arc::new(ClaimLocks::new());
        let guard = locks.acquire(&"p1".into(), WAIT).unwrap();

        let l = Arc::clone(&locks);
        let handle = thread::spawn(move || l.acquire(&"p1".into(), WAIT).is_ok());
        thread::sleep(Duration::from_millis(20));
        drop(guard);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn slot_is_mutually_exclusive_under_contention() {
        let locks = Arc::new(ClaimLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(16));
        let mut handles = Vec::new();

        for _ in 0..16 {
            let l = Arc::clone(&locks);
            let i = Arc::clone(&inside);
            let b = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                b.wait();
                let _g = l.acquire(&"pkg-x".into(), WAIT).unwrap();
                assert_eq!(i.fetch_add(1, Ordering::SeqCst), 0);
                thread::sleep(Duration::from_millis(1));
                i.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}

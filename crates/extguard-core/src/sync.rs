use crate::config::GuardConfig;
use crate::index::UniquenessIndex;
use crate::GuardError;
use extguard_store::{ExtensionStore, Next, StoreError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Background reflector keeping a [`UniquenessIndex`] in step with the store.
///
/// Runs list → rebuild → watch → apply. Any gap (closed stream, expired
/// resume point, store failure) marks the index stale and restarts from a
/// fresh list after a backoff.
pub struct IndexSync {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl IndexSync {
    pub fn spawn<S>(
        store: Arc<S>,
        index: Arc<UniquenessIndex>,
        config: &GuardConfig,
    ) -> Result<Self, GuardError>
    where
        S: ExtensionStore + ?Sized + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let poll = config.watch_poll();
        let backoff = config.resync_backoff();
        let handle = thread::Builder::new()
            .name("extguard-index-sync".to_owned())
            .spawn(move || run(store.as_ref(), &index, &flag, poll, backoff))?;
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the reflector and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("index sync thread panicked");
            }
        }
    }
}

impl Drop for IndexSync {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

fn run<S: ExtensionStore + ?Sized>(
    store: &S,
    index: &UniquenessIndex,
    shutdown: &AtomicBool,
    poll: Duration,
    backoff: Duration,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match reflect(store, index, shutdown, poll) {
            Ok(()) => {}
            Err(e) => warn!("index sync interrupted: {e}"),
        }
        index.mark_stale();
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        sleep_unless_shutdown(shutdown, backoff, poll);
    }
    debug!("index sync stopped");
}

/// One list+watch session. Returns `Ok` when the stream ends or shutdown is
/// requested.
fn reflect<S: ExtensionStore + ?Sized>(
    store: &S,
    index: &UniquenessIndex,
    shutdown: &AtomicBool,
    poll: Duration,
) -> Result<(), StoreError> {
    let snapshot = store.list()?;
    let stream = store.watch(snapshot.revision)?;
    index.rebuild(&snapshot);
    info!(
        "index synced: {} objects at rev {}",
        snapshot.items.len(),
        snapshot.revision
    );

    while !shutdown.load(Ordering::SeqCst) {
        match stream.next_timeout(poll) {
            Next::Event(event) => {
                index.apply(&event);
            }
            Next::Idle => {}
            Next::Closed => {
                warn!("watch stream closed at rev {}; resyncing", index.revision());
                return Ok(());
            }
        }
    }
    Ok(())
}

fn sleep_unless_shutdown(shutdown: &AtomicBool, total: Duration, step: Duration) {
    let deadline = Instant::now() + total;
    while !shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(step.min(deadline - now));
    }
}

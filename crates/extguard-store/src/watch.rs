use extguard_schema::ClusterExtension;
use std::fmt;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Added => write!(f, "added"),
            EventType::Modified => write!(f, "modified"),
            EventType::Deleted => write!(f, "deleted"),
        }
    }
}

/// One committed write, in store order.
///
/// `revision` is the store revision the write produced. For `Deleted` the
/// object carries its last committed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventType,
    pub object: ClusterExtension,
    pub revision: u64,
}

/// Result of polling a [`WatchStream`].
#[derive(Debug)]
pub enum Next {
    Event(WatchEvent),
    /// No event arrived within the timeout; the stream is still open.
    Idle,
    /// The producer went away. Anything after the last event may be lost.
    Closed,
}

/// Ordered change feed handed out by [`crate::ExtensionStore::watch`].
pub struct WatchStream {
    rx: Receiver<WatchEvent>,
}

impl WatchStream {
    pub fn new(rx: Receiver<WatchEvent>) -> Self {
        Self { rx }
    }

    pub fn next_timeout(&self, timeout: Duration) -> Next {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Next::Event(event),
            Err(RecvTimeoutError::Timeout) => Next::Idle,
            Err(RecvTimeoutError::Disconnected) => Next::Closed,
        }
    }
}

impl Iterator for WatchStream {
    type Item = WatchEvent;

    fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().ok()
    }
}

//! Traffic counters for the arbor stack.
//!
//! [`Counter`] is a monotonic atomic counter; [`Traffic`] pairs two of them
//! to account bytes written and read on a connection or a whole host.
//! Both are safe to read while other tasks are updating them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A monotonically increasing counter backed by [`AtomicU64`].
///
/// Uses [`Ordering::Relaxed`]; readers may observe a slightly stale value
/// but never a torn one.
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Counter").field(&self.get()).finish()
    }
}

impl serde::Serialize for Counter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.get().serialize(serializer)
    }
}

/// Sent/received byte counters with an optional parent.
///
/// Every update is also applied to the parent, so a host-level `Traffic`
/// always equals the sum of the connection-level ones created from it,
/// including connections that have since been closed.
#[derive(Default)]
pub struct Traffic {
    tx: Counter,
    rx: Counter,
    parent: Option<Arc<Traffic>>,
}

impl Traffic {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a child whose updates roll up into `parent`.
    pub fn child_of(parent: Arc<Traffic>) -> Self {
        Self {
            tx: Counter::new(),
            rx: Counter::new(),
            parent: Some(parent),
        }
    }

    pub fn record_tx(&self, bytes: u64) {
        self.tx.inc_by(bytes);
        if let Some(parent) = &self.parent {
            parent.record_tx(bytes);
        }
    }

    pub fn record_rx(&self, bytes: u64) {
        self.rx.inc_by(bytes);
        if let Some(parent) = &self.parent {
            parent.record_rx(bytes);
        }
    }

    /// Bytes written.
    pub fn tx(&self) -> u64 {
        self.tx.get()
    }

    /// Bytes read.
    pub fn rx(&self) -> u64 {
        self.rx.get()
    }
}

impl fmt::Debug for Traffic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Traffic")
            .field("tx", &self.tx())
            .field("rx", &self.rx())
            .finish()
    }
}

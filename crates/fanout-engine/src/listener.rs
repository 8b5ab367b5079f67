//! Listener set and reusable listeners
//!
//! The set is copy-on-write: dispatch works on an immutable snapshot, so
//! registering or deregistering while a worker is delivering an event never
//! blocks and never affects the delivery in progress.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use fanout_core::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::debug;

/// Snapshot of the listeners registered on one worker
pub type ListenerSnapshot = Arc<Vec<Arc<dyn ChangeListener>>>;

fn same_listener(a: &Arc<dyn ChangeListener>, b: &Arc<dyn ChangeListener>) -> bool {
    // identity only, vtable pointers may differ across codegen units
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

// ============================================================================
// Listener Set
// ============================================================================

/// Concurrent, copy-on-write set of listeners
pub struct ListenerSet {
    listeners: ArcSwap<Vec<Arc<dyn ChangeListener>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self {
            listeners: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Add a listener, returns false when it was already registered
    pub fn register(&self, listener: Arc<dyn ChangeListener>) -> bool {
        let mut added = false;
        self.listeners.rcu(|current| {
            if current.iter().any(|l| same_listener(l, &listener)) {
                added = false;
                Arc::clone(current)
            } else {
                added = true;
                let mut next: Vec<_> = current.iter().cloned().collect();
                next.push(Arc::clone(&listener));
                Arc::new(next)
            }
        });
        added
    }

    /// Remove a listener, returns false when it was not registered
    pub fn deregister(&self, listener: &Arc<dyn ChangeListener>) -> bool {
        let mut removed = false;
        self.listeners.rcu(|current| {
            let next: Vec<_> = current
                .iter()
                .filter(|l| !same_listener(l, listener))
                .cloned()
                .collect();
            removed = next.len() != current.len();
            Arc::new(next)
        });
        removed
    }

    pub fn contains(&self, listener: &Arc<dyn ChangeListener>) -> bool {
        self.listeners.load().iter().any(|l| same_listener(l, listener))
    }

    /// Listeners registered right now, in registration order
    pub fn snapshot(&self) -> ListenerSnapshot {
        self.listeners.load_full()
    }

    pub fn len(&self) -> usize {
        self.listeners.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ListenerSet {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Collecting Listener
// ============================================================================

/// Records every event it receives
pub struct CollectingListener {
    name: String,
    events: RwLock<Vec<ChangeEvent>>,
    notify: Notify,
}

impl CollectingListener {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: RwLock::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    /// Events received so far
    pub async fn events(&self) -> Vec<ChangeEvent> {
        self.events.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Wait until at least `count` events arrived, false on timeout
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.len().await >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.len().await >= count;
            }
        }
    }
}

#[async_trait]
impl ChangeListener for CollectingListener {
    async fn handle(&self, event: &ChangeEvent) {
        self.events.write().await.push(event.clone());
        self.notify.notify_waiters();
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Channel Listener
// ============================================================================

/// Forwards events into a bounded channel
///
/// Applies backpressure: a full channel holds up the partition's worker.
pub struct ChannelListener {
    name: String,
    tx: mpsc::Sender<ChangeEvent>,
}

impl ChannelListener {
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<ChangeEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                name: name.into(),
                tx,
            },
            rx,
        )
    }
}

#[async_trait]
impl ChangeListener for ChannelListener {
    async fn handle(&self, event: &ChangeEvent) {
        if self.tx.send(event.clone()).await.is_err() {
            debug!(listener = %self.name, "Receiver dropped, discarding event");
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

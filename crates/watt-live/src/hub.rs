//! Fan-out of live updates to connected viewers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use watt_core::{Snapshot, SnapshotDelta};

use crate::LiveCache;

/// One message pushed to every connected viewer
#[derive(Debug, Clone)]
pub enum LiveUpdate {
    /// Full state, sent once when a viewer joins
    Snapshot(Arc<Snapshot>),
    /// Changed circuits plus the always-present house panel
    Delta(Arc<SnapshotDelta>),
    /// The daemon is shutting down
    Goodbye,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireUpdate<'a> {
    Snapshot { payload: &'a Snapshot },
    Delta { payload: &'a SnapshotDelta },
    Goodbye,
}

impl LiveUpdate {
    /// Wire form: a JSON object tagged with `type`.
    pub fn to_message(&self) -> serde_json::Result<String> {
        let wire = match self {
            LiveUpdate::Snapshot(snap) => WireUpdate::Snapshot {
                payload: snap.as_ref(),
            },
            LiveUpdate::Delta(delta) => WireUpdate::Delta {
                payload: delta.as_ref(),
            },
            LiveUpdate::Goodbye => WireUpdate::Goodbye,
        };
        serde_json::to_string(&wire)
    }
}

struct Viewer {
    id: u64,
    tx: mpsc::Sender<LiveUpdate>,
}

/// A registered viewer's receiving end plus the snapshot to send first
pub struct Subscription {
    pub viewer_id: u64,
    pub baseline: Option<Arc<Snapshot>>,
    pub rx: mpsc::Receiver<LiveUpdate>,
}

/// Registry of connected viewers, each behind its own bounded queue.
///
/// Delivery is `try_send`: a viewer whose queue is full has stopped
/// draining and is dropped on the spot, so the poll loop never waits on
/// a socket and one stalled client cannot starve the rest.
pub struct BroadcastHub {
    cache: Arc<LiveCache>,
    viewers: Mutex<Vec<Viewer>>,
    queue_depth: usize,
    next_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new(cache: Arc<LiveCache>, queue_depth: usize) -> Self {
        Self {
            cache,
            viewers: Mutex::new(Vec::new()),
            queue_depth: queue_depth.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Vec<Viewer>> {
        self.viewers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a viewer and hands back its queue.
    ///
    /// The registry lock covers both the baseline read and the
    /// registration, so every update broadcast after the baseline
    /// reaches the new queue.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let viewer_id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut viewers = self.registry();
        let baseline = self.cache.current();
        viewers.push(Viewer { id: viewer_id, tx });
        drop(viewers);

        debug!(viewer_id, "viewer subscribed");
        Subscription {
            viewer_id,
            baseline,
            rx,
        }
    }

    /// Removes a viewer whose connection has ended.
    pub fn unsubscribe(&self, viewer_id: u64) {
        self.registry().retain(|v| v.id != viewer_id);
        debug!(viewer_id, "viewer unsubscribed");
    }

    /// Pushes `update` to every viewer, evicting the ones whose queues
    /// are full or whose receivers are gone.
    pub fn broadcast(&self, update: LiveUpdate) {
        self.registry()
            .retain(|viewer| match viewer.tx.try_send(update.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(viewer_id = viewer.id, "viewer not draining, dropping it");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(viewer_id = viewer.id, "viewer gone");
                    false
                }
            });
    }

    /// Tells every viewer the feed is ending and clears the registry.
    pub fn shutdown(&self) {
        let mut viewers = self.registry();
        for viewer in viewers.drain(..) {
            let _ = viewer.tx.try_send(LiveUpdate::Goodbye);
        }
    }

    pub fn viewer_count(&self) -> usize {
        self.registry().len()
    }
}

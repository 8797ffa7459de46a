//! Atomically-published live state

use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use watt_core::Snapshot;

/// Holder of the current snapshot plus a short ring of recent ones.
///
/// Readers take an `Arc` clone through an atomic load and never block the
/// poll loop. The loop is the only writer, so the ring's read-modify-write
/// does not race.
pub struct LiveCache {
    current: ArcSwapOption<Snapshot>,
    ring: ArcSwap<Vec<Arc<Snapshot>>>,
    capacity: usize,
}

impl LiveCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            current: ArcSwapOption::empty(),
            ring: ArcSwap::from_pointee(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Publishes a fresh snapshot, returning the one it replaced.
    pub fn publish(&self, snapshot: Snapshot) -> Option<Arc<Snapshot>> {
        let snapshot = Arc::new(snapshot);

        let mut ring: Vec<Arc<Snapshot>> = self.ring.load().as_ref().clone();
        ring.push(Arc::clone(&snapshot));
        if ring.len() > self.capacity {
            let excess = ring.len() - self.capacity;
            ring.drain(..excess);
        }
        self.ring.store(Arc::new(ring));

        self.current.swap(Some(snapshot))
    }

    /// Current snapshot, or `None` before the first completed cycle
    pub fn current(&self) -> Option<Arc<Snapshot>> {
        self.current.load_full()
    }

    /// Up to `limit` retained snapshots, oldest first
    pub fn recent(&self, limit: usize) -> Vec<Arc<Snapshot>> {
        let ring = self.ring.load();
        let skip = ring.len().saturating_sub(limit);
        ring[skip..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.ring.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

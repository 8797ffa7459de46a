//! Live state cache and viewer fan-out
//!
//! The poll loop publishes one [`Snapshot`](watt_core::Snapshot) per cycle
//! into a lock-free [`LiveCache`]; HTTP handlers read it without touching
//! the loop. The [`BroadcastHub`] pushes incremental updates to WebSocket
//! viewers, each behind its own bounded queue so one stalled client cannot
//! back-pressure the loop or its peers.

pub mod cache;
pub mod hub;

pub use cache::*;
pub use hub::*;

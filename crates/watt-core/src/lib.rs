//! Core data types, tariff classification, and source attribution for wattd
//!
//! This crate provides the fundamental data structures and pure logic for
//! energy telemetry processing. Everything here is I/O-free; polling,
//! persistence, and distribution live in the sibling crates.

pub mod attribution;
pub mod tariff;
pub mod types;

pub use attribution::*;
pub use tariff::*;
pub use types::*;

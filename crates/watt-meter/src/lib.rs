//! Telemetry source adapters
//!
//! This crate talks to the outside world: the branch-circuit meter (eGauge
//! register XML and CSV history over HTTP) and the automation hub that knows
//! about solar and battery flow. A simulated meter covers tests and
//! hardware-free runs.

pub mod egauge;
pub mod history;
pub mod hub;
pub mod simulator;
pub mod xml;

pub use egauge::*;
pub use hub::*;
pub use simulator::*;

use std::collections::HashMap;
use thiserror::Error;
use watt_core::Timestamp;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("authentication rejected: {0}")]
    Unauthorized(String),

    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

pub type FetchResult<T> = Result<T, FetchError>;

/// One register inside an instantaneous sample
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterValue {
    /// Instantaneous power, folded positive for consumption registers
    pub watts: f64,

    /// Lifetime energy of the register, folded positive
    pub cumulative_kwh: Option<f64>,
}

/// A full instantaneous sample from the meter
#[derive(Debug, Clone, PartialEq)]
pub struct MeterSample {
    /// Poll-cycle timestamp, stamped by the caller
    pub ts: Timestamp,

    /// The meter's whole-house usage register, watts
    pub total_usage_w: f64,

    /// Register name to value, every non-total register in the payload
    pub registers: HashMap<String, RegisterValue>,
}

impl MeterSample {
    pub fn register(&self, name: &str) -> Option<&RegisterValue> {
        self.registers.get(name)
    }
}

/// One row of the meter's cumulative-energy history
#[derive(Debug, Clone, PartialEq)]
pub struct CumulativeRow {
    pub ts: Timestamp,

    /// Register name to lifetime kWh at `ts`
    pub kwh: HashMap<String, f64>,
}

/// Trait for everything the poll scheduler reads power data from
#[async_trait::async_trait]
pub trait MeterSource: Send + Sync {
    /// Source name/identifier
    fn name(&self) -> &str;

    /// One instantaneous sample of every register
    async fn fetch_instantaneous(&self) -> FetchResult<MeterSample>;

    /// Cumulative register values at hour boundaries covering the last
    /// `hours` hours, oldest first; used for startup gap fill
    async fn fetch_historical(&self, hours: u32) -> FetchResult<Vec<CumulativeRow>>;
}

pub(crate) fn now_ts() -> Timestamp {
    chrono::Utc::now().timestamp()
}

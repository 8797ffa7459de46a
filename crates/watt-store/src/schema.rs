//! Schema DDL and row types
//!
//! Two tables: raw per-circuit readings keyed on `(circuit_id, ts)`, and
//! incremental rollup buckets keyed on `(circuit_id, bucket_start,
//! granularity)` with the kWh/cost totals broken down by billing period.
//! All DDL is idempotent; the daemon runs it on every start.

use crate::{StoreError, StoreResult};
use sqlx::FromRow;
use watt_core::{Granularity, HistoricalAggregate};

pub const DDL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS readings (
        circuit_id     TEXT NOT NULL,
        ts             INTEGER NOT NULL,
        watts          REAL NOT NULL,
        cumulative_kwh REAL,
        solar_w        REAL NOT NULL DEFAULT 0,
        battery_w      REAL NOT NULL DEFAULT 0,
        grid_w         REAL NOT NULL DEFAULT 0,
        period         TEXT NOT NULL,
        rate           REAL NOT NULL,
        PRIMARY KEY (circuit_id, ts)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS aggregates (
        circuit_id     TEXT NOT NULL,
        bucket_start   INTEGER NOT NULL,
        granularity    TEXT NOT NULL,
        kwh            REAL NOT NULL DEFAULT 0,
        cost           REAL NOT NULL DEFAULT 0,
        peak_kwh       REAL NOT NULL DEFAULT 0,
        peak_cost      REAL NOT NULL DEFAULT 0,
        part_peak_kwh  REAL NOT NULL DEFAULT 0,
        part_peak_cost REAL NOT NULL DEFAULT 0,
        off_peak_kwh   REAL NOT NULL DEFAULT 0,
        off_peak_cost  REAL NOT NULL DEFAULT 0,
        PRIMARY KEY (circuit_id, bucket_start, granularity)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_readings_ts ON readings (ts)",
    "CREATE INDEX IF NOT EXISTS idx_aggregates_bucket ON aggregates (bucket_start, granularity)",
];

/// Table names
pub mod tables {
    pub const READINGS: &str = "readings";
    pub const AGGREGATES: &str = "aggregates";
}

/// One aggregates row as stored
#[derive(Debug, Clone, FromRow)]
pub struct AggregateRow {
    pub circuit_id: String,
    pub bucket_start: i64,
    pub granularity: String,
    pub kwh: f64,
    pub cost: f64,
    pub peak_kwh: f64,
    pub peak_cost: f64,
    pub part_peak_kwh: f64,
    pub part_peak_cost: f64,
    pub off_peak_kwh: f64,
    pub off_peak_cost: f64,
}

impl AggregateRow {
    pub fn into_aggregate(self) -> StoreResult<HistoricalAggregate> {
        let granularity: Granularity = self
            .granularity
            .parse()
            .map_err(|e: String| StoreError::Corrupt(e))?;
        Ok(HistoricalAggregate {
            circuit_id: self.circuit_id,
            bucket_start: self.bucket_start,
            granularity,
            kwh: self.kwh,
            cost: self.cost,
            peak_kwh: self.peak_kwh,
            peak_cost: self.peak_cost,
            part_peak_kwh: self.part_peak_kwh,
            part_peak_cost: self.part_peak_cost,
            off_peak_kwh: self.off_peak_kwh,
            off_peak_cost: self.off_peak_cost,
        })
    }
}

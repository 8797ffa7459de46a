//! Core data types for energy telemetry

use serde::{Deserialize, Serialize};

/// Timestamp type (Unix epoch seconds, UTC)
pub type Timestamp = i64;

/// A monitored branch circuit, as declared in configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Circuit {
    /// Stable identifier used as the persistence key
    pub id: String,

    /// Human-readable display name
    pub name: String,

    /// Meter register this circuit reads from
    pub register: String,
}

/// One instantaneous sample for one circuit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reading {
    pub circuit_id: String,

    /// Unix timestamp of the poll cycle
    pub ts: Timestamp,

    /// Instantaneous draw in watts (consumption folded positive)
    pub watts: f64,

    /// Lifetime cumulative energy for the register, when the meter reports it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cumulative_kwh: Option<f64>,
}

/// Billing season, derived from the month of the local date
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Season {
    Winter,
    Summer,
}

/// Time-of-use billing period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TouPeriod {
    Peak,
    PartPeak,
    OffPeak,
}

impl TouPeriod {
    /// Label used in the database and on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            TouPeriod::Peak => "peak",
            TouPeriod::PartPeak => "part_peak",
            TouPeriod::OffPeak => "off_peak",
        }
    }
}

/// How one circuit's draw is attributed across supply sources
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SourceSplit {
    pub solar_w: f64,
    pub battery_w: f64,
    pub grid_w: f64,
}

impl SourceSplit {
    /// Split with the entire draw on the grid (solar integration off or degraded)
    pub fn grid_only(watts: f64) -> Self {
        Self {
            solar_w: 0.0,
            battery_w: 0.0,
            grid_w: watts,
        }
    }

    pub fn total(&self) -> f64 {
        self.solar_w + self.battery_w + self.grid_w
    }
}

/// House-level generation sample from the automation hub
///
/// `battery_w` is positive while discharging and negative while charging.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct PowerFlow {
    pub solar_w: f64,
    pub battery_w: f64,

    /// Battery state of charge in percent, when the hub exposes it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_soc: Option<f64>,
}

/// Supply-side percentages of the current house load
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SourceMix {
    pub solar_pct: f64,
    pub battery_pct: f64,
    pub grid_pct: f64,
}

/// Whole-house power balance for one cycle
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct HouseFlow {
    /// Total house draw reported by the meter's usage register
    pub load_w: f64,

    pub solar_w: f64,

    /// Battery discharge serving the house; charging shows as zero here
    pub battery_w: f64,

    /// Net grid flow, negative while exporting
    pub grid_w: f64,

    /// Generation beyond house load, flowing out to the grid
    pub export_w: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_soc: Option<f64>,

    pub mix: SourceMix,
}

/// Liveness and durability status carried in every snapshot
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FeedHealth {
    /// Timestamp of the last successful meter fetch
    pub last_success: Timestamp,

    /// First failure timestamp while the meter is unreachable, cleared on recovery
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_since: Option<Timestamp>,

    /// False when the most recent durable write failed
    pub persist_ok: bool,
}

impl FeedHealth {
    pub fn fresh(ts: Timestamp) -> Self {
        Self {
            last_success: ts,
            stale_since: None,
            persist_ok: true,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.stale_since.is_some()
    }
}

/// Running consumption totals for the current local day
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct DayTotals {
    pub kwh: f64,
    pub cost: f64,
}

/// Live view of one circuit inside a snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitState {
    pub circuit_id: String,
    pub name: String,
    pub watts: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cumulative_kwh: Option<f64>,

    pub split: SourceSplit,

    /// Billing period this reading was classified into
    pub period: TouPeriod,

    /// Import rate applied, dollars per kWh
    pub rate: f64,

    /// Dollars per hour at the current draw and rate
    pub cost_per_hour: f64,
}

/// Atomically-published "now" view of the whole house
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub ts: Timestamp,

    /// Billing period in effect at `ts`
    pub period: TouPeriod,

    /// Import rate in effect, dollars per kWh
    pub rate: f64,

    /// Per-circuit state in configuration order
    pub circuits: Vec<CircuitState>,

    pub house: HouseFlow,
    pub today: DayTotals,
    pub health: FeedHealth,
}

/// Incremental update relative to the previously published snapshot
///
/// `circuits` carries only entries whose draw or attribution changed; the
/// house panel, day totals, and health envelope are always present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotDelta {
    pub ts: Timestamp,
    pub period: TouPeriod,
    pub rate: f64,
    pub circuits: Vec<CircuitState>,
    pub house: HouseFlow,
    pub today: DayTotals,
    pub health: FeedHealth,
}

impl Snapshot {
    /// Builds the delta a viewer needs to go from `prev` to `self`.
    ///
    /// A circuit is included when it is new or any of its fields differ.
    /// Values are copied, not recomputed, between cycles, so bitwise f64
    /// comparison is exact here.
    pub fn delta_from(&self, prev: &Snapshot) -> SnapshotDelta {
        let circuits = self
            .circuits
            .iter()
            .filter(|cur| {
                prev.circuits
                    .iter()
                    .find(|p| p.circuit_id == cur.circuit_id)
                    .map_or(true, |p| p != *cur)
            })
            .cloned()
            .collect();

        SnapshotDelta {
            ts: self.ts,
            period: self.period,
            rate: self.rate,
            circuits,
            house: self.house,
            today: self.today,
            health: self.health,
        }
    }
}

/// One circuit's fully-classified cycle result, ready for persistence
#[derive(Debug, Clone, PartialEq)]
pub struct CycleRecord {
    pub reading: Reading,
    pub split: SourceSplit,
    pub period: TouPeriod,

    /// Import rate applied to this record, dollars per kWh
    pub rate: f64,

    /// Energy consumed since the previous cycle
    pub energy_kwh: f64,

    /// `energy_kwh * rate`
    pub cost: f64,
}

/// One rollup bucket as stored and queried
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoricalAggregate {
    pub circuit_id: String,

    /// Unix timestamp of the bucket boundary
    pub bucket_start: Timestamp,

    pub granularity: Granularity,
    pub kwh: f64,
    pub cost: f64,
    pub peak_kwh: f64,
    pub peak_cost: f64,
    pub part_peak_kwh: f64,
    pub part_peak_cost: f64,
    pub off_peak_kwh: f64,
    pub off_peak_cost: f64,
}

/// Rollup bucket width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
        }
    }
}

impl std::str::FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour" => Ok(Granularity::Hour),
            "day" => Ok(Granularity::Day),
            other => Err(format!("unknown granularity: {other}")),
        }
    }
}

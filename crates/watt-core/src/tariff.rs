//! Time-of-use tariff classification
//!
//! Rates depend on the season (a configurable set of summer months) and on
//! the hour of the local day. Classification is strictly ordered: the peak
//! window wins, then the part-peak windows in their configured order, and
//! any hour left over is off-peak. The ordering makes overlap harmless, so
//! windows are only checked for well-formedness, not disjointness.

use crate::types::{Season, Timestamp, TouPeriod};
use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Half-open local-hour window `[start_hour, end_hour)`; `end_hour` may be 24
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl HourWindow {
    pub fn new(start_hour: u32, end_hour: u32) -> Self {
        Self {
            start_hour,
            end_hour,
        }
    }

    pub fn contains(&self, hour: u32) -> bool {
        hour >= self.start_hour && hour < self.end_hour
    }

    pub fn is_well_formed(&self) -> bool {
        self.start_hour < self.end_hour && self.end_hour <= 24
    }
}

/// Schedule construction failure
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TariffError {
    #[error("no rate configured for {season:?} {period:?}")]
    RateNotFound { season: Season, period: TouPeriod },

    #[error("hour window {start_hour}..{end_hour} is not a valid range")]
    InvalidWindow { start_hour: u32, end_hour: u32 },

    #[error("summer month {0} is out of range 1..=12")]
    InvalidMonth(u32),

    #[error("timezone offset {0} hours is not a valid UTC offset")]
    InvalidOffset(i8),
}

/// A complete time-of-use rate schedule for one tariff plan
///
/// Construction validates the schedule over all 24 hours in both seasons,
/// so a schedule that exists always resolves to a rate.
#[derive(Debug, Clone)]
pub struct RateSchedule {
    plan_name: String,
    summer_months: Vec<u32>,
    peak: HourWindow,
    part_peak: Vec<HourWindow>,
    rates: HashMap<(Season, TouPeriod), f64>,
    tz_offset: FixedOffset,
}

impl RateSchedule {
    pub fn new(
        plan_name: impl Into<String>,
        summer_months: Vec<u32>,
        peak: HourWindow,
        part_peak: Vec<HourWindow>,
        rates: HashMap<(Season, TouPeriod), f64>,
        tz_offset_hours: i8,
    ) -> Result<Self, TariffError> {
        let tz_offset = FixedOffset::east_opt(i32::from(tz_offset_hours) * 3600)
            .ok_or(TariffError::InvalidOffset(tz_offset_hours))?;

        let schedule = Self {
            plan_name: plan_name.into(),
            summer_months,
            peak,
            part_peak,
            rates,
            tz_offset,
        };
        schedule.validate()?;
        Ok(schedule)
    }

    /// Walks every hour of both seasons and fails on the first hole.
    fn validate(&self) -> Result<(), TariffError> {
        for month in &self.summer_months {
            if !(1..=12).contains(month) {
                return Err(TariffError::InvalidMonth(*month));
            }
        }

        for window in std::iter::once(&self.peak).chain(self.part_peak.iter()) {
            if !window.is_well_formed() {
                return Err(TariffError::InvalidWindow {
                    start_hour: window.start_hour,
                    end_hour: window.end_hour,
                });
            }
        }

        for season in [Season::Winter, Season::Summer] {
            for hour in 0..24 {
                let period = self.period_for_hour(hour);
                if !self.rates.contains_key(&(season, period)) {
                    return Err(TariffError::RateNotFound { season, period });
                }
            }
        }

        Ok(())
    }

    pub fn plan_name(&self) -> &str {
        &self.plan_name
    }

    pub fn tz_offset(&self) -> FixedOffset {
        self.tz_offset
    }

    /// Season for a 1-based calendar month
    pub fn season_for_month(&self, month: u32) -> Season {
        if self.summer_months.contains(&month) {
            Season::Summer
        } else {
            Season::Winter
        }
    }

    /// Period for a local hour; first matching rule wins
    pub fn period_for_hour(&self, hour: u32) -> TouPeriod {
        if self.peak.contains(hour) {
            return TouPeriod::Peak;
        }
        if self.part_peak.iter().any(|w| w.contains(hour)) {
            return TouPeriod::PartPeak;
        }
        TouPeriod::OffPeak
    }

    pub fn rate_for(&self, season: Season, period: TouPeriod) -> Option<f64> {
        self.rates.get(&(season, period)).copied()
    }

    /// Classifies a UTC timestamp into the period and import rate in effect.
    pub fn classify(&self, ts: Timestamp) -> (TouPeriod, f64) {
        let local = self.to_local(ts);
        let season = self.season_for_month(local.month());
        let period = self.period_for_hour(local.hour());
        // coverage proven at construction
        let rate = self.rate_for(season, period).unwrap_or_default();
        (period, rate)
    }

    /// Unix timestamp of local midnight for the day containing `ts`
    pub fn local_day_start(&self, ts: Timestamp) -> Timestamp {
        let offset = i64::from(self.tz_offset.local_minus_utc());
        ts - (ts + offset).rem_euclid(86_400)
    }

    fn to_local(&self, ts: Timestamp) -> DateTime<FixedOffset> {
        DateTime::<Utc>::from_timestamp(ts, 0)
            .unwrap_or_default()
            .with_timezone(&self.tz_offset)
    }
}

/// Unix timestamp of the UTC hour boundary containing `ts`
pub fn hour_start(ts: Timestamp) -> Timestamp {
    ts - ts.rem_euclid(3600)
}

//! Daemon configuration: TOML file plus environment-variable secrets
//!
//! The file is located via `WATTD_CONFIG` (default `wattd.toml`). Credentials
//! never live in the file: the meter password and hub token are read from
//! `WATTD_METER_PASSWORD` and `WATTD_HUB_TOKEN`. `AppConfig::validate`
//! runs every startup check, including building the tariff schedule, so a
//! daemon that gets past it cannot hit a rate hole at runtime.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::env;
use std::fs;
use std::path::Path;
use watt_core::{Circuit, HourWindow, RateSchedule, Season, TariffError, TouPeriod};

/// Environment variable holding the config file path
pub const CONFIG_PATH_VAR: &str = "WATTD_CONFIG";

/// Environment variable holding the meter HTTP password
pub const METER_PASSWORD_VAR: &str = "WATTD_METER_PASSWORD";

/// Environment variable holding the hub bearer token
pub const HUB_TOKEN_VAR: &str = "WATTD_HUB_TOKEN";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Tariff(#[from] TariffError),

    #[error("no circuits configured")]
    NoCircuits,

    #[error("duplicate circuit id: {0}")]
    DuplicateCircuit(String),

    #[error("meter.url is required when meter.mode is \"egauge\"")]
    MissingMeterUrl,

    #[error("hub.url is required when hub.enabled is true")]
    MissingHubUrl,

    #[error("missing credential: set {0}")]
    MissingCredential(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which telemetry source the daemon polls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeterMode {
    Egauge,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterConfig {
    /// Base URL of the meter, e.g. `https://egauge12345.egaug.es`
    pub url: Option<String>,

    /// HTTP basic-auth user; leave unset for an unauthenticated meter
    pub username: Option<String>,

    /// Filled from `WATTD_METER_PASSWORD`, never from the file
    #[serde(skip)]
    pub password: Option<String>,

    #[serde(default = "default_meter_mode")]
    pub mode: MeterMode,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            url: None,
            username: None,
            password: None,
            mode: default_meter_mode(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HubConfig {
    /// Solar/battery integration switch; everything below is ignored when off
    #[serde(default)]
    pub enabled: bool,

    /// Base URL of the automation hub, e.g. `http://homeassistant.local:8123`
    pub url: Option<String>,

    /// Entity reporting solar production in kW
    pub solar_power_entity: Option<String>,

    /// Entity reporting battery power in kW, positive while discharging
    pub battery_power_entity: Option<String>,

    /// Entity reporting battery state of charge in percent
    pub battery_soc_entity: Option<String>,

    /// Filled from `WATTD_HUB_TOKEN`, never from the file
    #[serde(skip)]
    pub token: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Per-period import rates in dollars per kWh; holes fail validation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct PeriodRates {
    pub peak: Option<f64>,
    pub part_peak: Option<f64>,
    pub off_peak: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatesConfig {
    pub winter: PeriodRates,
    pub summer: PeriodRates,
}

impl Default for RatesConfig {
    /// EV2-A residential TOU rates
    fn default() -> Self {
        Self {
            winter: PeriodRates {
                peak: Some(0.51928),
                part_peak: Some(0.49193),
                off_peak: Some(0.29780),
            },
            summer: PeriodRates {
                peak: Some(0.64639),
                part_peak: Some(0.52525),
                off_peak: Some(0.29780),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TariffConfig {
    #[serde(default = "default_plan_name")]
    pub plan_name: String,

    /// 1-based months billed at summer rates
    #[serde(default = "default_summer_months")]
    pub summer_months: Vec<u32>,

    /// Fixed UTC offset used for local-hour classification
    #[serde(default)]
    pub timezone_offset_hours: i8,

    #[serde(default = "default_peak_window")]
    pub peak: HourWindow,

    /// Checked in order; may be disjoint
    #[serde(default = "default_part_peak_windows")]
    pub part_peak: Vec<HourWindow>,

    #[serde(default)]
    pub rates: RatesConfig,
}

impl Default for TariffConfig {
    fn default() -> Self {
        Self {
            plan_name: default_plan_name(),
            summer_months: default_summer_months(),
            timezone_offset_hours: 0,
            peak: default_peak_window(),
            part_peak: default_part_peak_windows(),
            rates: RatesConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    pub id: String,

    /// Display name; defaults to the id
    pub name: Option<String>,

    /// Meter register; defaults to the display name
    pub register: Option<String>,
}

impl CircuitConfig {
    fn to_circuit(&self) -> Circuit {
        let name = self.name.clone().unwrap_or_else(|| self.id.clone());
        let register = self.register.clone().unwrap_or_else(|| name.clone());
        Circuit {
            id: self.id.clone(),
            name,
            register,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,

    /// Ceiling for the exponential retry backoff
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,

    /// Readings older than this are pruned once a day
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Snapshots retained for the recent-trend window
    #[serde(default = "default_ring_size")]
    pub ring_size: usize,

    /// Per-viewer update buffer; a viewer that falls this far behind is dropped
    #[serde(default = "default_viewer_buffer")]
    pub viewer_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            ring_size: default_ring_size(),
            viewer_buffer: default_viewer_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub meter: MeterConfig,

    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub tariff: TariffConfig,

    #[serde(default)]
    pub circuits: Vec<CircuitConfig>,

    #[serde(default)]
    pub poll: PollConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

impl AppConfig {
    /// Load from the `WATTD_CONFIG` path and pull secrets from the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| "wattd.toml".to_string());
        let mut cfg = Self::load_from(Path::new(&path))?;
        cfg.meter.password = env::var(METER_PASSWORD_VAR).ok();
        cfg.hub.token = env::var(HUB_TOKEN_VAR).ok();
        Ok(cfg)
    }

    /// Parse the file at `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Ok(toml::from_str::<AppConfig>(&fs::read_to_string(path)?)?)
        } else {
            Ok(AppConfig::default())
        }
    }

    /// Run every startup check and return the validated rate schedule.
    pub fn validate(&self) -> Result<RateSchedule, ConfigError> {
        if self.circuits.is_empty() {
            return Err(ConfigError::NoCircuits);
        }
        let mut seen = HashSet::new();
        for c in &self.circuits {
            if !seen.insert(c.id.as_str()) {
                return Err(ConfigError::DuplicateCircuit(c.id.clone()));
            }
        }

        if self.meter.mode == MeterMode::Egauge {
            match &self.meter.url {
                None => return Err(ConfigError::MissingMeterUrl),
                Some(u) => check_url("meter.url", u)?,
            }
            if self.meter.username.is_some() && self.meter.password.is_none() {
                return Err(ConfigError::MissingCredential(METER_PASSWORD_VAR));
            }
        }

        if self.hub.enabled {
            match &self.hub.url {
                None => return Err(ConfigError::MissingHubUrl),
                Some(u) => check_url("hub.url", u)?,
            }
            if self.hub.token.is_none() {
                return Err(ConfigError::MissingCredential(HUB_TOKEN_VAR));
            }
            if self.hub.solar_power_entity.is_none() {
                return Err(ConfigError::Invalid(
                    "hub.solar_power_entity is required when hub.enabled is true".to_string(),
                ));
            }
        }

        if self.poll.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll.interval_secs must be at least 1".to_string(),
            ));
        }
        if self.poll.max_backoff_secs < self.poll.interval_secs {
            return Err(ConfigError::Invalid(
                "poll.max_backoff_secs must not be below poll.interval_secs".to_string(),
            ));
        }
        if self.server.ring_size == 0 || self.server.viewer_buffer == 0 {
            return Err(ConfigError::Invalid(
                "server.ring_size and server.viewer_buffer must be at least 1".to_string(),
            ));
        }

        self.rate_schedule()
    }

    /// Build the tariff schedule from the `[tariff]` section.
    pub fn rate_schedule(&self) -> Result<RateSchedule, ConfigError> {
        let t = &self.tariff;
        let mut rates = HashMap::new();
        for (season, period_rates) in [
            (Season::Winter, &t.rates.winter),
            (Season::Summer, &t.rates.summer),
        ] {
            for (period, rate) in [
                (TouPeriod::Peak, period_rates.peak),
                (TouPeriod::PartPeak, period_rates.part_peak),
                (TouPeriod::OffPeak, period_rates.off_peak),
            ] {
                if let Some(rate) = rate {
                    rates.insert((season, period), rate);
                }
            }
        }

        Ok(RateSchedule::new(
            t.plan_name.clone(),
            t.summer_months.clone(),
            t.peak,
            t.part_peak.clone(),
            rates,
            t.timezone_offset_hours,
        )?)
    }

    /// Monitored circuits with name/register defaults resolved.
    pub fn monitored_circuits(&self) -> Vec<Circuit> {
        self.circuits.iter().map(CircuitConfig::to_circuit).collect()
    }
}

fn check_url(field: &str, value: &str) -> Result<(), ConfigError> {
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|e| ConfigError::Invalid(format!("{field}: {e}")))
}

fn default_meter_mode() -> MeterMode {
    MeterMode::Simulated
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_plan_name() -> String {
    "EV2-A".to_string()
}

fn default_summer_months() -> Vec<u32> {
    vec![6, 7, 8, 9]
}

fn default_peak_window() -> HourWindow {
    HourWindow::new(16, 21)
}

fn default_part_peak_windows() -> Vec<HourWindow> {
    vec![HourWindow::new(15, 16), HourWindow::new(21, 24)]
}

fn default_poll_interval() -> u64 {
    5
}

fn default_max_backoff() -> u64 {
    60
}

fn default_store_path() -> String {
    "wattd.db".to_string()
}

fn default_retention_days() -> u32 {
    365
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_ring_size() -> usize {
    120
}

fn default_viewer_buffer() -> usize {
    16
}

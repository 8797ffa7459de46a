//! Poll, classify, persist, publish

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use watt_config::AppConfig;
use watt_core::{
    attribute, check_flow, hour_start, house_flow, Circuit, CircuitState, CycleRecord, DayTotals,
    FeedHealth, RateSchedule, Reading, Snapshot, SourceSplit, Timestamp,
};
use watt_live::{BroadcastHub, LiveCache, LiveUpdate};
use watt_meter::{HubClient, MeterSource};
use watt_store::StoreClient;

/// Scheduler drives the poll cycle: fetch, classify, attribute, persist,
/// publish. One sequential loop; a slow store write delays the next poll
/// rather than piling up cycles.
pub struct Scheduler {
    meter: Box<dyn MeterSource>,
    flow_source: Option<HubClient>,
    schedule: RateSchedule,
    circuits: Vec<Circuit>,
    store: StoreClient,
    cache: Arc<LiveCache>,
    hub: Arc<BroadcastHub>,
    interval: Duration,
    max_backoff: Duration,
    retention_secs: i64,

    last_cumulative: HashMap<String, f64>,
    last_cycle_ts: Option<Timestamp>,
    today: DayTotals,
    day_start: Timestamp,
    health: FeedHealth,
    failures: u32,
    last_prune_day: Timestamp,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        meter: Box<dyn MeterSource>,
        flow_source: Option<HubClient>,
        schedule: RateSchedule,
        circuits: Vec<Circuit>,
        store: StoreClient,
        cache: Arc<LiveCache>,
        hub: Arc<BroadcastHub>,
        config: &AppConfig,
    ) -> Self {
        Self {
            meter,
            flow_source,
            schedule,
            circuits,
            store,
            cache,
            hub,
            interval: Duration::from_secs(config.poll.interval_secs),
            max_backoff: Duration::from_secs(config.poll.max_backoff_secs),
            retention_secs: i64::from(config.store.retention_days) * 86_400,
            last_cumulative: HashMap::new(),
            last_cycle_ts: None,
            today: DayTotals::default(),
            day_start: 0,
            health: FeedHealth::fresh(now_ts()),
            failures: 0,
            last_prune_day: 0,
        }
    }

    /// Run the poll loop until `shutdown` fires. An in-flight cycle always
    /// finishes; cancellation only interrupts the sleep between cycles.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        self.seed_today().await;

        info!(
            source = self.meter.name(),
            interval = ?self.interval,
            "poll loop started"
        );

        while !shutdown.is_cancelled() {
            let delay = match self.cycle().await {
                Ok(()) => {
                    self.failures = 0;
                    self.interval
                }
                Err(e) => {
                    self.failures = self.failures.saturating_add(1);
                    let delay = self.backoff();
                    warn!(
                        error = %e,
                        failures = self.failures,
                        retry_in = ?delay,
                        "poll cycle failed"
                    );
                    self.mark_stale();
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        info!("poll loop stopped");
    }

    /// Resume the current day's running totals across a restart.
    async fn seed_today(&mut self) {
        self.day_start = self.schedule.local_day_start(now_ts());
        match self.store.day_totals(self.day_start).await {
            Ok(totals) => {
                self.today = totals;
                info!(kwh = totals.kwh, cost = totals.cost, "day totals seeded");
            }
            Err(e) => warn!(error = %e, "could not seed day totals"),
        }
    }

    async fn cycle(&mut self) -> Result<()> {
        let sample = self
            .meter
            .fetch_instantaneous()
            .await
            .context("meter fetch")?;
        let ts = sample.ts;

        // solar/battery data is optional garnish; a hub outage only
        // degrades attribution to grid-only
        let flow = match &self.flow_source {
            Some(hub) => match hub.fetch_power_flow().await {
                Ok(flow) => match check_flow(&flow) {
                    Ok(()) => Some(flow),
                    Err(e) => {
                        warn!(error = %e, "hub flow rejected");
                        None
                    }
                },
                Err(e) => {
                    warn!(error = %e, "hub fetch failed, grid-only attribution");
                    None
                }
            },
            None => None,
        };

        let (period, rate) = self.schedule.classify(ts);
        let house = house_flow(sample.total_usage_w, flow.as_ref());
        let dt = self.last_cycle_ts.map(|prev| ts - prev);

        let mut records = Vec::with_capacity(self.circuits.len());
        let mut states = Vec::with_capacity(self.circuits.len());
        let mut cycle_kwh = 0.0;
        let mut cycle_cost = 0.0;

        for circuit in &self.circuits {
            let value = sample.register(&circuit.register);
            let watts = value.map(|v| v.watts).unwrap_or(0.0);
            let cumulative = value.and_then(|v| v.cumulative_kwh);

            let energy_kwh = Self::energy_for(
                &mut self.last_cumulative,
                self.interval,
                &circuit.id,
                cumulative,
                watts,
                dt,
            );
            let cost = energy_kwh * rate;
            cycle_kwh += energy_kwh;
            cycle_cost += cost;

            let split = match flow.as_ref() {
                Some(f) => attribute(watts, sample.total_usage_w, f),
                None => SourceSplit::grid_only(watts),
            };

            records.push(CycleRecord {
                reading: Reading {
                    circuit_id: circuit.id.clone(),
                    ts,
                    watts,
                    cumulative_kwh: cumulative,
                },
                split,
                period,
                rate,
                energy_kwh,
                cost,
            });
            states.push(CircuitState {
                circuit_id: circuit.id.clone(),
                name: circuit.name.clone(),
                watts,
                cumulative_kwh: cumulative,
                split,
                period,
                rate,
                cost_per_hour: watts / 1000.0 * rate,
            });
        }

        // totals reset at local midnight, not UTC midnight
        let day_start = self.schedule.local_day_start(ts);
        if day_start != self.day_start {
            info!(day_start, "local day rolled over");
            self.day_start = day_start;
            self.today = DayTotals::default();
        }
        self.today.kwh += cycle_kwh;
        self.today.cost += cycle_cost;

        self.health.last_success = ts;
        self.health.stale_since = None;

        // persist before publish so persist_ok reflects this cycle
        match self
            .store
            .append_cycle(&records, hour_start(ts), self.day_start)
            .await
        {
            Ok(()) => self.health.persist_ok = true,
            Err(e) => {
                error!(error = %e, "persist failed, live feed continues");
                self.health.persist_ok = false;
            }
        }

        let snapshot = Snapshot {
            ts,
            period,
            rate,
            circuits: states,
            house,
            today: self.today,
            health: self.health,
        };

        let prev = self.cache.publish(snapshot);
        match (prev, self.cache.current()) {
            (Some(prev), Some(current)) => {
                let delta = current.delta_from(&prev);
                self.hub.broadcast(LiveUpdate::Delta(Arc::new(delta)));
            }
            // viewers that joined before the first cycle had no baseline
            (None, Some(current)) => self.hub.broadcast(LiveUpdate::Snapshot(current)),
            _ => {}
        }

        self.last_cycle_ts = Some(ts);
        self.maybe_prune(ts).await;

        Ok(())
    }

    /// Energy consumed by one circuit since the previous cycle.
    ///
    /// The meter's own lifetime counter is authoritative when present;
    /// otherwise power integrates over the elapsed time, capped at twice
    /// the poll interval so a long outage cannot inflate one cycle.
    fn energy_for(
        last_cumulative: &mut HashMap<String, f64>,
        interval: Duration,
        circuit_id: &str,
        cumulative: Option<f64>,
        watts: f64,
        dt: Option<i64>,
    ) -> f64 {
        if let Some(curr) = cumulative {
            let prev = last_cumulative.insert(circuit_id.to_string(), curr);
            if let Some(prev) = prev {
                return (curr - prev).abs();
            }
        }
        match dt {
            Some(dt) if dt > 0 => {
                let capped = (dt as f64).min(interval.as_secs_f64() * 2.0);
                watts / 1000.0 * (capped / 3600.0)
            }
            _ => 0.0,
        }
    }

    fn backoff(&self) -> Duration {
        let exp = self.failures.saturating_sub(1).min(16);
        let scaled = self.interval.saturating_mul(2u32.saturating_pow(exp));
        scaled.min(self.max_backoff)
    }

    /// Surface an outage in the live state without inventing readings.
    fn mark_stale(&mut self) {
        let now = now_ts();
        if self.health.stale_since.is_none() {
            self.health.stale_since = Some(now);
        }

        let Some(current) = self.cache.current() else {
            return;
        };
        let mut snap = (*current).clone();
        snap.ts = now;
        snap.health = self.health;

        let prev = self.cache.publish(snap);
        if let (Some(prev), Some(current)) = (prev, self.cache.current()) {
            let delta = current.delta_from(&prev);
            self.hub.broadcast(LiveUpdate::Delta(Arc::new(delta)));
        }
    }

    /// Prune once per local day, on the first cycle after rollover.
    async fn maybe_prune(&mut self, ts: Timestamp) {
        if self.day_start == self.last_prune_day {
            return;
        }
        let cutoff = ts - self.retention_secs;
        match self.store.prune_before(cutoff).await {
            Ok(deleted) => {
                if deleted > 0 {
                    info!(deleted, "pruned history past retention");
                }
                self.last_prune_day = self.day_start;
            }
            Err(e) => warn!(error = %e, "prune failed"),
        }
    }
}

fn now_ts() -> Timestamp {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use watt_meter::{CumulativeRow, FetchError, FetchResult, MeterSample, RegisterValue};

    struct ScriptedMeter {
        samples: Mutex<VecDeque<FetchResult<MeterSample>>>,
    }

    impl ScriptedMeter {
        fn new(samples: Vec<FetchResult<MeterSample>>) -> Self {
            Self {
                samples: Mutex::new(samples.into_iter().collect()),
            }
        }
    }

    #[async_trait::async_trait]
    impl MeterSource for ScriptedMeter {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn fetch_instantaneous(&self) -> FetchResult<MeterSample> {
            self.samples
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::Unreachable("script exhausted".to_string())))
        }

        async fn fetch_historical(&self, _hours: u32) -> FetchResult<Vec<CumulativeRow>> {
            Ok(Vec::new())
        }
    }

    fn sample(ts: Timestamp, entries: &[(&str, f64, Option<f64>)]) -> MeterSample {
        let mut registers = HashMap::new();
        let mut total = 0.0;
        for (name, watts, cumulative_kwh) in entries {
            total += watts;
            registers.insert(
                name.to_string(),
                RegisterValue {
                    watts: *watts,
                    cumulative_kwh: *cumulative_kwh,
                },
            );
        }
        MeterSample {
            ts,
            total_usage_w: total,
            registers,
        }
    }

    fn circuits() -> Vec<Circuit> {
        vec![
            Circuit {
                id: "hvac".to_string(),
                name: "HVAC".to_string(),
                register: "HVAC".to_string(),
            },
            Circuit {
                id: "ev".to_string(),
                name: "Car Charger".to_string(),
                register: "EV".to_string(),
            },
        ]
    }

    async fn scheduler_with(
        dir: &tempfile::TempDir,
        samples: Vec<FetchResult<MeterSample>>,
    ) -> (Scheduler, Arc<LiveCache>, Arc<BroadcastHub>, StoreClient) {
        let store = StoreClient::open(dir.path().join("sched.db")).await.unwrap();
        store.init_schema().await.unwrap();

        let config = AppConfig::default();
        let schedule = config.rate_schedule().unwrap();
        let cache = Arc::new(LiveCache::new(16));
        let hub = Arc::new(BroadcastHub::new(Arc::clone(&cache), 8));

        let scheduler = Scheduler::new(
            Box::new(ScriptedMeter::new(samples)),
            None,
            schedule,
            circuits(),
            store.clone(),
            Arc::clone(&cache),
            Arc::clone(&hub),
            &config,
        );
        (scheduler, cache, hub, store)
    }

    #[tokio::test]
    async fn test_cycle_persists_and_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let ts = 1_760_000_000;
        let (mut sched, cache, hub, store) = scheduler_with(
            &dir,
            vec![
                Ok(sample(
                    ts,
                    &[("HVAC", 1200.0, Some(100.0)), ("EV", 2400.0, Some(200.0))],
                )),
                Ok(sample(
                    ts + 5,
                    &[("HVAC", 1200.0, Some(100.5)), ("EV", 2400.0, Some(200.25))],
                )),
            ],
        )
        .await;

        sched.cycle().await.unwrap();
        let mut viewer = hub.subscribe();
        assert_eq!(viewer.baseline.as_ref().map(|s| s.ts), Some(ts));

        sched.cycle().await.unwrap();

        let snap = cache.current().unwrap();
        assert_eq!(snap.ts, ts + 5);
        assert_eq!(snap.circuits.len(), 2);
        assert_eq!(snap.house.load_w, 3600.0);
        // October morning is winter off-peak
        assert_eq!(snap.rate, 0.29780);
        assert!((snap.today.kwh - 0.75).abs() < 1e-9);
        assert!((snap.today.cost - 0.75 * 0.29780).abs() < 1e-9);
        assert!(snap.health.persist_ok);
        assert!(snap.health.stale_since.is_none());
        assert_eq!(snap.health.last_success, ts + 5);

        assert_eq!(store.count_readings().await.unwrap(), 4);
        let aggs = store
            .query_aggregates(
                &[],
                hour_start(ts),
                hour_start(ts) + 3600,
                watt_core::Granularity::Hour,
            )
            .await
            .unwrap();
        assert_eq!(aggs.len(), 2);
        let hvac = aggs.iter().find(|a| a.circuit_id == "hvac").unwrap();
        assert!((hvac.kwh - 0.5).abs() < 1e-9);

        // the second cycle reached the viewer as a delta
        match viewer.rx.try_recv() {
            Ok(LiveUpdate::Delta(d)) => {
                assert_eq!(d.ts, ts + 5);
                assert_eq!(d.circuits.len(), 2);
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_register_reads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let ts = 1_760_000_000;
        let (mut sched, cache, _hub, _store) =
            scheduler_with(&dir, vec![Ok(sample(ts, &[("HVAC", 800.0, None)]))]).await;

        sched.cycle().await.unwrap();

        let snap = cache.current().unwrap();
        let ev = snap.circuits.iter().find(|c| c.circuit_id == "ev").unwrap();
        assert_eq!(ev.watts, 0.0);
        assert_eq!(ev.cumulative_kwh, None);
    }

    #[tokio::test]
    async fn test_failure_marks_stale_and_recovery_clears_it() {
        let dir = tempfile::tempdir().unwrap();
        let ts = 1_760_000_000;
        let (mut sched, cache, _hub, _store) = scheduler_with(
            &dir,
            vec![
                Ok(sample(ts, &[("HVAC", 800.0, Some(10.0))])),
                Err(FetchError::Unreachable("down".to_string())),
                Ok(sample(ts + 20, &[("HVAC", 800.0, Some(10.1))])),
            ],
        )
        .await;

        sched.cycle().await.unwrap();
        assert!(cache.current().unwrap().health.stale_since.is_none());

        assert!(sched.cycle().await.is_err());
        sched.mark_stale();
        let snap = cache.current().unwrap();
        assert!(snap.health.stale_since.is_some());
        // last good readings survive the outage
        assert_eq!(snap.circuits[0].watts, 800.0);
        assert_eq!(snap.health.last_success, ts);

        sched.cycle().await.unwrap();
        let snap = cache.current().unwrap();
        assert!(snap.health.stale_since.is_none());
        assert_eq!(snap.health.last_success, ts + 20);
    }

    #[tokio::test]
    async fn test_backoff_doubles_to_cap() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sched, _cache, _hub, _store) = scheduler_with(&dir, Vec::new()).await;

        sched.failures = 1;
        assert_eq!(sched.backoff(), Duration::from_secs(5));
        sched.failures = 2;
        assert_eq!(sched.backoff(), Duration::from_secs(10));
        sched.failures = 3;
        assert_eq!(sched.backoff(), Duration::from_secs(20));
        sched.failures = 5;
        assert_eq!(sched.backoff(), Duration::from_secs(60));
        sched.failures = 30;
        assert_eq!(sched.backoff(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_day_rollover_resets_totals() {
        let dir = tempfile::tempdir().unwrap();
        // 2025-10-10 UTC midnight
        let midnight = 1_760_054_400;
        let (mut sched, cache, _hub, _store) = scheduler_with(
            &dir,
            vec![
                Ok(sample(midnight - 10, &[("HVAC", 1000.0, Some(50.0))])),
                Ok(sample(midnight - 5, &[("HVAC", 1000.0, Some(50.4))])),
                Ok(sample(midnight + 5, &[("HVAC", 1000.0, Some(50.7))])),
            ],
        )
        .await;

        sched.cycle().await.unwrap();
        sched.cycle().await.unwrap();
        assert!((cache.current().unwrap().today.kwh - 0.4).abs() < 1e-9);

        sched.cycle().await.unwrap();
        // only the post-midnight energy counts toward the new day
        assert!((cache.current().unwrap().today.kwh - 0.3).abs() < 1e-9);
        assert_eq!(sched.day_start, midnight);
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_live_feed() {
        let dir = tempfile::tempdir().unwrap();
        let ts = 1_760_000_000;
        let (mut sched, cache, _hub, store) =
            scheduler_with(&dir, vec![Ok(sample(ts, &[("HVAC", 900.0, None)]))]).await;

        store.close().await;

        sched.cycle().await.unwrap();
        let snap = cache.current().unwrap();
        assert!(!snap.health.persist_ok);
        assert_eq!(snap.circuits[0].watts, 900.0);
    }

    #[tokio::test]
    async fn test_hub_outage_degrades_to_grid_only() {
        let dir = tempfile::tempdir().unwrap();
        let ts = 1_760_000_000;
        let (mut sched, cache, _hub, _store) =
            scheduler_with(&dir, vec![Ok(sample(ts, &[("HVAC", 800.0, None)]))]).await;
        // nothing listens on TEST-NET
        sched.flow_source = Some(
            HubClient::new(
                "http://192.0.2.1:1",
                "token".to_string(),
                "sensor.solar_power".to_string(),
                None,
                None,
                Duration::from_millis(50),
            )
            .unwrap(),
        );

        sched.cycle().await.unwrap();

        let snap = cache.current().unwrap();
        let hvac = &snap.circuits[0];
        assert_eq!(hvac.split, SourceSplit::grid_only(800.0));
        assert_eq!(snap.house.mix.grid_pct, 100.0);
    }

    #[tokio::test]
    async fn test_run_seeds_today_and_honors_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sched, _cache, _hub, store) = scheduler_with(&dir, Vec::new()).await;

        let day = sched.schedule.local_day_start(now_ts());
        store
            .add_consumption("hvac", day, day, 2.0, 0.6, watt_core::TouPeriod::OffPeak)
            .await
            .unwrap();

        let token = CancellationToken::new();
        token.cancel();
        sched.run(token).await;

        assert!((sched.today.kwh - 2.0).abs() < 1e-9);
        assert!((sched.today.cost - 0.6).abs() < 1e-9);
    }
}

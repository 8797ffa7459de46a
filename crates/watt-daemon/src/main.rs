//! wattd - home energy monitoring daemon
//!
//! This binary coordinates:
//! - Meter polling and TOU classification (via the scheduler)
//! - Source attribution from the automation hub
//! - SQLite persistence with hourly/daily rollups
//! - The HTTP/WebSocket API for dashboards

mod backfill;
mod scheduler;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use watt_config::{AppConfig, MeterMode};
use watt_core::Circuit;
use watt_live::{BroadcastHub, LiveCache};
use watt_meter::{EgaugeClient, HubClient, MeterSource, SimulatedMeter};
use watt_server::ServerMeta;
use watt_store::StoreClient;

use crate::scheduler::Scheduler;

#[tokio::main]
async fn main() -> Result<()> {
    watt_obs::init("wattd");

    info!("starting wattd");

    let config = AppConfig::load().context("failed to load configuration")?;
    let schedule = config.validate().context("invalid configuration")?;
    let circuits = config.monitored_circuits();
    info!(
        circuits = circuits.len(),
        plan = schedule.plan_name(),
        "configuration loaded"
    );

    let store = StoreClient::open(&config.store.path)
        .await
        .context("failed to open store")?;
    store.init_schema().await.context("failed to prepare schema")?;
    store.ping().await.context("store ping failed")?;
    info!(path = %config.store.path, "store ready");

    let meter = build_meter(&config, &circuits)?;
    info!(source = meter.name(), "meter source ready");

    let flow_source = build_hub(&config)?;
    if flow_source.is_some() {
        info!("solar attribution enabled");
    }

    // rebuild rollups for hours missed while the daemon was down
    if let Err(e) = backfill::run(&store, meter.as_ref(), &schedule, &circuits).await {
        warn!(error = %e, "gap fill skipped");
    }

    let cache = Arc::new(LiveCache::new(config.server.ring_size));
    let hub = Arc::new(BroadcastHub::new(
        Arc::clone(&cache),
        config.server.viewer_buffer,
    ));

    let meta = ServerMeta {
        plan_name: schedule.plan_name().to_string(),
        solar_enabled: config.hub.enabled,
        poll_interval_secs: config.poll.interval_secs,
        circuits: circuits.clone(),
        started_at: chrono::Utc::now().timestamp(),
    };
    let (app, state) = watt_server::build_app(
        Arc::clone(&cache),
        Arc::clone(&hub),
        store.clone(),
        meta,
    );

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind listener")?;

    let server_shutdown = CancellationToken::new();
    let server_token = server_shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_token.cancelled().await })
            .await
    });
    watt_server::set_ready(&state, true);
    info!(%addr, "http server listening");

    let poll_shutdown = CancellationToken::new();
    let signal_token = poll_shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let mut scheduler = Scheduler::new(
        meter,
        flow_source,
        schedule,
        circuits,
        store.clone(),
        Arc::clone(&cache),
        Arc::clone(&hub),
        &config,
    );
    scheduler.run(poll_shutdown).await;

    // say goodbye to viewers before tearing the sockets down
    hub.shutdown();
    server_shutdown.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "http server error"),
        Err(e) => error!(error = %e, "http server task failed"),
    }

    store.close().await;
    info!("wattd stopped");
    Ok(())
}

fn build_meter(config: &AppConfig, circuits: &[Circuit]) -> Result<Box<dyn MeterSource>> {
    let timeout = Duration::from_secs(config.meter.timeout_secs);
    match config.meter.mode {
        MeterMode::Egauge => {
            let url = config
                .meter
                .url
                .as_deref()
                .context("meter.url is required for the egauge mode")?;
            let client = EgaugeClient::new(
                url,
                config.meter.username.clone(),
                config.meter.password.clone(),
                timeout,
            )
            .context("meter client")?;
            Ok(Box::new(client))
        }
        MeterMode::Simulated => {
            let registers = circuits.iter().map(|c| c.register.clone()).collect();
            Ok(Box::new(SimulatedMeter::new(registers)))
        }
    }
}

fn build_hub(config: &AppConfig) -> Result<Option<HubClient>> {
    if !config.hub.enabled {
        return Ok(None);
    }
    let hub = &config.hub;
    let url = hub.url.as_deref().context("hub.url is required")?;
    let token = hub.token.clone().context("hub token is required")?;
    let solar = hub
        .solar_power_entity
        .clone()
        .context("hub.solar_power_entity is required")?;
    let client = HubClient::new(
        url,
        token,
        solar,
        hub.battery_power_entity.clone(),
        hub.battery_soc_entity.clone(),
        Duration::from_secs(hub.timeout_secs),
    )
    .context("hub client")?;
    Ok(Some(client))
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }
}

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use opentelemetry::metrics::{Counter, MeterProvider};
use opentelemetry_prometheus::exporter;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use watt_core::{Circuit, Granularity, Snapshot, Timestamp};
use watt_live::{BroadcastHub, LiveCache};
use watt_store::StoreClient;

mod ws;

/// Static daemon facts served at /api/v1/meta
#[derive(Debug, Clone, Serialize)]
pub struct ServerMeta {
    pub plan_name: String,
    pub solar_enabled: bool,
    pub poll_interval_secs: u64,
    pub circuits: Vec<Circuit>,
    pub started_at: Timestamp,
}

pub struct AppState {
    ready: AtomicBool,
    registry: Registry,
    #[allow(dead_code)]
    provider: SdkMeterProvider,
    requests_total: Counter<u64>,
    cache: Arc<LiveCache>,
    hub: Arc<BroadcastHub>,
    store: StoreClient,
    meta: ServerMeta,
}

pub fn build_app(
    cache: Arc<LiveCache>,
    hub: Arc<BroadcastHub>,
    store: StoreClient,
    meta: ServerMeta,
) -> (Router, Arc<AppState>) {
    // Prometheus exporter via OpenTelemetry
    let registry = Registry::new();
    let reader = exporter()
        .with_registry(registry.clone())
        .build()
        .expect("prom exporter");
    let provider = SdkMeterProvider::builder().with_reader(reader).build();
    let meter = provider.meter("wattd");

    let requests_total = meter
        .u64_counter("watt_requests_total")
        .with_description("Total HTTP requests served")
        .init();

    let state = Arc::new(AppState {
        ready: AtomicBool::new(false),
        registry,
        provider,
        requests_total,
        cache,
        hub,
        store,
        meta,
    });

    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/current", get(current))
        .route("/api/v1/recent", get(recent))
        .route("/api/v1/aggregates", get(aggregates))
        .route("/api/v1/meta", get(self::meta))
        .route("/api/v1/live", get(ws::ws_handler))
        .with_state(Arc::clone(&state));

    (router, state)
}

pub fn set_ready(state: &Arc<AppState>, is_ready: bool) {
    state.ready.store(is_ready, Ordering::Relaxed);
}

async fn healthz(State(state): State<Arc<AppState>>) -> StatusCode {
    state.requests_total.add(1, &[]);
    StatusCode::OK
}

// ready only once wiring finished AND the first poll cycle published
async fn readyz(State(state): State<Arc<AppState>>) -> StatusCode {
    if state.ready.load(Ordering::Relaxed) && state.cache.current().is_some() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics(
    State(state): State<Arc<AppState>>,
) -> (
    [(axum::http::header::HeaderName, axum::http::HeaderValue); 1],
    String,
) {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buf) {
        tracing::warn!(error=?e, "failed to encode metrics");
    }
    let body = String::from_utf8(buf).unwrap_or_default();
    let header = (
        header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    ([header], body)
}

async fn current(State(state): State<Arc<AppState>>) -> Response {
    state.requests_total.add(1, &[]);
    if let Some(snap) = state.cache.current() {
        return (StatusCode::OK, Json(snap.as_ref())).into_response();
    }
    StatusCode::NO_CONTENT.into_response()
}

#[derive(Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

async fn recent(State(state): State<Arc<AppState>>, Query(q): Query<RecentQuery>) -> Response {
    state.requests_total.add(1, &[]);
    let limit = q.limit.unwrap_or(60);
    let snaps = state.cache.recent(limit);
    let refs: Vec<&Snapshot> = snaps.iter().map(|s| s.as_ref()).collect();
    (StatusCode::OK, Json(refs)).into_response()
}

#[derive(Deserialize)]
struct AggregatesQuery {
    granularity: Option<String>,
    /// Unix seconds or RFC3339
    start: Option<String>,
    end: Option<String>,
    /// Comma-separated circuit ids; absent means all
    circuits: Option<String>,
}

fn parse_bound(raw: &str) -> Result<Timestamp, String> {
    if let Ok(secs) = raw.parse::<i64>() {
        return Ok(secs);
    }
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&chrono::Utc).timestamp())
        .map_err(|_| format!("bad timestamp {raw:?}: want unix seconds or RFC3339"))
}

async fn aggregates(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AggregatesQuery>,
) -> Response {
    state.requests_total.add(1, &[]);

    let granularity = match q
        .granularity
        .as_deref()
        .unwrap_or("hour")
        .parse::<Granularity>()
    {
        Ok(g) => g,
        Err(e) => return bad_request(e),
    };
    let end = match q.end.as_deref().map(parse_bound).transpose() {
        Ok(end) => end.unwrap_or_else(|| chrono::Utc::now().timestamp()),
        Err(e) => return bad_request(e),
    };
    let default_span = match granularity {
        Granularity::Hour => 24 * 3600,
        Granularity::Day => 30 * 86_400,
    };
    let start = match q.start.as_deref().map(parse_bound).transpose() {
        Ok(start) => start.unwrap_or(end - default_span),
        Err(e) => return bad_request(e),
    };
    if start >= end {
        return bad_request("start must be before end".to_string());
    }

    let circuit_ids: Vec<String> = q
        .circuits
        .as_deref()
        .map(|s| {
            s.split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect()
        })
        .unwrap_or_default();

    match state
        .store
        .query_aggregates(&circuit_ids, start, end, granularity)
        .await
    {
        Ok(rows) => (StatusCode::OK, Json(rows)).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "aggregate query failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn meta(State(state): State<Arc<AppState>>) -> Response {
    state.requests_total.add(1, &[]);
    (StatusCode::OK, Json(&state.meta)).into_response()
}

fn bad_request(msg: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": msg })),
    )
        .into_response()
}

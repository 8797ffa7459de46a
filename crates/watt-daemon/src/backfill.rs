//! Startup gap fill from the meter's cumulative history

use anyhow::Result;
use tracing::{debug, info};
use watt_core::{hour_start, Circuit, RateSchedule};
use watt_meter::{history::consumption_between, MeterSource};
use watt_store::StoreClient;

/// Longest outage the meter history is asked to cover
const MAX_BACKFILL_HOURS: i64 = 72;

/// Rebuild rollup buckets for hours the daemon was down.
///
/// The meter keeps lifetime counters at hour boundaries, so missed hours
/// land with correct energy totals even though per-cycle detail is gone.
/// The hour containing the newest live reading is left alone; filling it
/// from history would double-count what polling already recorded.
pub async fn run(
    store: &StoreClient,
    meter: &dyn MeterSource,
    schedule: &RateSchedule,
    circuits: &[Circuit],
) -> Result<()> {
    let Some(latest) = store.latest_reading_ts().await? else {
        debug!("empty store, nothing to fill");
        return Ok(());
    };

    let gap_secs = chrono::Utc::now().timestamp() - latest;
    if gap_secs < 3600 {
        debug!(gap_secs, "gap under an hour, meter history not needed");
        return Ok(());
    }

    let hours = (gap_secs / 3600).clamp(1, MAX_BACKFILL_HOURS) as u32;
    info!(hours, "filling rollups from meter history");

    let rows = meter.fetch_historical(hours).await?;
    let intervals = consumption_between(&rows);

    let mut filled = 0usize;
    for interval in &intervals {
        if interval.start_ts <= latest {
            continue;
        }

        let (period, rate) = schedule.classify(interval.start_ts);
        let hour_bucket = hour_start(interval.start_ts);
        let day_bucket = schedule.local_day_start(interval.start_ts);

        for circuit in circuits {
            let Some(kwh) = interval.kwh.get(&circuit.register) else {
                continue;
            };
            if *kwh == 0.0 {
                continue;
            }
            store
                .add_consumption(
                    &circuit.id,
                    hour_bucket,
                    day_bucket,
                    *kwh,
                    kwh * rate,
                    period,
                )
                .await?;
            filled += 1;
        }
    }

    info!(filled, "gap fill complete");
    Ok(())
}

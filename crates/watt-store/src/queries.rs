//! Query operations for readings and rollup buckets

use crate::schema::AggregateRow;
use crate::{StoreClient, StoreResult};
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, instrument};
use watt_core::{CycleRecord, DayTotals, Granularity, HistoricalAggregate, Timestamp, TouPeriod};

const INSERT_READING: &str = r#"
    INSERT OR REPLACE INTO readings (
        circuit_id, ts, watts, cumulative_kwh,
        solar_w, battery_w, grid_w, period, rate
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

const UPSERT_BUCKET: &str = r#"
    INSERT INTO aggregates (
        circuit_id, bucket_start, granularity, kwh, cost,
        peak_kwh, peak_cost, part_peak_kwh, part_peak_cost,
        off_peak_kwh, off_peak_cost
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (circuit_id, bucket_start, granularity) DO UPDATE SET
        kwh = kwh + excluded.kwh,
        cost = cost + excluded.cost,
        peak_kwh = peak_kwh + excluded.peak_kwh,
        peak_cost = peak_cost + excluded.peak_cost,
        part_peak_kwh = part_peak_kwh + excluded.part_peak_kwh,
        part_peak_cost = part_peak_cost + excluded.part_peak_cost,
        off_peak_kwh = off_peak_kwh + excluded.off_peak_kwh,
        off_peak_cost = off_peak_cost + excluded.off_peak_cost
"#;

impl StoreClient {
    /// Create tables and indexes; safe to run on every start.
    #[instrument(skip(self))]
    pub async fn init_schema(&self) -> StoreResult<()> {
        for ddl in crate::schema::DDL {
            sqlx::query(ddl).execute(self.pool()).await?;
        }
        debug!("schema ready");
        Ok(())
    }

    /// Persist one poll cycle atomically: every circuit's reading plus the
    /// hour and day buckets the cycle's energy lands in.
    #[instrument(skip(self, records), fields(records = records.len()))]
    pub async fn append_cycle(
        &self,
        records: &[CycleRecord],
        hour_bucket: Timestamp,
        day_bucket: Timestamp,
    ) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;

        for rec in records {
            sqlx::query(INSERT_READING)
                .bind(&rec.reading.circuit_id)
                .bind(rec.reading.ts)
                .bind(rec.reading.watts)
                .bind(rec.reading.cumulative_kwh)
                .bind(rec.split.solar_w)
                .bind(rec.split.battery_w)
                .bind(rec.split.grid_w)
                .bind(rec.period.as_str())
                .bind(rec.rate)
                .execute(&mut *tx)
                .await?;

            upsert_bucket(
                &mut tx,
                &rec.reading.circuit_id,
                hour_bucket,
                Granularity::Hour,
                rec.energy_kwh,
                rec.cost,
                rec.period,
            )
            .await?;
            upsert_bucket(
                &mut tx,
                &rec.reading.circuit_id,
                day_bucket,
                Granularity::Day,
                rec.energy_kwh,
                rec.cost,
                rec.period,
            )
            .await?;
        }

        tx.commit().await?;
        debug!("cycle persisted");
        Ok(())
    }

    /// Add consumption into one hour and its day bucket outside the live
    /// path; used by startup gap fill.
    #[instrument(skip(self))]
    pub async fn add_consumption(
        &self,
        circuit_id: &str,
        hour_bucket: Timestamp,
        day_bucket: Timestamp,
        kwh: f64,
        cost: f64,
        period: TouPeriod,
    ) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;
        upsert_bucket(
            &mut tx,
            circuit_id,
            hour_bucket,
            Granularity::Hour,
            kwh,
            cost,
            period,
        )
        .await?;
        upsert_bucket(
            &mut tx,
            circuit_id,
            day_bucket,
            Granularity::Day,
            kwh,
            cost,
            period,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Rollup buckets with `start <= bucket_start < end`, oldest first.
    /// An empty `circuit_ids` slice means every circuit.
    #[instrument(skip(self, circuit_ids))]
    pub async fn query_aggregates(
        &self,
        circuit_ids: &[String],
        start: Timestamp,
        end: Timestamp,
        granularity: Granularity,
    ) -> StoreResult<Vec<HistoricalAggregate>> {
        let mut sql = String::from(
            "SELECT circuit_id, bucket_start, granularity, kwh, cost, \
             peak_kwh, peak_cost, part_peak_kwh, part_peak_cost, \
             off_peak_kwh, off_peak_cost \
             FROM aggregates \
             WHERE granularity = ? AND bucket_start >= ? AND bucket_start < ?",
        );
        if !circuit_ids.is_empty() {
            let placeholders = vec!["?"; circuit_ids.len()].join(", ");
            sql.push_str(&format!(" AND circuit_id IN ({placeholders})"));
        }
        sql.push_str(" ORDER BY bucket_start ASC, circuit_id ASC");

        let mut query = sqlx::query_as::<_, AggregateRow>(&sql)
            .bind(granularity.as_str())
            .bind(start)
            .bind(end);
        for id in circuit_ids {
            query = query.bind(id);
        }

        let rows = query.fetch_all(self.pool()).await?;
        debug!(rows = rows.len(), "aggregates queried");
        rows.into_iter().map(AggregateRow::into_aggregate).collect()
    }

    /// Timestamp of the newest persisted reading
    #[instrument(skip(self))]
    pub async fn latest_reading_ts(&self) -> StoreResult<Option<Timestamp>> {
        let row = sqlx::query("SELECT MAX(ts) AS ts FROM readings")
            .fetch_one(self.pool())
            .await?;
        Ok(row.get::<Option<i64>, _>("ts"))
    }

    /// Summed kWh and cost across all circuits for one day bucket
    #[instrument(skip(self))]
    pub async fn day_totals(&self, day_bucket: Timestamp) -> StoreResult<DayTotals> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(kwh), 0) AS kwh, COALESCE(SUM(cost), 0) AS cost \
             FROM aggregates WHERE granularity = 'day' AND bucket_start = ?",
        )
        .bind(day_bucket)
        .fetch_one(self.pool())
        .await?;
        Ok(DayTotals {
            kwh: row.get("kwh"),
            cost: row.get("cost"),
        })
    }

    /// Count of persisted readings
    #[instrument(skip(self))]
    pub async fn count_readings(&self) -> StoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM readings")
            .fetch_one(self.pool())
            .await?;
        Ok(row.get("count"))
    }

    /// Delete readings and rollup buckets older than `cutoff`.
    #[instrument(skip(self))]
    pub async fn prune_before(&self, cutoff: Timestamp) -> StoreResult<u64> {
        let mut tx = self.pool().begin().await?;
        let readings = sqlx::query("DELETE FROM readings WHERE ts < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let buckets = sqlx::query("DELETE FROM aggregates WHERE bucket_start < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        let deleted = readings + buckets;
        debug!(readings, buckets, "pruned history");
        Ok(deleted)
    }
}

async fn upsert_bucket(
    tx: &mut Transaction<'_, Sqlite>,
    circuit_id: &str,
    bucket_start: Timestamp,
    granularity: Granularity,
    kwh: f64,
    cost: f64,
    period: TouPeriod,
) -> StoreResult<()> {
    let (peak_kwh, part_peak_kwh, off_peak_kwh) = match period {
        TouPeriod::Peak => (kwh, 0.0, 0.0),
        TouPeriod::PartPeak => (0.0, kwh, 0.0),
        TouPeriod::OffPeak => (0.0, 0.0, kwh),
    };
    let (peak_cost, part_peak_cost, off_peak_cost) = match period {
        TouPeriod::Peak => (cost, 0.0, 0.0),
        TouPeriod::PartPeak => (0.0, cost, 0.0),
        TouPeriod::OffPeak => (0.0, 0.0, cost),
    };

    sqlx::query(UPSERT_BUCKET)
        .bind(circuit_id)
        .bind(bucket_start)
        .bind(granularity.as_str())
        .bind(kwh)
        .bind(cost)
        .bind(peak_kwh)
        .bind(peak_cost)
        .bind(part_peak_kwh)
        .bind(part_peak_cost)
        .bind(off_peak_kwh)
        .bind(off_peak_cost)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

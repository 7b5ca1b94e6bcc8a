//! # repository
//!
//! Narrow persistence interfaces the pipeline consumes, plus their
//! PostgreSQL implementations. The ingestion path only ever creates
//! telemetry rows; the derivation tasks create events and daily stats.
//! Trucks and road segments are owned by the administrative store and are
//! read-only here.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPool;
use sqlx::{Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::models::{
    NewTelemetry, RoughnessEvent, SegmentDayStats, SegmentSample, Severity, TelemetrySample,
    Truck, TruckStatus,
};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("repository error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum SpatialError {
    #[error("spatial backend unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
}

/// Outcome of a batch insert with skip-duplicates semantics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub skipped: usize,
}

// ── Traits ────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait TelemetryRepository: Send + Sync {
    async fn find_truck_by_identifier(&self, identifier: &str)
        -> Result<Option<Truck>, RepoError>;

    /// Insert all rows in one statement. With `skip_duplicates`, rows
    /// violating the `(truck_id, timestamp)` uniqueness are silently
    /// counted as skipped; partial success is not an error.
    async fn insert_telemetry_batch(
        &self,
        rows: &[NewTelemetry],
        skip_duplicates: bool,
    ) -> Result<BatchOutcome, RepoError>;

    /// Unprocessed rows in `(truck_id, timestamp)` ascending order.
    async fn list_unprocessed_telemetry(
        &self,
        limit: i64,
    ) -> Result<Vec<TelemetrySample>, RepoError>;

    async fn mark_telemetry_processed(&self, ids: &[i64]) -> Result<(), RepoError>;

    async fn insert_roughness_events(&self, events: &[RoughnessEvent]) -> Result<(), RepoError>;

    async fn list_road_segment_ids(&self) -> Result<Vec<i64>, RepoError>;

    async fn list_telemetry_for_segment_on_day(
        &self,
        segment_id: i64,
        date: NaiveDate,
    ) -> Result<Vec<SegmentSample>, RepoError>;

    async fn count_events_for_segment_on_day(
        &self,
        segment_id: i64,
        date: NaiveDate,
        severity: Option<Severity>,
    ) -> Result<i64, RepoError>;

    /// Idempotent upsert keyed on `(segment_id, date)`; last write wins.
    async fn upsert_segment_stats(&self, row: &SegmentDayStats) -> Result<(), RepoError>;

    /// Named advisory lock serializing the derivation tasks across
    /// processes. Non-blocking: returns false when another holder exists.
    async fn try_acquire_advisory_lock(&self, name: &str) -> Result<bool, RepoError>;

    async fn release_advisory_lock(&self, name: &str) -> Result<(), RepoError>;
}

#[async_trait]
pub trait SegmentLookup: Send + Sync {
    /// Id of the single nearest road segment whose geometry lies within
    /// `meters` of the point, by geodesic distance.
    async fn nearest_segment_within(
        &self,
        lat_deg: f64,
        lon_deg: f64,
        meters: f64,
    ) -> Result<Option<i64>, SpatialError>;
}

// ── PostgreSQL implementation ─────────────────────────────────────────────────

pub struct PgRepository {
    pool: PgPool,
    /// Advisory locks are session-scoped in Postgres, so each held lock
    /// pins the connection it was taken on until release.
    lock_conns: Mutex<HashMap<String, PoolConnection<Postgres>>>,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_conns: Mutex::new(HashMap::new()),
        }
    }
}

fn day_bounds(date: NaiveDate) -> (chrono::DateTime<Utc>, chrono::DateTime<Utc>) {
    let start = date.and_time(NaiveTime::MIN).and_utc();
    (start, start + chrono::Duration::days(1))
}

#[async_trait]
impl TelemetryRepository for PgRepository {
    async fn find_truck_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<Truck>, RepoError> {
        let row = sqlx::query("SELECT id, identifier, status FROM trucks WHERE identifier = $1")
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|r| -> Result<Truck, sqlx::Error> {
                Ok(Truck {
                    id: r.try_get("id")?,
                    identifier: r.try_get("identifier")?,
                    status: TruckStatus::from_db(r.try_get::<&str, _>("status")?),
                })
            })
            .transpose()?)
    }

    async fn insert_telemetry_batch(
        &self,
        rows: &[NewTelemetry],
        skip_duplicates: bool,
    ) -> Result<BatchOutcome, RepoError> {
        if rows.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO truck_telemetry (truck_id, timestamp, lat_e7, lon_e7, altitude_m, \
             speed_kmh, heading_deg, satellites, axis_x_mg, axis_y_mg, axis_z_mg, ignition, \
             movement, external_voltage_mv, battery_voltage_mv, din1, din2, ain1_mv, \
             odometer_m, gsm_signal, segment_id, is_loaded, raw_record) ",
        );
        qb.push_values(rows, |mut b, r| {
            b.push_bind(r.truck_id)
                .push_bind(r.timestamp)
                .push_bind(r.lat_e7)
                .push_bind(r.lon_e7)
                .push_bind(r.altitude_m)
                .push_bind(r.speed_kmh)
                .push_bind(r.heading_deg)
                .push_bind(r.satellites)
                .push_bind(r.axis_x_mg)
                .push_bind(r.axis_y_mg)
                .push_bind(r.axis_z_mg)
                .push_bind(r.ignition)
                .push_bind(r.movement)
                .push_bind(r.external_voltage_mv)
                .push_bind(r.battery_voltage_mv)
                .push_bind(r.din1)
                .push_bind(r.din2)
                .push_bind(r.ain1_mv)
                .push_bind(r.odometer_m)
                .push_bind(r.gsm_signal)
                .push_bind(r.segment_id)
                .push_bind(r.is_loaded)
                .push_bind(&r.raw_record);
        });
        if skip_duplicates {
            qb.push(" ON CONFLICT (truck_id, timestamp) DO NOTHING");
        }

        let result = qb.build().execute(&self.pool).await?;
        let inserted = result.rows_affected() as usize;
        Ok(BatchOutcome {
            inserted,
            skipped: rows.len() - inserted,
        })
    }

    async fn list_unprocessed_telemetry(
        &self,
        limit: i64,
    ) -> Result<Vec<TelemetrySample>, RepoError> {
        let rows = sqlx::query(
            "SELECT id, truck_id, timestamp, lat_e7, lon_e7, speed_kmh, axis_x_mg, axis_y_mg, \
             axis_z_mg, segment_id, is_loaded \
             FROM truck_telemetry WHERE NOT processed \
             ORDER BY truck_id, timestamp LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(TelemetrySample {
                    id: r.try_get("id")?,
                    truck_id: r.try_get("truck_id")?,
                    timestamp: r.try_get("timestamp")?,
                    lat_e7: r.try_get("lat_e7")?,
                    lon_e7: r.try_get("lon_e7")?,
                    speed_kmh: r.try_get("speed_kmh")?,
                    axis_x_mg: r.try_get("axis_x_mg")?,
                    axis_y_mg: r.try_get("axis_y_mg")?,
                    axis_z_mg: r.try_get("axis_z_mg")?,
                    segment_id: r.try_get("segment_id")?,
                    is_loaded: r.try_get("is_loaded")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(Into::into)
    }

    async fn mark_telemetry_processed(&self, ids: &[i64]) -> Result<(), RepoError> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE truck_telemetry SET processed = TRUE WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_roughness_events(&self, events: &[RoughnessEvent]) -> Result<(), RepoError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO roughness_events (timestamp, duration_ms, truck_id, lat_e7, lon_e7, \
             segment_id, event_type, severity, peak_x_mg, peak_y_mg, peak_z_mg, speed_kmh, \
             is_loaded) ",
        );
        qb.push_values(events, |mut b, e| {
            b.push_bind(e.timestamp)
                .push_bind(e.duration_ms)
                .push_bind(e.truck_id)
                .push_bind(e.lat_e7)
                .push_bind(e.lon_e7)
                .push_bind(e.segment_id)
                .push_bind(e.event_type)
                .push_bind(e.severity.as_str())
                .push_bind(e.peak_x_mg)
                .push_bind(e.peak_y_mg)
                .push_bind(e.peak_z_mg)
                .push_bind(e.speed_kmh)
                .push_bind(e.is_loaded);
        });
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn list_road_segment_ids(&self) -> Result<Vec<i64>, RepoError> {
        let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM road_segments ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn list_telemetry_for_segment_on_day(
        &self,
        segment_id: i64,
        date: NaiveDate,
    ) -> Result<Vec<SegmentSample>, RepoError> {
        let (start, end) = day_bounds(date);
        let rows = sqlx::query(
            "SELECT axis_z_mg, speed_kmh, is_loaded FROM truck_telemetry \
             WHERE segment_id = $1 AND timestamp >= $2 AND timestamp < $3",
        )
        .bind(segment_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(SegmentSample {
                    axis_z_mg: r.try_get("axis_z_mg")?,
                    speed_kmh: r.try_get("speed_kmh")?,
                    is_loaded: r.try_get("is_loaded")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(Into::into)
    }

    async fn count_events_for_segment_on_day(
        &self,
        segment_id: i64,
        date: NaiveDate,
        severity: Option<Severity>,
    ) -> Result<i64, RepoError> {
        let (start, end) = day_bounds(date);
        let count = match severity {
            Some(sev) => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM roughness_events \
                     WHERE segment_id = $1 AND timestamp >= $2 AND timestamp < $3 \
                     AND severity = $4",
                )
                .bind(segment_id)
                .bind(start)
                .bind(end)
                .bind(sev.as_str())
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM roughness_events \
                     WHERE segment_id = $1 AND timestamp >= $2 AND timestamp < $3",
                )
                .bind(segment_id)
                .bind(start)
                .bind(end)
                .fetch_one(&self.pool)
                .await?
            }
        };
        Ok(count)
    }

    async fn upsert_segment_stats(&self, row: &SegmentDayStats) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO road_segment_stats (segment_id, date, total_passes, loaded_passes, \
             avg_speed_kmh, std_dev_z, iri_estimate, iri_category, event_count, \
             critical_event_count) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (segment_id, date) DO UPDATE SET \
             total_passes = EXCLUDED.total_passes, loaded_passes = EXCLUDED.loaded_passes, \
             avg_speed_kmh = EXCLUDED.avg_speed_kmh, std_dev_z = EXCLUDED.std_dev_z, \
             iri_estimate = EXCLUDED.iri_estimate, iri_category = EXCLUDED.iri_category, \
             event_count = EXCLUDED.event_count, \
             critical_event_count = EXCLUDED.critical_event_count",
        )
        .bind(row.segment_id)
        .bind(row.date)
        .bind(row.total_passes)
        .bind(row.loaded_passes)
        .bind(row.avg_speed_kmh)
        .bind(row.std_dev_z)
        .bind(row.iri_estimate)
        .bind(row.iri_category)
        .bind(row.event_count)
        .bind(row.critical_event_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_acquire_advisory_lock(&self, name: &str) -> Result<bool, RepoError> {
        let mut held = self.lock_conns.lock().await;
        if held.contains_key(name) {
            return Ok(false);
        }
        let mut conn = self.pool.acquire().await?;
        let locked: bool =
            sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1)::bigint)")
                .bind(name)
                .fetch_one(&mut *conn)
                .await?;
        if locked {
            held.insert(name.to_string(), conn);
        }
        Ok(locked)
    }

    async fn release_advisory_lock(&self, name: &str) -> Result<(), RepoError> {
        let mut held = self.lock_conns.lock().await;
        if let Some(mut conn) = held.remove(name) {
            sqlx::query("SELECT pg_advisory_unlock(hashtext($1)::bigint)")
                .bind(name)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }
}

// ── Spatial backend ───────────────────────────────────────────────────────────

/// Nearest-segment query delegated to PostGIS; `geography` casts make
/// `ST_DWithin` / `ST_Distance` geodesic.
pub struct PgSegmentLookup {
    pool: PgPool,
}

impl PgSegmentLookup {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SegmentLookup for PgSegmentLookup {
    async fn nearest_segment_within(
        &self,
        lat_deg: f64,
        lon_deg: f64,
        meters: f64,
    ) -> Result<Option<i64>, SpatialError> {
        sqlx::query_scalar::<_, i64>(
            "SELECT id FROM road_segments \
             WHERE ST_DWithin(geom, ST_SetSRID(ST_MakePoint($1, $2), 4326)::geography, $3) \
             ORDER BY ST_Distance(geom, ST_SetSRID(ST_MakePoint($1, $2), 4326)::geography) \
             LIMIT 1",
        )
        .bind(lon_deg)
        .bind(lat_deg)
        .bind(meters)
        .fetch_optional(&self.pool)
        .await
        .map_err(SpatialError::Unavailable)
    }
}

// ── In-memory mock (tests) ────────────────────────────────────────────────────

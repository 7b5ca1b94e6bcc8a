//! # aggregator
//!
//! Daily per-segment rollup. Once a day (02:00 local by default) the
//! aggregator walks every road segment, pulls the prior UTC day's
//! telemetry on it, and upserts one `RoadSegmentStats` row: pass counts,
//! mean speed, vertical-axis dispersion, the IRI estimate, and event
//! counts. Re-running a day recomputes the same row — last write wins.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate, NaiveTime, Utc};
use tracing::{debug, info, warn};

use crate::models::{SegmentDayStats, SegmentSample, Severity};
use crate::repository::{RepoError, TelemetryRepository};
use crate::roughness::{estimate_iri, std_dev, IriConfig};

pub const AGGREGATOR_LOCK: &str = "roadsense.aggregator";

/// Pure rollup of one segment-day.
pub fn compute_stats(
    segment_id: i64,
    date: NaiveDate,
    samples: &[SegmentSample],
    event_count: i64,
    critical_event_count: i64,
    iri: &IriConfig,
) -> SegmentDayStats {
    let total_passes = samples.len() as i64;
    let loaded_passes = samples
        .iter()
        .filter(|s| s.is_loaded == Some(true))
        .count() as i64;
    let avg_speed_kmh = if samples.is_empty() {
        0.0
    } else {
        samples.iter().map(|s| f64::from(s.speed_kmh)).sum::<f64>() / samples.len() as f64
    };

    let zs: Vec<f64> = samples
        .iter()
        .filter_map(|s| s.axis_z_mg.map(f64::from))
        .collect();
    let std_dev_z = std_dev(&zs);
    let (iri_estimate, category) = estimate_iri(&zs, avg_speed_kmh, iri);

    SegmentDayStats {
        segment_id,
        date,
        total_passes,
        loaded_passes,
        avg_speed_kmh,
        std_dev_z,
        iri_estimate,
        iri_category: category.as_str(),
        event_count,
        critical_event_count,
    }
}

pub struct StatsAggregator {
    repo: Arc<dyn TelemetryRepository>,
    iri: IriConfig,
}

impl StatsAggregator {
    pub fn new(repo: Arc<dyn TelemetryRepository>, iri: IriConfig) -> Self {
        Self { repo, iri }
    }

    /// Sleep-until-02:00 loop; each wakeup aggregates the prior UTC day.
    pub async fn run(self, aggregate_at: &str) {
        let (hour, minute) = parse_hhmm(aggregate_at).unwrap_or((2, 0));
        loop {
            tokio::time::sleep(until_next_local(hour, minute)).await;
            let Some(date) = Utc::now().date_naive().checked_sub_days(Days::new(1)) else {
                continue;
            };
            match self.aggregate_day(date).await {
                Ok(rows) => info!("aggregator: {date}: {rows} segment row(s) upserted"),
                Err(e) => warn!("aggregator: {date}: failed: {e}"),
            }
        }
    }

    /// Aggregate one day across all segments. Returns the number of rows
    /// upserted; 0 when another instance holds the lock.
    pub async fn aggregate_day(&self, date: NaiveDate) -> Result<usize, RepoError> {
        if !self.repo.try_acquire_advisory_lock(AGGREGATOR_LOCK).await? {
            debug!("aggregator: lock busy, skipping run");
            return Ok(0);
        }
        let result = self.aggregate_day_locked(date).await;
        if let Err(e) = self.repo.release_advisory_lock(AGGREGATOR_LOCK).await {
            warn!("aggregator: lock release failed: {e}");
        }
        result
    }

    async fn aggregate_day_locked(&self, date: NaiveDate) -> Result<usize, RepoError> {
        let mut upserted = 0usize;
        for segment_id in self.repo.list_road_segment_ids().await? {
            let samples = self
                .repo
                .list_telemetry_for_segment_on_day(segment_id, date)
                .await?;
            if samples.is_empty() {
                continue;
            }

            let event_count = self
                .repo
                .count_events_for_segment_on_day(segment_id, date, None)
                .await?;
            let critical_count = self
                .repo
                .count_events_for_segment_on_day(segment_id, date, Some(Severity::Critical))
                .await?;

            let row = compute_stats(
                segment_id,
                date,
                &samples,
                event_count,
                critical_count,
                &self.iri,
            );
            self.repo.upsert_segment_stats(&row).await?;
            upserted += 1;
        }
        Ok(upserted)
    }
}

fn parse_hhmm(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    (hour < 24 && minute < 60).then_some((hour, minute))
}

fn until_next_local(hour: u32, minute: u32) -> Duration {
    let now = chrono::Local::now().naive_local();
    let target_time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN);
    let mut next = now.date().and_time(target_time);
    if next <= now {
        next = next + chrono::Duration::days(1);
    }
    (next - now).to_std().unwrap_or(Duration::from_secs(60))
}

//! # detector
//!
//! Roughness event detection over unprocessed telemetry.
//!
//! A periodic task claims a batch of unprocessed rows in
//! `(truck_id, timestamp)` order and scans each truck's substream with a
//! small state machine: a run of samples whose |axisZ| exceeds the MEDIUM
//! threshold becomes one event carrying the peak accelerations and the
//! maximum severity seen. The scan itself is pure; the task around it
//! holds a repository advisory lock so concurrent instances cannot
//! double-process.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::counters::Counters;
use crate::models::{RoughnessEvent, Severity, TelemetrySample, EVENT_TYPE_ROUGH_ROAD};
use crate::repository::{RepoError, TelemetryRepository};

pub const DETECTOR_LOCK: &str = "roadsense.event_detector";

/// Severity thresholds on |axisZ|, milli-g. Strictly-greater comparisons:
/// a sample at exactly the MEDIUM threshold is quiet road.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub medium_mg: i32,
    pub high_mg: i32,
    pub critical_mg: i32,
}

impl Thresholds {
    pub fn classify(&self, abs_z_mg: i32) -> Option<Severity> {
        if abs_z_mg > self.critical_mg {
            Some(Severity::Critical)
        } else if abs_z_mg > self.high_mg {
            Some(Severity::High)
        } else if abs_z_mg > self.medium_mg {
            Some(Severity::Medium)
        } else {
            None
        }
    }
}

// ── Pure scan ─────────────────────────────────────────────────────────────────

struct OpenEvent {
    event: RoughnessEvent,
    last_ts: chrono::DateTime<chrono::Utc>,
}

fn abs_mg(v: Option<i16>) -> i32 {
    i32::from(v.unwrap_or(0)).abs()
}

fn open_event(sample: &TelemetrySample, severity: Severity) -> OpenEvent {
    OpenEvent {
        event: RoughnessEvent {
            timestamp: sample.timestamp,
            duration_ms: 0,
            truck_id: sample.truck_id,
            lat_e7: sample.lat_e7,
            lon_e7: sample.lon_e7,
            segment_id: sample.segment_id,
            event_type: EVENT_TYPE_ROUGH_ROAD,
            severity,
            peak_x_mg: abs_mg(sample.axis_x_mg),
            peak_y_mg: abs_mg(sample.axis_y_mg),
            peak_z_mg: abs_mg(sample.axis_z_mg),
            speed_kmh: sample.speed_kmh,
            is_loaded: sample.is_loaded,
        },
        last_ts: sample.timestamp,
    }
}

/// Scan samples (ordered by `(truck_id, timestamp)`) for roughness events.
///
/// Substreams are partitioned per truck: a run can never merge across a
/// truck boundary. A run still open when its substream ends is closed and
/// emitted; the next batch simply opens a fresh one.
pub fn scan_samples(samples: &[TelemetrySample], thresholds: &Thresholds) -> Vec<RoughnessEvent> {
    let mut events = Vec::new();
    let mut current: Option<OpenEvent> = None;
    let mut current_truck: Option<i64> = None;

    for sample in samples {
        if current_truck != Some(sample.truck_id) {
            if let Some(open) = current.take() {
                events.push(open.event);
            }
            current_truck = Some(sample.truck_id);
        }

        match thresholds.classify(abs_mg(sample.axis_z_mg)) {
            None => {
                if let Some(mut open) = current.take() {
                    // The quiet sample bounds the event.
                    open.event.duration_ms +=
                        (sample.timestamp - open.last_ts).num_milliseconds();
                    events.push(open.event);
                }
            }
            Some(sev) => match current.as_mut() {
                None => current = Some(open_event(sample, sev)),
                Some(open) => {
                    open.event.duration_ms +=
                        (sample.timestamp - open.last_ts).num_milliseconds();
                    open.event.peak_x_mg = open.event.peak_x_mg.max(abs_mg(sample.axis_x_mg));
                    open.event.peak_y_mg = open.event.peak_y_mg.max(abs_mg(sample.axis_y_mg));
                    open.event.peak_z_mg = open.event.peak_z_mg.max(abs_mg(sample.axis_z_mg));
                    open.event.severity = open.event.severity.max(sev);
                    open.last_ts = sample.timestamp;
                }
            },
        }
    }
    if let Some(open) = current.take() {
        events.push(open.event);
    }
    events
}

// ── Periodic task ─────────────────────────────────────────────────────────────

pub struct EventDetector {
    repo: Arc<dyn TelemetryRepository>,
    counters: Arc<Counters>,
    thresholds: Thresholds,
    batch_limit: i64,
}

impl EventDetector {
    pub fn new(
        repo: Arc<dyn TelemetryRepository>,
        counters: Arc<Counters>,
        thresholds: Thresholds,
        batch_limit: i64,
    ) -> Self {
        Self {
            repo,
            counters,
            thresholds,
            batch_limit,
        }
    }

    pub async fn run(self, interval_ms: u64) {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.detect_once().await {
                Ok(events) => {
                    if events > 0 {
                        info!("event detector: emitted {events} roughness event(s)");
                    }
                }
                Err(e) => warn!("event detector: batch failed: {e}"),
            }
        }
    }

    /// One detection pass. Returns the number of events emitted; 0 when
    /// another instance holds the lock or no rows are pending.
    pub async fn detect_once(&self) -> Result<usize, RepoError> {
        if !self.repo.try_acquire_advisory_lock(DETECTOR_LOCK).await? {
            debug!("event detector: lock busy, skipping tick");
            return Ok(0);
        }
        let result = self.process_batch().await;
        // Release regardless of batch outcome.
        if let Err(e) = self.repo.release_advisory_lock(DETECTOR_LOCK).await {
            warn!("event detector: lock release failed: {e}");
        }
        result
    }

    async fn process_batch(&self) -> Result<usize, RepoError> {
        let samples = self.repo.list_unprocessed_telemetry(self.batch_limit).await?;
        if samples.is_empty() {
            return Ok(0);
        }

        let events = scan_samples(&samples, &self.thresholds);
        if !events.is_empty() {
            self.repo.insert_roughness_events(&events).await?;
        }

        let ids: Vec<i64> = samples.iter().map(|s| s.id).collect();
        self.repo.mark_telemetry_processed(&ids).await?;

        Counters::incr(&self.counters.detector_batches);
        Counters::add(&self.counters.events_emitted, events.len() as u64);
        debug!(
            "event detector: {} sample(s) scanned, {} event(s)",
            samples.len(),
            events.len()
        );
        Ok(events.len())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::repository::mock::MockRepo;

    const THRESHOLDS: Thresholds = Thresholds {
        medium_mg: 2000,
        high_mg: 2500,
        critical_mg: 3500,
    };

    fn sample(id: i64, truck_id: i64, t_offset_ms: i64, axis_z: i16) -> TelemetrySample {
        TelemetrySample {
            id,
            truck_id,
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_000 + t_offset_ms).unwrap(),
            lat_e7: -263_102_210,
            lon_e7: 279_465_430,
            speed_kmh: 40,
            axis_x_mg: Some(100),
            axis_y_mg: Some(-150),
            axis_z_mg: Some(axis_z),
            segment_id: Some(5),
            is_loaded: Some(true),
        }
    }

    fn series(truck_id: i64, zs: &[i16]) -> Vec<TelemetrySample> {
        zs.iter()
            .enumerate()
            .map(|(i, &z)| sample(i as i64 + 1, truck_id, i as i64 * 1000, z))
            .collect()
    }

    #[test]
    fn classification_thresholds_are_strict() {
        assert_eq!(THRESHOLDS.classify(2000), None);
        assert_eq!(THRESHOLDS.classify(2001), Some(Severity::Medium));
        assert_eq!(THRESHOLDS.classify(2500), Some(Severity::Medium));
        assert_eq!(THRESHOLDS.classify(2501), Some(Severity::High));
        assert_eq!(THRESHOLDS.classify(3500), Some(Severity::High));
        assert_eq!(THRESHOLDS.classify(3501), Some(Severity::Critical));
    }

    #[test]
    fn detects_one_event_with_max_severity_and_peaks() {
        let samples = series(1, &[100, 2100, 2600, 3600, 2100, 0]);
        let events = scan_samples(&samples, &THRESHOLDS);

        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e.timestamp, samples[1].timestamp);
        assert_eq!(e.severity, Severity::Critical);
        assert_eq!(e.peak_z_mg, 3600);
        // Bounded by the closing quiet sample: t5 - t1.
        assert_eq!(e.duration_ms, 4000);
        assert_eq!(e.truck_id, 1);
        assert_eq!(e.segment_id, Some(5));
        assert_eq!(e.event_type, EVENT_TYPE_ROUGH_ROAD);
    }

    #[test]
    fn quiet_stream_yields_no_events() {
        let events = scan_samples(&series(1, &[0, 1500, -1900, 2000]), &THRESHOLDS);
        assert!(events.is_empty());
    }

    #[test]
    fn negative_accelerations_count_by_magnitude() {
        let events = scan_samples(&series(1, &[0, -3600, 0]), &THRESHOLDS);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::Critical);
        assert_eq!(events[0].peak_z_mg, 3600);
    }

    #[test]
    fn event_open_at_batch_end_is_closed_and_emitted() {
        let events = scan_samples(&series(1, &[2100, 2600]), &THRESHOLDS);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::High);
        assert_eq!(events[0].duration_ms, 1000);
    }

    #[test]
    fn separate_quiet_gaps_split_events() {
        let events = scan_samples(&series(1, &[2100, 0, 2600, 0]), &THRESHOLDS);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].severity, Severity::Medium);
        assert_eq!(events[1].severity, Severity::High);
    }

    #[test]
    fn runs_never_merge_across_trucks() {
        // Ordered by (truck_id, timestamp): truck 1 ends rough, truck 2
        // starts rough — these must be two events.
        let mut samples = series(1, &[0, 2600, 2600]);
        samples.extend(series(2, &[2600, 2600, 0]));
        let events = scan_samples(&samples, &THRESHOLDS);

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].truck_id, 1);
        assert_eq!(events[1].truck_id, 2);
        assert_eq!(events[0].duration_ms, 1000);
    }

    #[tokio::test]
    async fn detect_once_inserts_events_and_marks_processed() {
        let repo = Arc::new(MockRepo::default());
        *repo.unprocessed.lock().unwrap() = series(1, &[100, 2100, 2600, 3600, 2100, 0]);

        let detector = EventDetector::new(
            repo.clone(),
            Arc::new(Counters::default()),
            THRESHOLDS,
            1000,
        );
        let emitted = detector.detect_once().await.unwrap();

        assert_eq!(emitted, 1);
        assert_eq!(repo.events.lock().unwrap().len(), 1);
        assert_eq!(
            *repo.processed_ids.lock().unwrap(),
            vec![1, 2, 3, 4, 5, 6]
        );
        // Lock released for the next run.
        assert!(repo.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn detect_once_skips_when_lock_is_held() {
        let repo = Arc::new(MockRepo::default());
        *repo.unprocessed.lock().unwrap() = series(1, &[3600]);
        repo.locks.lock().unwrap().insert(DETECTOR_LOCK.to_string());

        let detector = EventDetector::new(
            repo.clone(),
            Arc::new(Counters::default()),
            THRESHOLDS,
            1000,
        );
        assert_eq!(detector.detect_once().await.unwrap(), 0);
        assert!(repo.events.lock().unwrap().is_empty());
        assert_eq!(repo.unprocessed.lock().unwrap().len(), 1);
    }
}

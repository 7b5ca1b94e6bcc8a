//! # ingest
//!
//! Per-packet orchestration: validate the announcing device, map IO
//! elements to named fields, snap each fix to a road segment, and persist
//! the batch with skip-duplicates semantics so device retransmits are
//! idempotent.

use std::sync::Arc;

use avl_types::{map_io, AvlPacket, AvlRecord};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::counters::Counters;
use crate::device_cache::DeviceCache;
use crate::models::NewTelemetry;
use crate::repository::{RepoError, TelemetryRepository};
use crate::segments::SegmentResolver;

#[derive(Debug, Error)]
pub enum IngestError {
    /// The identifier resolves to no registered truck. The session may
    /// stay open; nothing is persisted.
    #[error("unauthorized device: {0}")]
    UnauthorizedDevice(String),

    #[error(transparent)]
    Repository(#[from] RepoError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub records_processed: usize,
    pub records_skipped: usize,
}

pub struct IngestService {
    repo: Arc<dyn TelemetryRepository>,
    devices: DeviceCache,
    segments: SegmentResolver,
    counters: Arc<Counters>,
    max_future_skew: ChronoDuration,
    load_state_from_din1: bool,
}

impl IngestService {
    pub fn new(
        repo: Arc<dyn TelemetryRepository>,
        devices: DeviceCache,
        segments: SegmentResolver,
        counters: Arc<Counters>,
        max_future_skew_ms: i64,
        load_state_from_din1: bool,
    ) -> Self {
        Self {
            repo,
            devices,
            segments,
            counters,
            max_future_skew: ChronoDuration::milliseconds(max_future_skew_ms),
            load_state_from_din1,
        }
    }

    /// Ingest one decoded packet for the device that announced
    /// `identifier`. Per-record problems (duplicates, missing segment,
    /// future-skewed clock) are counted, never errors.
    pub async fn ingest(
        &self,
        packet: &AvlPacket,
        identifier: &str,
    ) -> Result<IngestOutcome, IngestError> {
        let truck = match self.devices.resolve(identifier).await? {
            Some(t) => t,
            None => {
                Counters::incr(&self.counters.unauthorized_packets);
                return Err(IngestError::UnauthorizedDevice(identifier.to_string()));
            }
        };

        let latest_valid = Utc::now() + self.max_future_skew;
        let mut rows = Vec::with_capacity(packet.records.len());
        let mut skewed = 0usize;
        for record in &packet.records {
            match self.build_row(truck.id, record, latest_valid).await {
                Some(row) => rows.push(row),
                None => skewed += 1,
            }
        }
        if skewed > 0 {
            Counters::add(&self.counters.records_skewed, skewed as u64);
            warn!(
                "device {identifier}: skipped {skewed} record(s) timestamped beyond the \
                 future-skew limit"
            );
        }

        let outcome = self.repo.insert_telemetry_batch(&rows, true).await?;
        Counters::add(&self.counters.records_inserted, outcome.inserted as u64);
        Counters::add(&self.counters.records_duplicate, outcome.skipped as u64);
        debug!(
            "device {identifier}: {} inserted, {} duplicate, {} skewed",
            outcome.inserted, outcome.skipped, skewed
        );

        Ok(IngestOutcome {
            records_processed: outcome.inserted,
            records_skipped: outcome.skipped + skewed,
        })
    }

    async fn build_row(
        &self,
        truck_id: i64,
        record: &AvlRecord,
        latest_valid: DateTime<Utc>,
    ) -> Option<NewTelemetry> {
        let timestamp = DateTime::<Utc>::from_timestamp_millis(record.timestamp_ms as i64)
            .filter(|ts| *ts <= latest_valid)?;

        let mapped = map_io(&record.io);
        let gps = &record.gps;

        // Segments only make sense for a real fix.
        let segment_id = if gps.satellites > 0 {
            self.segments.resolve(gps.lat_deg(), gps.lon_deg()).await
        } else {
            None
        };

        let is_loaded = if self.load_state_from_din1 {
            mapped.din1
        } else {
            None
        };

        Some(NewTelemetry {
            truck_id,
            timestamp,
            lat_e7: gps.lat_e7,
            lon_e7: gps.lon_e7,
            altitude_m: gps.altitude_m,
            speed_kmh: gps.speed_kmh as i32,
            heading_deg: gps.heading_deg as i16,
            satellites: gps.satellites as i16,
            axis_x_mg: mapped.axis_x_mg,
            axis_y_mg: mapped.axis_y_mg,
            axis_z_mg: mapped.axis_z_mg,
            ignition: mapped.ignition,
            movement: mapped.movement,
            external_voltage_mv: mapped.external_voltage_mv.map(i32::from),
            battery_voltage_mv: mapped.battery_voltage_mv.map(i32::from),
            din1: mapped.din1,
            din2: mapped.din2,
            ain1_mv: mapped.ain1_mv.map(i32::from),
            odometer_m: mapped.odometer_m.map(i64::from),
            gsm_signal: mapped.gsm_signal.map(i16::from),
            segment_id,
            is_loaded,
            raw_record: serde_json::to_value(record).unwrap_or(serde_json::Value::Null),
        })
    }
}

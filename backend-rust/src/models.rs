//! Persistent data model: trucks (read-only to the pipeline), telemetry
//! rows, derived roughness events and per-segment daily statistics.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize, Serializer};

/// 64-bit row ids overflow JavaScript numbers; surface them as strings.
pub fn i64_as_string<S: Serializer>(v: &i64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&v.to_string())
}

// ── Truck ─────────────────────────────────────────────────────────────────────

/// Truck lifecycle status. Owned by the administrative store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TruckStatus {
    Active,
    Maintenance,
    Retired,
}

impl TruckStatus {
    pub fn from_db(s: &str) -> Self {
        match s {
            "MAINTENANCE" => Self::Maintenance,
            "RETIRED" => Self::Retired,
            _ => Self::Active,
        }
    }
}

/// A registered fleet truck. `identifier` is exactly the string the device
/// announces on connect; it is unique and never reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Truck {
    pub id: i64,
    pub identifier: String,
    pub status: TruckStatus,
}

// ── Telemetry ─────────────────────────────────────────────────────────────────

/// One telemetry row to insert, built from a decoded AVL record.
#[derive(Debug, Clone, Serialize)]
pub struct NewTelemetry {
    pub truck_id: i64,
    pub timestamp: DateTime<Utc>,
    pub lat_e7: i32,
    pub lon_e7: i32,
    pub altitude_m: i16,
    pub speed_kmh: i32,
    pub heading_deg: i16,
    pub satellites: i16,
    pub axis_x_mg: Option<i16>,
    pub axis_y_mg: Option<i16>,
    pub axis_z_mg: Option<i16>,
    pub ignition: Option<bool>,
    pub movement: Option<bool>,
    pub external_voltage_mv: Option<i32>,
    pub battery_voltage_mv: Option<i32>,
    pub din1: Option<bool>,
    pub din2: Option<bool>,
    pub ain1_mv: Option<i32>,
    pub odometer_m: Option<i64>,
    pub gsm_signal: Option<i16>,
    pub segment_id: Option<i64>,
    pub is_loaded: Option<bool>,
    /// Decoded record retained verbatim for diagnostics.
    pub raw_record: serde_json::Value,
}

/// A stored telemetry row as the event detector claims it.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySample {
    #[serde(serialize_with = "i64_as_string")]
    pub id: i64,
    pub truck_id: i64,
    pub timestamp: DateTime<Utc>,
    pub lat_e7: i32,
    pub lon_e7: i32,
    pub speed_kmh: i32,
    pub axis_x_mg: Option<i16>,
    pub axis_y_mg: Option<i16>,
    pub axis_z_mg: Option<i16>,
    pub segment_id: Option<i64>,
    pub is_loaded: Option<bool>,
}

// ── Roughness events ──────────────────────────────────────────────────────────

/// Event severity, ordered LOW < MEDIUM < HIGH < CRITICAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

pub const EVENT_TYPE_ROUGH_ROAD: &str = "ROUGH_ROAD";

/// A derived roughness event: a maximal run of samples whose vertical
/// acceleration exceeded the detection thresholds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoughnessEvent {
    /// Timestamp of the first exceedance
    pub timestamp: DateTime<Utc>,
    pub duration_ms: i64,
    pub truck_id: i64,
    pub lat_e7: i32,
    pub lon_e7: i32,
    pub segment_id: Option<i64>,
    pub event_type: &'static str,
    /// Maximum severity observed across the event's samples
    pub severity: Severity,
    pub peak_x_mg: i32,
    pub peak_y_mg: i32,
    pub peak_z_mg: i32,
    pub speed_kmh: i32,
    pub is_loaded: Option<bool>,
}

// ── Segment statistics ────────────────────────────────────────────────────────

/// Telemetry projection the aggregator works from.
#[derive(Debug, Clone)]
pub struct SegmentSample {
    pub axis_z_mg: Option<i16>,
    pub speed_kmh: i32,
    pub is_loaded: Option<bool>,
}

/// One daily rollup row, unique on `(segment_id, date)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentDayStats {
    pub segment_id: i64,
    pub date: NaiveDate,
    pub total_passes: i64,
    pub loaded_passes: i64,
    pub avg_speed_kmh: f64,
    pub std_dev_z: f64,
    pub iri_estimate: f64,
    pub iri_category: &'static str,
    pub event_count: i64,
    pub critical_event_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_order_is_low_to_critical() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(Severity::High.max(Severity::Critical), Severity::Critical);
    }

    #[test]
    fn telemetry_ids_serialize_as_strings() {
        let sample = TelemetrySample {
            id: 9_007_199_254_740_993, // above 2^53
            truck_id: 1,
            timestamp: Utc::now(),
            lat_e7: 0,
            lon_e7: 0,
            speed_kmh: 0,
            axis_x_mg: None,
            axis_y_mg: None,
            axis_z_mg: None,
            segment_id: None,
            is_loaded: None,
        };
        let v = serde_json::to_value(&sample).unwrap();
        assert_eq!(v["id"], serde_json::json!("9007199254740993"));
    }
}

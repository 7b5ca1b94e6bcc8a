//! truck_sim.rs — per-truck motion and accelerometer model
//!
//! Each simulated truck drives a straight heading at a roughly constant
//! speed. The vertical accelerometer axis carries the ~1000 mG gravity
//! bias plus Gaussian road noise; every so often the truck crosses a
//! rough patch, which widens the noise enough to cross the backend's
//! MEDIUM/HIGH/CRITICAL detection thresholds for a few samples.

use avl_types::{AvlRecord, GpsElement, IoElement, IoValue, Priority};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::Deserialize;

/// Gravity bias on the vertical axis, milli-g.
const GRAVITY_MG: f64 = 1000.0;
/// Road noise on smooth haul road.
const SMOOTH_SIGMA_MG: f64 = 60.0;
/// Noise inside a rough patch; ~3500 mG excursions are routine.
const ROUGH_SIGMA_MG: f64 = 1600.0;
/// Mean samples between rough patches.
const MEAN_SAMPLES_BETWEEN_PATCHES: f64 = 120.0;

#[derive(Debug, Clone, Deserialize)]
pub struct TruckSpec {
    pub identifier: String,
    pub lat: f64,
    pub lon: f64,
    #[serde(default = "default_heading")]
    pub heading_deg: f64,
    #[serde(default = "default_speed")]
    pub speed_kmh: f64,
    #[serde(default)]
    pub loaded: bool,
}

fn default_heading() -> f64 {
    90.0
}

fn default_speed() -> f64 {
    40.0
}

pub struct TruckSim {
    pub spec: TruckSpec,
    lat: f64,
    lon: f64,
    odometer_m: u32,
    rough_remaining: u32,
    rng: StdRng,
}

impl TruckSim {
    pub fn new(spec: TruckSpec, seed: u64) -> Self {
        Self {
            lat: spec.lat,
            lon: spec.lon,
            odometer_m: 0,
            rough_remaining: 0,
            rng: StdRng::seed_from_u64(seed),
            spec,
        }
    }

    fn sample_normal(&mut self, mean: f64, sigma: f64) -> f64 {
        Normal::new(mean, sigma)
            .map(|n| n.sample(&mut self.rng))
            .unwrap_or(mean)
            .clamp(-16_000.0, 16_000.0)
    }

    /// Force the next `samples` ticks into a rough patch.
    pub fn inject_rough_patch(&mut self, samples: u32) {
        self.rough_remaining = self.rough_remaining.max(samples);
    }

    /// Advance the truck by `dt_s` seconds and emit one AVL record
    /// stamped `timestamp_ms`.
    pub fn tick(&mut self, dt_s: f64, timestamp_ms: u64) -> AvlRecord {
        let distance_m = self.spec.speed_kmh / 3.6 * dt_s;
        let heading_rad = self.spec.heading_deg.to_radians();
        self.lat += distance_m * heading_rad.cos() / 111_320.0;
        self.lon += distance_m * heading_rad.sin()
            / (111_320.0 * self.lat.to_radians().cos().max(0.01));
        self.odometer_m = self.odometer_m.wrapping_add(distance_m as u32);

        if self.rough_remaining == 0
            && self.rng.gen_bool(1.0 / MEAN_SAMPLES_BETWEEN_PATCHES)
        {
            self.rough_remaining = self.rng.gen_range(3..=8);
        }

        let sigma = if self.rough_remaining > 0 {
            self.rough_remaining -= 1;
            ROUGH_SIGMA_MG
        } else {
            SMOOTH_SIGMA_MG
        };
        let axis_z = self.sample_normal(GRAVITY_MG, sigma) as i16;
        let axis_x = self.sample_normal(0.0, sigma / 4.0) as i16;
        let axis_y = self.sample_normal(0.0, sigma / 4.0) as i16;

        let speed = (self.spec.speed_kmh + self.rng.gen_range(-3.0..3.0)).max(0.0) as u16;
        let voltage_mv = (27_500 + self.rng.gen_range(-400i32..400)) as u16;

        AvlRecord {
            timestamp_ms,
            priority: Priority::Low,
            gps: GpsElement {
                lon_e7: (self.lon * 1e7) as i32,
                lat_e7: (self.lat * 1e7) as i32,
                altitude_m: 1412,
                heading_deg: self.spec.heading_deg.rem_euclid(360.0) as u16,
                satellites: self.rng.gen_range(7..=14),
                speed_kmh: speed,
            },
            trigger_id: 0,
            io: vec![
                IoElement { id: 1, value: IoValue::U8(self.spec.loaded as u8) },
                IoElement { id: 239, value: IoValue::U8(1) },
                IoElement { id: 240, value: IoValue::U8((speed > 0) as u8) },
                IoElement { id: 21, value: IoValue::U8(self.rng.gen_range(2..=5)) },
                IoElement { id: 17, value: IoValue::U16(axis_x as u16) },
                IoElement { id: 18, value: IoValue::U16(axis_y as u16) },
                IoElement { id: 19, value: IoValue::U16(axis_z as u16) },
                IoElement { id: 66, value: IoValue::U16(voltage_mv) },
                IoElement { id: 67, value: IoValue::U16(4100) },
                IoElement { id: 16, value: IoValue::U32(self.odometer_m) },
            ],
        }
    }
}

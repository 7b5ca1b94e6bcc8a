//! # segments
//!
//! Segment resolver: snaps a GPS fix to the nearest road segment within
//! the configured proximity, through the spatial backend. Lookups are
//! cached under coordinates rounded to 4 decimal degrees (~11 m cells) so
//! a truck crawling along a segment reuses one answer.
//!
//! A spatial backend failure soft-fails to `None` — telemetry is persisted
//! without a segment, never rejected.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::repository::SegmentLookup;

/// Cache key: coordinates scaled to 1e-4 degree cells.
fn cell(lat_deg: f64, lon_deg: f64) -> (i32, i32) {
    ((lat_deg * 1e4).round() as i32, (lon_deg * 1e4).round() as i32)
}

struct FifoCache {
    map: HashMap<(i32, i32), Option<i64>>,
    order: VecDeque<(i32, i32)>,
    cap: usize,
}

impl FifoCache {
    fn insert(&mut self, key: (i32, i32), value: Option<i64>) {
        if self.map.insert(key, value).is_none() {
            self.order.push_back(key);
            while self.map.len() > self.cap {
                if let Some(victim) = self.order.pop_front() {
                    self.map.remove(&victim);
                }
            }
        }
    }
}

pub struct SegmentResolver {
    lookup: Arc<dyn SegmentLookup>,
    proximity_m: f64,
    cache: Mutex<FifoCache>,
}

impl SegmentResolver {
    pub fn new(lookup: Arc<dyn SegmentLookup>, proximity_m: f64, cache_cap: usize) -> Self {
        Self {
            lookup,
            proximity_m,
            cache: Mutex::new(FifoCache {
                map: HashMap::new(),
                order: VecDeque::new(),
                cap: cache_cap.max(1),
            }),
        }
    }

    /// Nearest segment id within the proximity, or `None` (no segment
    /// close enough, or backend down). Successful answers — including
    /// "no segment" — are cached; failures are not, so a recovering
    /// backend is observed immediately.
    pub async fn resolve(&self, lat_deg: f64, lon_deg: f64) -> Option<i64> {
        let key = cell(lat_deg, lon_deg);
        if let Some(hit) = self
            .cache
            .lock()
            .expect("segment cache poisoned")
            .map
            .get(&key)
        {
            return *hit;
        }

        match self
            .lookup
            .nearest_segment_within(lat_deg, lon_deg, self.proximity_m)
            .await
        {
            Ok(answer) => {
                self.cache
                    .lock()
                    .expect("segment cache poisoned")
                    .insert(key, answer);
                answer
            }
            Err(e) => {
                warn!("segment lookup failed at ({lat_deg:.5}, {lon_deg:.5}): {e}");
                None
            }
        }
    }

    #[cfg(test)]
    fn cached(&self) -> usize {
        self.cache.lock().unwrap().map.len()
    }
}

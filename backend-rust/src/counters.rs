//! Process-wide operational counters, surfaced on `/health`.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counters {
    pub active_sessions: AtomicU64,
    pub packets_ingested: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub oversized_frames: AtomicU64,
    pub unauthorized_packets: AtomicU64,
    pub records_inserted: AtomicU64,
    pub records_duplicate: AtomicU64,
    pub records_skewed: AtomicU64,
    pub detector_batches: AtomicU64,
    pub events_emitted: AtomicU64,
}

impl Counters {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub fn decr(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        serde_json::json!({
            "activeSessions": get(&self.active_sessions),
            "packetsIngested": get(&self.packets_ingested),
            "packetsDropped": get(&self.packets_dropped),
            "oversizedFrames": get(&self.oversized_frames),
            "unauthorizedPackets": get(&self.unauthorized_packets),
            "recordsInserted": get(&self.records_inserted),
            "recordsDuplicate": get(&self.records_duplicate),
            "recordsSkewed": get(&self.records_skewed),
            "detectorBatches": get(&self.detector_batches),
            "eventsEmitted": get(&self.events_emitted),
        })
    }
}

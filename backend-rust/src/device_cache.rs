//! # device_cache
//!
//! Device validator: resolves the identifier a tracker announced into its
//! Truck record, with a process-wide TTL cache in front of the repository
//! so a chatty fleet does not hammer the trucks table.
//!
//! Negative results are cached too, on a short fixed TTL, so a rogue
//! device replaying an unknown identifier cannot hot-loop lookups.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::models::Truck;
use crate::repository::{RepoError, TelemetryRepository};

const NEGATIVE_TTL: Duration = Duration::from_secs(30);

struct Entry {
    truck: Option<Truck>,
    expires_at: Instant,
    last_used: Instant,
}

pub struct DeviceCache {
    repo: Arc<dyn TelemetryRepository>,
    inner: Mutex<HashMap<String, Entry>>,
    positive_ttl: Duration,
    cap: usize,
}

impl DeviceCache {
    pub fn new(repo: Arc<dyn TelemetryRepository>, positive_ttl: Duration, cap: usize) -> Self {
        Self {
            repo,
            inner: Mutex::new(HashMap::new()),
            positive_ttl,
            cap,
        }
    }

    /// Resolve an identifier to its Truck, or `None` for an unregistered
    /// device. At most one repository lookup per cache miss.
    pub async fn resolve(&self, identifier: &str) -> Result<Option<Truck>, RepoError> {
        if let Some(cached) = self.lookup(identifier) {
            return Ok(cached);
        }
        // The lock is not held across the repository call; two concurrent
        // misses on the same identifier may both consult the repository,
        // which is harmless.
        let truck = self.repo.find_truck_by_identifier(identifier).await?;
        self.store(identifier, truck.clone());
        Ok(truck)
    }

    fn lookup(&self, identifier: &str) -> Option<Option<Truck>> {
        let mut map = self.inner.lock().expect("device cache poisoned");
        let now = Instant::now();
        let expired = match map.get_mut(identifier) {
            Some(entry) if entry.expires_at > now => {
                entry.last_used = now;
                return Some(entry.truck.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            map.remove(identifier);
        }
        None
    }

    fn store(&self, identifier: &str, truck: Option<Truck>) {
        let mut map = self.inner.lock().expect("device cache poisoned");
        let now = Instant::now();
        if map.len() >= self.cap && !map.contains_key(identifier) {
            // Evict the least recently used entry.
            if let Some(oldest) = map
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                map.remove(&oldest);
            }
        }
        let ttl = if truck.is_some() {
            self.positive_ttl
        } else {
            NEGATIVE_TTL
        };
        map.insert(
            identifier.to_string(),
            Entry {
                truck,
                expires_at: now + ttl,
                last_used: now,
            },
        );
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::mock::MockRepo;

    #[tokio::test]
    async fn repository_consulted_once_per_ttl_window() {
        let repo = Arc::new(MockRepo::with_truck(7, "356307042441013"));
        let cache = DeviceCache::new(repo.clone(), Duration::from_secs(300), 16);

        for _ in 0..5 {
            assert!(cache.resolve("356307042441013").await.unwrap().is_some());
        }
        assert_eq!(*repo.truck_lookups.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn expired_entries_are_looked_up_again() {
        let repo = Arc::new(MockRepo::with_truck(7, "356307042441013"));
        let cache = DeviceCache::new(repo.clone(), Duration::from_millis(5), 16);

        assert!(cache.resolve("356307042441013").await.unwrap().is_some());
        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.resolve("356307042441013").await.unwrap().is_some());
        assert_eq!(*repo.truck_lookups.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn negative_results_are_cached() {
        let repo = Arc::new(MockRepo::default());
        let cache = DeviceCache::new(repo.clone(), Duration::from_secs(300), 16);

        assert!(cache.resolve("999999999999999").await.unwrap().is_none());
        assert!(cache.resolve("999999999999999").await.unwrap().is_none());
        assert_eq!(*repo.truck_lookups.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn evicts_least_recently_used_at_cap() {
        let repo = Arc::new(MockRepo::default());
        let cache = DeviceCache::new(repo.clone(), Duration::from_secs(300), 3);

        for id in ["a", "b", "c"] {
            let _ = cache.resolve(id).await.unwrap();
        }
        // Touch "a" so "b" becomes the LRU victim.
        let _ = cache.resolve("a").await.unwrap();
        let _ = cache.resolve("d").await.unwrap();
        assert_eq!(cache.len(), 3);

        let lookups_before = *repo.truck_lookups.lock().unwrap();
        let _ = cache.resolve("b").await.unwrap(); // evicted → repo hit
        let _ = cache.resolve("a").await.unwrap(); // still cached
        assert_eq!(*repo.truck_lookups.lock().unwrap(), lookups_before + 1);
    }
}

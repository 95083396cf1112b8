//! Process-local threshold cache with a fixed TTL
//!
//! Entries are replaced wholesale and never mutated in place. Threshold-set
//! calls do not invalidate the cache, so a changed threshold can be served
//! stale for up to one TTL window.

use crate::error::Result;
use crate::metrics::CACHE_LOOKUPS;
use crate::store::ThresholdStore;
use crate::types::MachineId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    value: f64,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_valid(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Hit/miss counters for one cache instance
#[derive(Default, Debug)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheMetrics {
    /// Lookups served from memory
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that went to the store
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        CACHE_LOOKUPS.with_label_values(&["hit"]).inc();
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        CACHE_LOOKUPS.with_label_values(&["miss"]).inc();
    }
}

/// TTL-bounded memo of per-machine thresholds
pub struct ThresholdCache {
    store: Arc<dyn ThresholdStore>,
    entries: DashMap<MachineId, CacheEntry>,
    ttl: Duration,
    metrics: CacheMetrics,
}

impl ThresholdCache {
    /// Cache in front of `store` holding entries for `ttl`
    pub fn new(store: Arc<dyn ThresholdStore>, ttl: Duration) -> Self {
        Self {
            store,
            entries: DashMap::new(),
            ttl,
            metrics: CacheMetrics::default(),
        }
    }

    /// Threshold for `machine_id`, read through to the store on miss or expiry
    pub async fn get(&self, machine_id: MachineId) -> Result<f64> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(&machine_id).map(|e| *e) {
            if entry.is_valid(now) {
                self.metrics.record_hit();
                return Ok(entry.value);
            }
        }

        self.metrics.record_miss();
        let value = self.store.get_threshold(machine_id).await?;
        self.entries.insert(
            machine_id,
            CacheEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
        debug!(machine_id, value, "Threshold cached");
        Ok(value)
    }

    /// Hit/miss counters
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }
}

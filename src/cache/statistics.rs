// Cache counters, broken down by eviction reason.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionReason {
    Expired,
    LruEviction,
    DependencyInvalidation,
    Explicit,
}

#[derive(Default)]
pub struct CacheStatistics {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    rejected_admissions: AtomicU64,
    evicted_expired: AtomicU64,
    evicted_lru: AtomicU64,
    evicted_invalidation: AtomicU64,
    evicted_explicit: AtomicU64,
    single_flight_waits: AtomicU64,
}

impl CacheStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insertion(&self) {
        self.insertions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_admission(&self) {
        self.rejected_admissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_single_flight_wait(&self) {
        self.single_flight_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self, reason: EvictionReason) {
        let counter = match reason {
            EvictionReason::Expired => &self.evicted_expired,
            EvictionReason::LruEviction => &self.evicted_lru,
            EvictionReason::DependencyInvalidation => &self.evicted_invalidation,
            EvictionReason::Explicit => &self.evicted_explicit,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Hit rate over all lookups so far; 0.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        }
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            rejected_admissions: self.rejected_admissions.load(Ordering::Relaxed),
            evicted_expired: self.evicted_expired.load(Ordering::Relaxed),
            evicted_lru: self.evicted_lru.load(Ordering::Relaxed),
            evicted_invalidation: self.evicted_invalidation.load(Ordering::Relaxed),
            evicted_explicit: self.evicted_explicit.load(Ordering::Relaxed),
            single_flight_waits: self.single_flight_waits.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub rejected_admissions: u64,
    pub evicted_expired: u64,
    pub evicted_lru: u64,
    pub evicted_invalidation: u64,
    pub evicted_explicit: u64,
    pub single_flight_waits: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = CacheStatistics::new();
        assert_eq!(stats.hit_rate(), 0.0);
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_eviction_reasons_tracked_separately() {
        let stats = CacheStatistics::new();
        stats.record_eviction(EvictionReason::Expired);
        stats.record_eviction(EvictionReason::LruEviction);
        stats.record_eviction(EvictionReason::LruEviction);
        let snap = stats.snapshot();
        assert_eq!(snap.evicted_expired, 1);
        assert_eq!(snap.evicted_lru, 2);
        assert_eq!(snap.evicted_invalidation, 0);
    }
}

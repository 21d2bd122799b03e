// Fingerprint-keyed result store.
//
// Admission runs through a pluggable policy (heuristic, scorer, or adaptive
// switching between them). Eviction is LRU among TTL-unexpired entries;
// expired entries are pruned lazily on access and during insertion sweeps.
// Concurrent misses on one fingerprint coalesce through single-flight slots.

use crate::cache::invalidation::DependencyIndex;
use crate::cache::statistics::{CacheStatistics, CacheStatsSnapshot, EvictionReason};
use crate::common::{Row, Schema, TableRef};
use crate::error::{EngineError, Result};
use crate::plan::Fingerprint;
use crate::resource::CancellationToken;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-query cache behaviour, carried in the submission context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CachePolicy {
    /// Read and populate.
    #[default]
    Use,
    /// Neither read nor populate.
    Bypass,
    /// Execute and populate, never read.
    PopulateOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheStrategy {
    Heuristic,
    Ml,
    Adaptive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_entry_bytes: usize,
    pub default_ttl: Duration,
    pub strategy: CacheStrategy,
    /// Heuristic admission: minimum estimated execution cost worth caching.
    pub cost_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: super::DEFAULT_MAX_ENTRIES,
            max_entry_bytes: super::DEFAULT_MAX_ENTRY_BYTES,
            default_ttl: Duration::from_secs(super::DEFAULT_TTL_SECS),
            strategy: CacheStrategy::Heuristic,
            cost_threshold: super::DEFAULT_COST_THRESHOLD,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(EngineError::Validation(
                "cache.max_entries must be greater than 0".into(),
            ));
        }
        if self.max_entry_bytes == 0 {
            return Err(EngineError::Validation(
                "cache.max_entry_bytes must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// A materialized, immutable query result shared by reference.
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub schema: Arc<Schema>,
    pub rows: Arc<Vec<Row>>,
}

impl CachedResult {
    pub fn new(schema: Arc<Schema>, rows: Vec<Row>) -> Self {
        Self {
            schema,
            rows: Arc::new(rows),
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.rows
            .iter()
            .map(|r| r.iter().map(|v| v.estimated_size()).sum::<usize>() + 24)
            .sum()
    }
}

struct CacheEntry {
    result: CachedResult,
    size_bytes: usize,
    created_at: Instant,
    last_access_at: Instant,
    ttl: Duration,
    access_count: u64,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

// ============================================================================
// Admission policies
// ============================================================================

/// Decides whether a computed result is worth keeping.
pub trait AdmissionPolicy: Send + Sync {
    fn admit(&self, cost: f64, size_bytes: usize, stats: &CacheStatistics) -> bool;
}

/// Cost-threshold heuristic: cache what was expensive to compute.
struct HeuristicPolicy {
    cost_threshold: f64,
}

impl AdmissionPolicy for HeuristicPolicy {
    fn admit(&self, cost: f64, _size_bytes: usize, _stats: &CacheStatistics) -> bool {
        cost >= self.cost_threshold
    }
}

/// Logistic score over normalized cost, size and current hit rate. Fixed
/// weights; the trait is the extension point for trained scorers.
struct ScorerPolicy {
    cost_weight: f64,
    size_weight: f64,
    hit_rate_weight: f64,
    bias: f64,
}

impl Default for ScorerPolicy {
    fn default() -> Self {
        Self {
            cost_weight: 2.0,
            size_weight: -1.5,
            hit_rate_weight: 1.0,
            bias: -0.5,
        }
    }
}

impl AdmissionPolicy for ScorerPolicy {
    fn admit(&self, cost: f64, size_bytes: usize, stats: &CacheStatistics) -> bool {
        let cost_norm = (cost / 10_000.0).min(1.0);
        let size_norm = (size_bytes as f64 / super::DEFAULT_MAX_ENTRY_BYTES as f64).min(1.0);
        let z = self.cost_weight * cost_norm
            + self.size_weight * size_norm
            + self.hit_rate_weight * stats.hit_rate()
            + self.bias;
        let score = 1.0 / (1.0 + (-z).exp());
        score > 0.5
    }
}

/// Starts heuristic; falls back to the scorer while the observed hit rate is
/// poor, and returns once it recovers.
struct AdaptivePolicy {
    heuristic: HeuristicPolicy,
    scorer: ScorerPolicy,
    using_scorer: AtomicBool,
    low_water: f64,
    high_water: f64,
}

impl AdmissionPolicy for AdaptivePolicy {
    fn admit(&self, cost: f64, size_bytes: usize, stats: &CacheStatistics) -> bool {
        let hit_rate = stats.hit_rate();
        let lookups = stats.snapshot().hits + stats.snapshot().misses;
        if lookups >= 64 {
            if hit_rate < self.low_water {
                self.using_scorer.store(true, Ordering::Relaxed);
            } else if hit_rate > self.high_water {
                self.using_scorer.store(false, Ordering::Relaxed);
            }
        }
        if self.using_scorer.load(Ordering::Relaxed) {
            self.scorer.admit(cost, size_bytes, stats)
        } else {
            self.heuristic.admit(cost, size_bytes, stats)
        }
    }
}

// ============================================================================
// Single flight
// ============================================================================

enum SlotState {
    Pending,
    /// Leader finished; `None` means it failed or was cancelled and the
    /// computation is up for grabs again.
    Done(Option<CachedResult>),
}

struct InflightSlot {
    state: Mutex<SlotState>,
    cv: Condvar,
}

pub enum FlightOutcome {
    Hit(CachedResult),
    /// This caller computes; completing or dropping the guard releases the
    /// slot.
    Lead(FlightGuard),
}

pub struct FlightGuard {
    cache: Arc<ResultCache>,
    fingerprint: Fingerprint,
    slot: Arc<InflightSlot>,
    completed: bool,
}

impl FlightGuard {
    /// Publish a computed result to waiters and (subject to admission) the
    /// cache.
    pub fn complete(
        mut self,
        result: CachedResult,
        dependencies: &[TableRef],
        cost: f64,
    ) {
        self.cache
            .insert(self.fingerprint, result.clone(), dependencies, cost);
        self.finish(Some(result));
    }

    fn finish(&mut self, outcome: Option<CachedResult>) {
        self.completed = true;
        self.cache.inflight.lock().remove(&self.fingerprint);
        let mut state = self.slot.state.lock();
        *state = SlotState::Done(outcome);
        self.slot.cv.notify_all();
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        // dropped without completing: cancelled or failed; release the slot
        // without populating so a follower can take over
        if !self.completed {
            self.finish(None);
        }
    }
}

// ============================================================================
// The cache
// ============================================================================

pub struct ResultCache {
    config: CacheConfig,
    entries: DashMap<Fingerprint, CacheEntry>,
    lru: Mutex<VecDeque<Fingerprint>>,
    dependencies: DependencyIndex,
    inflight: Mutex<HashMap<Fingerprint, Arc<InflightSlot>>>,
    stats: CacheStatistics,
    policy: Box<dyn AdmissionPolicy>,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let policy: Box<dyn AdmissionPolicy> = match config.strategy {
            CacheStrategy::Heuristic => Box::new(HeuristicPolicy {
                cost_threshold: config.cost_threshold,
            }),
            CacheStrategy::Ml => Box::new(ScorerPolicy::default()),
            CacheStrategy::Adaptive => Box::new(AdaptivePolicy {
                heuristic: HeuristicPolicy {
                    cost_threshold: config.cost_threshold,
                },
                scorer: ScorerPolicy::default(),
                using_scorer: AtomicBool::new(false),
                low_water: 0.2,
                high_water: 0.4,
            }),
        };
        Ok(Arc::new(Self {
            config,
            entries: DashMap::new(),
            lru: Mutex::new(VecDeque::new()),
            dependencies: DependencyIndex::new(),
            inflight: Mutex::new(HashMap::new()),
            stats: CacheStatistics::new(),
            policy,
        }))
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Plain lookup. Expired entries are pruned on the way.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CachedResult> {
        let expired = match self.entries.get_mut(fingerprint) {
            Some(mut entry) => {
                if entry.is_expired() {
                    true
                } else {
                    entry.last_access_at = Instant::now();
                    entry.access_count += 1;
                    let result = entry.result.clone();
                    drop(entry);
                    self.touch_lru(fingerprint);
                    self.stats.record_hit();
                    return Some(result);
                }
            }
            None => {
                self.stats.record_miss();
                return None;
            }
        };
        if expired {
            self.remove(fingerprint, EvictionReason::Expired);
        }
        self.stats.record_miss();
        None
    }

    /// Single-flight entry point: either a cache hit, or leadership of the
    /// computation for this fingerprint. Followers block until the leader
    /// finishes; a cancelled follower releases nothing and leaves the slot
    /// intact.
    pub fn get_or_lead(
        self: &Arc<Self>,
        fingerprint: Fingerprint,
        cancel: &CancellationToken,
    ) -> Result<FlightOutcome> {
        loop {
            if let Some(hit) = self.get(&fingerprint) {
                return Ok(FlightOutcome::Hit(hit));
            }
            let slot = {
                let mut inflight = self.inflight.lock();
                match inflight.get(&fingerprint) {
                    Some(slot) => Arc::clone(slot),
                    None => {
                        let slot = Arc::new(InflightSlot {
                            state: Mutex::new(SlotState::Pending),
                            cv: Condvar::new(),
                        });
                        inflight.insert(fingerprint, Arc::clone(&slot));
                        return Ok(FlightOutcome::Lead(FlightGuard {
                            cache: Arc::clone(self),
                            fingerprint,
                            slot,
                            completed: false,
                        }));
                    }
                }
            };
            self.stats.record_single_flight_wait();
            let mut state = slot.state.lock();
            loop {
                match &*state {
                    SlotState::Done(Some(result)) => {
                        self.stats.record_hit();
                        return Ok(FlightOutcome::Hit(result.clone()));
                    }
                    // leader failed or was cancelled: race to lead again
                    SlotState::Done(None) => break,
                    SlotState::Pending => {
                        cancel.check()?;
                        slot.cv
                            .wait_for(&mut state, Duration::from_millis(25));
                    }
                }
            }
        }
    }

    /// Insert subject to admission policy and size bounds, evicting LRU
    /// entries as needed.
    pub fn insert(
        &self,
        fingerprint: Fingerprint,
        result: CachedResult,
        dependencies: &[TableRef],
        cost: f64,
    ) {
        let size_bytes = result.size_bytes();
        if size_bytes > self.config.max_entry_bytes
            || !self.policy.admit(cost, size_bytes, &self.stats)
        {
            self.stats.record_rejected_admission();
            return;
        }

        self.prune_expired();
        while self.entries.len() >= self.config.max_entries {
            if !self.evict_lru() {
                break;
            }
        }

        let now = Instant::now();
        self.entries.insert(
            fingerprint,
            CacheEntry {
                result,
                size_bytes,
                created_at: now,
                last_access_at: now,
                ttl: self.config.default_ttl,
                access_count: 0,
            },
        );
        self.lru.lock().push_back(fingerprint);
        self.dependencies.register(fingerprint, dependencies);
        self.stats.record_insertion();
    }

    /// Invalidate every entry whose dependency set contains `table`.
    pub fn invalidate(&self, table: &TableRef) -> usize {
        let keys = self.dependencies.take_dependents(table);
        let mut removed = 0;
        for key in keys {
            if self.entries.remove(&key).is_some() {
                self.remove_from_lru(&key);
                self.stats
                    .record_eviction(EvictionReason::DependencyInvalidation);
                removed += 1;
            }
        }
        tracing::debug!(table = %table, removed, "cache invalidation");
        removed
    }

    pub fn invalidate_all(&self) {
        let count = self.entries.len();
        self.entries.clear();
        self.lru.lock().clear();
        self.dependencies.clear();
        for _ in 0..count {
            self.stats.record_eviction(EvictionReason::Explicit);
        }
    }

    /// Periodic maintenance: prune expired entries.
    pub fn prune_expired(&self) {
        let expired: Vec<Fingerprint> = self
            .entries
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| *e.key())
            .collect();
        for key in expired {
            self.remove(&key, EvictionReason::Expired);
        }
    }

    pub fn entry_size(&self, fingerprint: &Fingerprint) -> Option<usize> {
        self.entries.get(fingerprint).map(|e| e.size_bytes)
    }

    pub fn access_count(&self, fingerprint: &Fingerprint) -> Option<u64> {
        self.entries.get(fingerprint).map(|e| e.access_count)
    }

    fn remove(&self, fingerprint: &Fingerprint, reason: EvictionReason) {
        if self.entries.remove(fingerprint).is_some() {
            self.remove_from_lru(fingerprint);
            self.dependencies.forget(*fingerprint);
            self.stats.record_eviction(reason);
        }
    }

    /// Evict the least recently used unexpired entry. Expired entries found
    /// on the way are pruned as such.
    fn evict_lru(&self) -> bool {
        loop {
            let candidate = self.lru.lock().pop_front();
            let Some(key) = candidate else {
                return false;
            };
            let Some((_, entry)) = self.entries.remove(&key) else {
                continue; // stale queue entry
            };
            self.dependencies.forget(key);
            if entry.is_expired() {
                self.stats.record_eviction(EvictionReason::Expired);
            } else {
                self.stats.record_eviction(EvictionReason::LruEviction);
            }
            return true;
        }
    }

    fn touch_lru(&self, fingerprint: &Fingerprint) {
        let mut lru = self.lru.lock();
        lru.retain(|k| k != fingerprint);
        lru.push_back(*fingerprint);
    }

    fn remove_from_lru(&self, fingerprint: &Fingerprint) {
        self.lru.lock().retain(|k| k != fingerprint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Column, ColumnType, Value};
    use std::thread;

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![Column::new("x", ColumnType::Int64, false)]))
    }

    fn result(rows: usize) -> CachedResult {
        CachedResult::new(
            schema(),
            (0..rows).map(|i| vec![Value::Integer(i as i64)]).collect(),
        )
    }

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint([byte; 32])
    }

    fn cache(config: CacheConfig) -> Arc<ResultCache> {
        ResultCache::new(config).unwrap()
    }

    fn default_cache() -> Arc<ResultCache> {
        cache(CacheConfig {
            cost_threshold: 0.0,
            ..Default::default()
        })
    }

    #[test]
    fn test_hit_miss_counters() {
        let cache = default_cache();
        assert!(cache.get(&fp(1)).is_none());
        cache.insert(fp(1), result(3), &[TableRef::new("pg", "users")], 1_000.0);
        assert!(cache.get(&fp(1)).is_some());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_dependency_invalidation() {
        let cache = default_cache();
        let users = TableRef::new("pg", "users");
        cache.insert(fp(1), result(3), &[users.clone()], 1_000.0);
        cache.insert(fp(2), result(3), &[TableRef::new("pg", "orders")], 1_000.0);
        assert_eq!(cache.invalidate(&users), 1);
        assert!(cache.get(&fp(1)).is_none());
        assert!(cache.get(&fp(2)).is_some());
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let cache = cache(CacheConfig {
            max_entries: 2,
            cost_threshold: 0.0,
            ..Default::default()
        });
        cache.insert(fp(1), result(1), &[], 1_000.0);
        cache.insert(fp(2), result(1), &[], 1_000.0);
        // touch fp(1) so fp(2) is the LRU victim
        assert!(cache.get(&fp(1)).is_some());
        cache.insert(fp(3), result(1), &[], 1_000.0);
        assert!(cache.get(&fp(2)).is_none());
        assert!(cache.get(&fp(1)).is_some());
        assert_eq!(cache.stats().evicted_lru, 1);
    }

    #[test]
    fn test_heuristic_admission_rejects_cheap_queries() {
        let cache = cache(CacheConfig {
            cost_threshold: 500.0,
            ..Default::default()
        });
        cache.insert(fp(1), result(1), &[], 10.0);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().rejected_admissions, 1);
        cache.insert(fp(2), result(1), &[], 1_000.0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let cache = cache(CacheConfig {
            max_entry_bytes: 8,
            cost_threshold: 0.0,
            ..Default::default()
        });
        cache.insert(fp(1), result(100), &[], 1_000.0);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = cache(CacheConfig {
            default_ttl: Duration::from_millis(10),
            cost_threshold: 0.0,
            ..Default::default()
        });
        cache.insert(fp(1), result(1), &[], 1_000.0);
        thread::sleep(Duration::from_millis(30));
        assert!(cache.get(&fp(1)).is_none());
        assert_eq!(cache.stats().evicted_expired, 1);
    }

    #[test]
    fn test_single_flight_coalesces() {
        let cache = default_cache();
        let cancel = CancellationToken::new(None);
        let guard = match cache.get_or_lead(fp(1), &cancel).unwrap() {
            FlightOutcome::Lead(guard) => guard,
            FlightOutcome::Hit(_) => panic!("cold cache cannot hit"),
        };

        let cache2 = Arc::clone(&cache);
        let follower = thread::spawn(move || {
            let cancel = CancellationToken::new(None);
            match cache2.get_or_lead(fp(1), &cancel).unwrap() {
                FlightOutcome::Hit(result) => result.rows.len(),
                FlightOutcome::Lead(_) => panic!("follower must not lead"),
            }
        });
        thread::sleep(Duration::from_millis(50));
        guard.complete(result(7), &[], 1_000.0);
        assert_eq!(follower.join().unwrap(), 7);
        assert_eq!(cache.stats().single_flight_waits, 1);
    }

    #[test]
    fn test_cancelled_leader_releases_slot_without_populating() {
        let cache = default_cache();
        let cancel = CancellationToken::new(None);
        let guard = match cache.get_or_lead(fp(1), &cancel).unwrap() {
            FlightOutcome::Lead(guard) => guard,
            FlightOutcome::Hit(_) => panic!("cold cache cannot hit"),
        };
        drop(guard); // cancellation path
        assert!(cache.is_empty());
        // slot is free again: the next caller leads
        match cache.get_or_lead(fp(1), &cancel).unwrap() {
            FlightOutcome::Lead(_) => {}
            FlightOutcome::Hit(_) => panic!("nothing was populated"),
        }
    }
}

// # Monitor / Profiler
//
// Per-query operator and stage metrics plus rolling per-source statistics.
// There are no global mutable counters: the engine hands every operator a
// `Monitor` handle through the execution context, and publication happens as
// structured tracing events with bounded label cardinality.

use crate::common::QueryId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bound on distinct operator labels per query, to keep emission cardinality
/// in check.
const MAX_OPERATOR_LABELS: usize = 256;

/// Rolling window length per source.
const SOURCE_WINDOW: usize = 512;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperatorMetrics {
    pub rows_in: u64,
    pub rows_out: u64,
    pub wall_nanos: u64,
    pub peak_memory: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub errors: u64,
    /// Time this operator spent blocked waiting on its downstream consumer.
    pub blocked_nanos: u64,
}

impl OperatorMetrics {
    pub fn wall(&self) -> Duration {
        Duration::from_nanos(self.wall_nanos)
    }
}

/// One runtime adaptation, recorded for the profiler and the logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptationEvent {
    pub operator: String,
    pub from_strategy: String,
    pub to_strategy: String,
    pub reason: String,
    pub estimated_rows: u64,
    pub actual_rows: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SourceSample {
    pub response_nanos: u64,
    pub rows: u64,
    pub failed: bool,
}

/// Rolling per-source statistics shared across queries.
#[derive(Default)]
pub struct SourceHealth {
    windows: RwLock<HashMap<String, VecDeque<SourceSample>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStats {
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub error_rate: f64,
    pub rows_per_second: f64,
    pub samples: usize,
}

impl SourceHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, source: &str, sample: SourceSample) {
        let mut windows = self.windows.write();
        let window = windows.entry(source.to_string()).or_default();
        if window.len() >= SOURCE_WINDOW {
            window.pop_front();
        }
        window.push_back(sample);
    }

    pub fn stats(&self, source: &str) -> Option<SourceStats> {
        let windows = self.windows.read();
        let window = windows.get(source)?;
        if window.is_empty() {
            return None;
        }
        let mut latencies: Vec<u64> = window.iter().map(|s| s.response_nanos).collect();
        latencies.sort_unstable();
        let pct = |p: f64| {
            let idx = ((latencies.len() as f64 - 1.0) * p).round() as usize;
            Duration::from_nanos(latencies[idx])
        };
        let failures = window.iter().filter(|s| s.failed).count();
        let total_rows: u64 = window.iter().map(|s| s.rows).sum();
        let total_time: u64 = window.iter().map(|s| s.response_nanos).sum();
        Some(SourceStats {
            p50: pct(0.50),
            p95: pct(0.95),
            p99: pct(0.99),
            error_rate: failures as f64 / window.len() as f64,
            rows_per_second: if total_time == 0 {
                0.0
            } else {
                total_rows as f64 / (total_time as f64 / 1e9)
            },
            samples: window.len(),
        })
    }
}

/// Per-query monitor. Cheap to clone the handle (everything inside is
/// shared); dropped with the query.
pub struct Monitor {
    query_id: QueryId,
    operators: RwLock<HashMap<String, OperatorMetrics>>,
    stages: RwLock<Vec<(String, Duration)>>,
    adaptations: RwLock<Vec<AdaptationEvent>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    source_health: Arc<SourceHealth>,
    started: Instant,
}

impl Monitor {
    pub fn new(query_id: QueryId, source_health: Arc<SourceHealth>) -> Self {
        Self {
            query_id,
            operators: RwLock::new(HashMap::new()),
            stages: RwLock::new(Vec::new()),
            adaptations: RwLock::new(Vec::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            source_health,
            started: Instant::now(),
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    /// Update an operator's metrics in place. Labels beyond the cardinality
    /// bound fold into a shared overflow bucket.
    pub fn record_operator(&self, name: &str, update: impl FnOnce(&mut OperatorMetrics)) {
        let mut operators = self.operators.write();
        let key = if operators.len() >= MAX_OPERATOR_LABELS && !operators.contains_key(name) {
            "overflow".to_string()
        } else {
            name.to_string()
        };
        update(operators.entry(key).or_default());
    }

    pub fn record_stage(&self, stage: &str, duration: Duration) {
        tracing::debug!(
            query_id = self.query_id,
            stage,
            duration_us = duration.as_micros() as u64,
            "stage complete"
        );
        self.stages.write().push((stage.to_string(), duration));
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_adaptation(&self, event: AdaptationEvent) {
        tracing::info!(
            query_id = self.query_id,
            operator = %event.operator,
            from = %event.from_strategy,
            to = %event.to_strategy,
            reason = %event.reason,
            "adaptive execution switched strategy"
        );
        self.adaptations.write().push(event);
    }

    pub fn record_source_sample(&self, source: &str, sample: SourceSample) {
        self.source_health.record(source, sample);
    }

    pub fn source_stats(&self, source: &str) -> Option<SourceStats> {
        self.source_health.stats(source)
    }

    pub fn adaptations(&self) -> Vec<AdaptationEvent> {
        self.adaptations.read().clone()
    }

    pub fn cache_counters(&self) -> (u64, u64) {
        (
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
        )
    }

    pub fn operator_metrics(&self, name: &str) -> Option<OperatorMetrics> {
        self.operators.read().get(name).cloned()
    }

    /// Operators ranked by `own time × downstream blocked time`, worst first.
    /// The product surfaces operators that are both slow and starving their
    /// consumers.
    pub fn bottlenecks(&self) -> Vec<(String, f64)> {
        let operators = self.operators.read();
        let mut ranked: Vec<(String, f64)> = operators
            .iter()
            .map(|(name, m)| {
                let score = m.wall_nanos as f64 * (1.0 + m.blocked_nanos as f64);
                (name.clone(), score)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            query_id: self.query_id,
            elapsed: self.started.elapsed(),
            operators: self.operators.read().clone(),
            stages: self.stages.read().clone(),
            adaptations: self.adaptations.read().clone(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    pub query_id: QueryId,
    #[serde(skip)]
    pub elapsed: Duration,
    pub operators: HashMap<String, OperatorMetrics>,
    pub stages: Vec<(String, Duration)>,
    pub adaptations: Vec<AdaptationEvent>,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_metrics_accumulate() {
        let monitor = Monitor::new(1, Arc::new(SourceHealth::new()));
        monitor.record_operator("HashJoin#3", |m| {
            m.rows_out += 100;
            m.wall_nanos += 5_000;
        });
        monitor.record_operator("HashJoin#3", |m| m.rows_out += 50);
        let m = monitor.operator_metrics("HashJoin#3").unwrap();
        assert_eq!(m.rows_out, 150);
    }

    #[test]
    fn test_label_cardinality_bounded() {
        let monitor = Monitor::new(1, Arc::new(SourceHealth::new()));
        for i in 0..(MAX_OPERATOR_LABELS + 50) {
            monitor.record_operator(&format!("op{}", i), |m| m.rows_out += 1);
        }
        assert!(monitor.operators.read().len() <= MAX_OPERATOR_LABELS + 1);
        assert!(monitor.operator_metrics("overflow").is_some());
    }

    #[test]
    fn test_source_percentiles() {
        let health = Arc::new(SourceHealth::new());
        for i in 1..=100u64 {
            health.record(
                "pg",
                SourceSample {
                    response_nanos: i * 1_000_000,
                    rows: 10,
                    failed: i > 95,
                },
            );
        }
        let stats = health.stats("pg").unwrap();
        assert_eq!(stats.p50, Duration::from_millis(50));
        assert!(stats.error_rate > 0.04 && stats.error_rate < 0.06);
    }

    #[test]
    fn test_bottleneck_ranking() {
        let monitor = Monitor::new(1, Arc::new(SourceHealth::new()));
        monitor.record_operator("fast", |m| m.wall_nanos = 10);
        monitor.record_operator("slow", |m| {
            m.wall_nanos = 1_000_000;
            m.blocked_nanos = 500;
        });
        let ranked = monitor.bottlenecks();
        assert_eq!(ranked[0].0, "slow");
    }
}

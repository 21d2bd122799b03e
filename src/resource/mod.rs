// # Resource Manager
//
// Per-query budgets and admission control. Admission is a counting semaphore
// with a bounded FIFO queue; when several submitters are queued, the next
// slot goes to the earliest waiter among the submitters with the fewest
// running queries (fair share). Memory grants live for the duration of one
// query execution and are guaranteed to return to zero on every terminal
// transition, including cancellation.

use crate::error::{EngineError, Result};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub max_concurrent_queries: usize,
    pub per_query_memory_bytes: usize,
    /// Share of one core a query may consume before the governor starts
    /// handing out yield hints (0.0 disables throttling).
    pub per_query_cpu_share: f64,
    pub admission_queue_size: usize,
    pub default_query_timeout: Duration,
    /// Bound on how long cancellation may take to release resources.
    pub cancellation_grace: Duration,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_queries: 8,
            per_query_memory_bytes: 256 * 1024 * 1024,
            per_query_cpu_share: 1.0,
            admission_queue_size: 64,
            default_query_timeout: Duration::from_secs(30),
            cancellation_grace: Duration::from_secs(2),
        }
    }
}

impl ResourceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_queries == 0 {
            return Err(EngineError::Validation(
                "max_concurrent_queries must be greater than 0".into(),
            ));
        }
        if self.per_query_memory_bytes == 0 {
            return Err(EngineError::Validation(
                "per_query_memory_bytes must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation signal plus optional deadline. Operators check it
/// at every `next()` boundary and before blocking waits; timeouts are just
/// scheduled cancellations against the deadline.
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    pub fn new(deadline: Option<Instant>) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Remaining time until the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn check(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(EngineError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Memory tracking
// ============================================================================

/// Tracks one query's memory against its budget. Operators must reserve
/// before materializing and release on close; a failed reservation tells the
/// operator to spill or fail with `ResourceExhausted`.
pub struct MemoryTracker {
    budget: usize,
    used: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryTracker {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            used: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn try_reserve(&self, bytes: usize) -> Result<()> {
        let mut current = self.used.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.budget {
                return Err(EngineError::ResourceExhausted(format!(
                    "memory budget exceeded: {} + {} > {}",
                    current, bytes, self.budget
                )));
            }
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::SeqCst);
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release(&self, bytes: usize) {
        let mut current = self.used.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_sub(bytes);
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop all outstanding reservations. Used on terminal transitions so
    /// counters always return to their pre-admission values.
    pub fn release_all(&self) {
        self.used.store(0, Ordering::SeqCst);
    }
}

// ============================================================================
// CPU governor
// ============================================================================

/// Hands out cooperative yield hints when global CPU pressure crosses the
/// high-water mark. Pressure is the ratio of running queries to cores.
pub struct CpuGovernor {
    high_water: f64,
    cores: usize,
}

impl CpuGovernor {
    pub fn new(high_water: f64) -> Self {
        Self {
            high_water,
            cores: num_cpus::get().max(1),
        }
    }

    pub fn throttle_hint(&self, running_queries: usize) -> Option<Duration> {
        if self.high_water <= 0.0 {
            return None;
        }
        let pressure = running_queries as f64 / self.cores as f64;
        if pressure > self.high_water {
            Some(Duration::from_micros(
                (500.0 * (pressure - self.high_water)).min(5_000.0) as u64,
            ))
        } else {
            None
        }
    }
}

// ============================================================================
// Admission control
// ============================================================================

struct Waiter {
    ticket: u64,
    submitter: String,
}

struct AdmissionState {
    running: usize,
    queue: VecDeque<Waiter>,
    per_submitter_running: HashMap<String, usize>,
    next_ticket: u64,
}

pub struct ResourceManager {
    config: ResourceConfig,
    state: Mutex<AdmissionState>,
    admitted_cv: Condvar,
    governor: CpuGovernor,
}

impl ResourceManager {
    pub fn new(config: ResourceConfig) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            governor: CpuGovernor::new(config.per_query_cpu_share),
            config,
            state: Mutex::new(AdmissionState {
                running: 0,
                queue: VecDeque::new(),
                per_submitter_running: HashMap::new(),
                next_ticket: 0,
            }),
            admitted_cv: Condvar::new(),
        }))
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn running_queries(&self) -> usize {
        self.state.lock().running
    }

    pub fn queued_queries(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn throttle_hint(&self) -> Option<Duration> {
        self.governor.throttle_hint(self.running_queries())
    }

    /// Block until admitted or the timeout elapses. FIFO, with fair-share
    /// grouping: the next slot goes to the earliest waiter among the
    /// submitters currently running the fewest queries.
    pub fn admit(
        self: &Arc<Self>,
        submitter: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<QueryGrant> {
        let deadline = Instant::now() + timeout;
        let ticket = {
            let mut state = self.state.lock();
            if state.queue.len() >= self.config.admission_queue_size {
                return Err(EngineError::AdmissionQueueFull(state.queue.len()));
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.queue.push_back(Waiter {
                ticket,
                submitter: submitter.to_string(),
            });
            ticket
        };

        let mut state = self.state.lock();
        loop {
            cancel.check().inspect_err(|_| {
                state.queue.retain(|w| w.ticket != ticket);
            })?;
            if state.running < self.config.max_concurrent_queries
                && next_eligible_ticket(&state) == Some(ticket)
            {
                state.queue.retain(|w| w.ticket != ticket);
                state.running += 1;
                *state
                    .per_submitter_running
                    .entry(submitter.to_string())
                    .or_insert(0) += 1;
                tracing::debug!(submitter, "query admitted");
                return Ok(QueryGrant {
                    manager: Arc::clone(self),
                    submitter: submitter.to_string(),
                    memory: Arc::new(MemoryTracker::new(self.config.per_query_memory_bytes)),
                    released: AtomicBool::new(false),
                });
            }
            let wait = deadline.saturating_duration_since(Instant::now());
            if wait.is_zero() {
                state.queue.retain(|w| w.ticket != ticket);
                return Err(EngineError::AdmissionTimeout(timeout));
            }
            // bounded wait so cancellation stays responsive
            let step = wait.min(Duration::from_millis(50));
            self.admitted_cv.wait_for(&mut state, step);
        }
    }

    fn release_slot(&self, submitter: &str) {
        let mut state = self.state.lock();
        state.running = state.running.saturating_sub(1);
        if let Some(count) = state.per_submitter_running.get_mut(submitter) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.per_submitter_running.remove(submitter);
            }
        }
        drop(state);
        self.admitted_cv.notify_all();
    }
}

/// The earliest-queued waiter among submitters with the fewest running
/// queries. FIFO within the fair-share group.
fn next_eligible_ticket(state: &AdmissionState) -> Option<u64> {
    let min_running = state
        .queue
        .iter()
        .map(|w| {
            state
                .per_submitter_running
                .get(&w.submitter)
                .copied()
                .unwrap_or(0)
        })
        .min()?;
    state
        .queue
        .iter()
        .filter(|w| {
            state
                .per_submitter_running
                .get(&w.submitter)
                .copied()
                .unwrap_or(0)
                == min_running
        })
        .map(|w| w.ticket)
        .min()
}

/// Holds one admitted query's execution slot and memory budget. Dropping the
/// grant (normal completion, failure, or cancellation) releases both.
pub struct QueryGrant {
    manager: Arc<ResourceManager>,
    submitter: String,
    memory: Arc<MemoryTracker>,
    released: AtomicBool,
}

impl std::fmt::Debug for QueryGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryGrant")
            .field("submitter", &self.submitter)
            .field("released", &self.released)
            .finish()
    }
}

impl QueryGrant {
    pub fn memory(&self) -> Arc<MemoryTracker> {
        Arc::clone(&self.memory)
    }

    pub fn throttle_hint(&self) -> Option<Duration> {
        self.manager.throttle_hint()
    }
}

impl Drop for QueryGrant {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.memory.release_all();
            self.manager.release_slot(&self.submitter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn manager(max: usize, queue: usize) -> Arc<ResourceManager> {
        ResourceManager::new(ResourceConfig {
            max_concurrent_queries: max,
            admission_queue_size: queue,
            ..Default::default()
        })
        .unwrap()
    }

    fn token() -> CancellationToken {
        CancellationToken::new(None)
    }

    #[test]
    fn test_admission_within_limit() {
        let mgr = manager(2, 10);
        let g1 = mgr.admit("a", Duration::from_secs(1), &token()).unwrap();
        let _g2 = mgr.admit("a", Duration::from_secs(1), &token()).unwrap();
        assert_eq!(mgr.running_queries(), 2);
        drop(g1);
        assert_eq!(mgr.running_queries(), 1);
    }

    #[test]
    fn test_admission_timeout_when_full() {
        let mgr = manager(1, 10);
        let _g = mgr.admit("a", Duration::from_secs(1), &token()).unwrap();
        let err = mgr
            .admit("a", Duration::from_millis(80), &token())
            .unwrap_err();
        assert!(matches!(err, EngineError::AdmissionTimeout(_)));
        // the timed-out waiter must not leak a queue slot
        assert_eq!(mgr.queued_queries(), 0);
    }

    #[test]
    fn test_queue_bound() {
        let mgr = manager(1, 1);
        let _g = mgr.admit("a", Duration::from_secs(1), &token()).unwrap();
        let mgr2 = Arc::clone(&mgr);
        let blocked = thread::spawn(move || {
            let _ = mgr2.admit("b", Duration::from_millis(300), &token());
        });
        thread::sleep(Duration::from_millis(50));
        let err = mgr
            .admit("c", Duration::from_millis(50), &token())
            .unwrap_err();
        assert!(matches!(err, EngineError::AdmissionQueueFull(_)));
        blocked.join().unwrap();
    }

    #[test]
    fn test_fair_share_prefers_idle_submitter() {
        let mgr = manager(1, 10);
        let g = mgr.admit("busy", Duration::from_secs(1), &token()).unwrap();

        // "busy" queues first, but "idle" has fewer running queries
        let mgr_a = Arc::clone(&mgr);
        let busy_waiter = thread::spawn(move || {
            mgr_a
                .admit("busy", Duration::from_secs(2), &token())
                .map(|g| {
                    thread::sleep(Duration::from_millis(50));
                    drop(g);
                })
        });
        thread::sleep(Duration::from_millis(50));
        let mgr_b = Arc::clone(&mgr);
        let idle_waiter = thread::spawn(move || {
            let started = Instant::now();
            mgr_b
                .admit("idle", Duration::from_secs(2), &token())
                .map(|g| {
                    let waited = started.elapsed();
                    drop(g);
                    waited
                })
        });
        thread::sleep(Duration::from_millis(50));
        drop(g);
        // idle should be admitted before busy's second query
        let idle_wait = idle_waiter.join().unwrap().unwrap();
        busy_waiter.join().unwrap().unwrap();
        assert!(idle_wait < Duration::from_millis(500));
    }

    #[test]
    fn test_memory_budget_enforced() {
        let tracker = MemoryTracker::new(1_000);
        assert!(tracker.try_reserve(800).is_ok());
        assert!(matches!(
            tracker.try_reserve(300),
            Err(EngineError::ResourceExhausted(_))
        ));
        tracker.release(500);
        assert!(tracker.try_reserve(300).is_ok());
        assert_eq!(tracker.peak(), 800);
    }

    #[test]
    fn test_grant_drop_returns_counters_to_zero() {
        let mgr = manager(1, 10);
        let grant = mgr.admit("a", Duration::from_secs(1), &token()).unwrap();
        let memory = grant.memory();
        memory.try_reserve(1024).unwrap();
        drop(grant);
        assert_eq!(memory.used(), 0);
        assert_eq!(mgr.running_queries(), 0);
    }

    #[test]
    fn test_cancellation_token_deadline() {
        let token = CancellationToken::new(Some(Instant::now()));
        assert!(matches!(token.check(), Err(EngineError::Timeout)));

        let token = CancellationToken::new(None);
        assert!(token.check().is_ok());
        token.cancel();
        assert!(matches!(token.check(), Err(EngineError::Cancelled)));
    }
}

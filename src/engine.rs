// # Federated Query Engine
//
// The submission surface: `submit` / `poll` / `cancel`. Parse, security
// rewrite, optimization and federation planning run synchronously in
// `submit` so their errors surface to the caller immediately; admission and
// execution run on a per-query worker thread that streams batches back
// through the handle. Whole-query results coalesce through the cache's
// single-flight slots.

use crate::adapter::{SourceAdapter, SourceRegistry};
use crate::cache::{CachePolicy, CacheStatsSnapshot, CachedResult, FlightOutcome, ResultCache};
use crate::common::{Batch, QueryId, TableRef};
use crate::config::EngineConfig;
use crate::error::{EngineError, QueryFailure, Result};
use crate::execution::{
    ExecutionContext, ExecutionEngine, ExecutionMode, QueryOutput, QueryState,
};
use crate::federation::{FederationPlan, FederationPlanner};
use crate::monitoring::{Monitor, MonitorSnapshot, SourceHealth};
use crate::optimizer::Optimizer;
use crate::parser::QueryParser;
use crate::plan::{fingerprint, Fingerprint};
use crate::resource::{CancellationToken, MemoryTracker, ResourceManager};
use crate::security::{AccessLevel, AuditAction, AuditLog, Decision, Identity, SecurityEnforcer, SecurityPolicy};
use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A query, as submitted: SQL text or the JSON AST form.
#[derive(Debug, Clone)]
pub enum QueryInput {
    Sql(String),
    Ast(serde_json::Value),
}

/// Per-submission context from the caller.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub identity: Identity,
    /// Deadline override; clamped to the configured default for callers
    /// below admin level.
    pub timeout: Option<Duration>,
    /// Memory override; clamped likewise.
    pub memory_bytes: Option<usize>,
    pub cache_policy: CachePolicy,
    pub mode: ExecutionMode,
}

impl QueryContext {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            timeout: None,
            memory_bytes: None,
            cache_policy: CachePolicy::Use,
            mode: ExecutionMode::Standard,
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

enum QueryEvent {
    Batch(Batch),
    Done,
    Failed(QueryFailure),
}

struct QueryInner {
    id: QueryId,
    state: Mutex<QueryState>,
    cancel: CancellationToken,
    events: Receiver<QueryEvent>,
    monitor: Arc<Monitor>,
}

/// Opaque handle returned by `submit`.
#[derive(Clone)]
pub struct QueryHandle {
    inner: Arc<QueryInner>,
}

impl std::fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("id", &self.inner.id)
            .finish()
    }
}

impl QueryHandle {
    pub fn id(&self) -> QueryId {
        self.inner.id
    }

    pub fn state(&self) -> QueryState {
        *self.inner.state.lock()
    }

    pub fn monitor_snapshot(&self) -> MonitorSnapshot {
        self.inner.monitor.snapshot()
    }
}

/// One poll step: current status, possibly a batch, possibly the failure.
#[derive(Debug)]
pub struct PollResponse {
    pub status: QueryState,
    pub batch: Option<Batch>,
    pub error: Option<QueryFailure>,
}

pub struct FederatedQueryEngine {
    config: EngineConfig,
    registry: Arc<SourceRegistry>,
    cache: Arc<ResultCache>,
    resources: Arc<ResourceManager>,
    security: Arc<SecurityEnforcer>,
    source_health: Arc<SourceHealth>,
    next_query_id: AtomicU64,
    queries: Mutex<HashMap<QueryId, Arc<QueryInner>>>,
}

impl FederatedQueryEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(SourceRegistry::new());
        let cache = ResultCache::new(config.cache.clone())?;
        let resources = ResourceManager::new(config.resources.clone())?;
        let audit = Arc::new(AuditLog::new(config.audit_capacity, config.audit_enabled));
        let security = Arc::new(SecurityEnforcer::new(Arc::clone(&registry), audit));
        std::fs::create_dir_all(&config.spill_dir)
            .map_err(|e| EngineError::Internal(format!("spill dir: {}", e)))?;
        Ok(Self {
            config,
            registry,
            cache,
            resources,
            security,
            source_health: Arc::new(SourceHealth::new()),
            next_query_id: AtomicU64::new(1),
            queries: Mutex::new(HashMap::new()),
        })
    }

    pub fn register_source(&self, adapter: Arc<dyn SourceAdapter>) -> Result<()> {
        self.registry.register(adapter)
    }

    pub fn registry(&self) -> Arc<SourceRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn install_policy(&self, policy: SecurityPolicy) {
        self.security.install_policy(policy);
    }

    pub fn audit_log(&self) -> Arc<AuditLog> {
        self.security.audit_log()
    }

    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }

    pub fn source_health(&self) -> Arc<SourceHealth> {
        Arc::clone(&self.source_health)
    }

    // ------------------------------------------------------------------
    // Cache invalidation interface
    // ------------------------------------------------------------------

    /// Authoritative invalidation: callers emit this on writes to the
    /// underlying sources.
    pub fn invalidate(&self, table: &TableRef) -> usize {
        self.cache.invalidate(table)
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all()
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Parse, authorize, optimize and plan synchronously (those errors
    /// surface immediately, with no retry); then hand the plan to a worker
    /// for admission and execution.
    pub fn submit(&self, input: QueryInput, qctx: QueryContext) -> Result<QueryHandle> {
        let query_id = self.next_query_id.fetch_add(1, Ordering::SeqCst);
        let parser = QueryParser::new(Arc::clone(&self.registry));
        let parse_started = Instant::now();
        let plan = match &input {
            QueryInput::Sql(sql) => parser.parse(sql)?,
            QueryInput::Ast(ast) => parser.parse_json(ast)?,
        };

        let plan = self.security.authorize_plan(&plan, &qctx.identity)?;

        let optimizer = Optimizer::new(Arc::clone(&self.registry), self.config.optimizer.clone());
        let optimized = optimizer.optimize(&plan)?;

        let planner =
            FederationPlanner::new(Arc::clone(&self.registry), self.config.federation.clone());
        let fed_plan = planner.plan(&optimized)?;
        let root_fingerprint = fingerprint(&optimized)?;

        let timeout = self.effective_timeout(&qctx);
        let cancel = CancellationToken::new(Some(Instant::now() + timeout));
        let monitor = Arc::new(Monitor::new(query_id, Arc::clone(&self.source_health)));
        monitor.record_stage("plan", parse_started.elapsed());

        let (tx, rx) = unbounded();
        let inner = Arc::new(QueryInner {
            id: query_id,
            state: Mutex::new(QueryState::Queued),
            cancel: cancel.clone(),
            events: rx,
            monitor: Arc::clone(&monitor),
        });
        self.queries.lock().insert(query_id, Arc::clone(&inner));

        let worker = QueryWorker {
            query_id,
            fed_plan,
            root_fingerprint,
            qctx,
            timeout,
            cancel,
            monitor,
            inner: Arc::clone(&inner),
            tx,
            registry: Arc::clone(&self.registry),
            cache: Arc::clone(&self.cache),
            resources: Arc::clone(&self.resources),
            security: Arc::clone(&self.security),
            config: self.config.clone(),
        };
        std::thread::Builder::new()
            .name(format!("lakefed-query-{}", query_id))
            .spawn(move || worker.run())
            .map_err(|e| EngineError::Internal(format!("query worker: {}", e)))?;

        Ok(QueryHandle { inner })
    }

    pub fn poll(&self, handle: &QueryHandle) -> PollResponse {
        let inner = &handle.inner;
        match inner.events.try_recv() {
            Ok(QueryEvent::Batch(batch)) => PollResponse {
                status: *inner.state.lock(),
                batch: Some(batch),
                error: None,
            },
            Ok(QueryEvent::Done) => {
                self.queries.lock().remove(&inner.id);
                PollResponse {
                    status: *inner.state.lock(),
                    batch: None,
                    error: None,
                }
            }
            Ok(QueryEvent::Failed(failure)) => {
                self.queries.lock().remove(&inner.id);
                PollResponse {
                    status: *inner.state.lock(),
                    batch: None,
                    error: Some(failure),
                }
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => PollResponse {
                status: *inner.state.lock(),
                batch: None,
                error: None,
            },
        }
    }

    pub fn cancel(&self, handle: &QueryHandle) {
        handle.inner.cancel.cancel();
    }

    /// Submit and drain: convenience wrapper over submit/poll for embedded
    /// callers and tests.
    pub fn run(
        &self,
        input: QueryInput,
        qctx: QueryContext,
    ) -> std::result::Result<QueryOutput, QueryFailure> {
        let handle = self.submit(input, qctx).map_err(QueryFailure::from)?;
        let mut rows = Vec::new();
        let mut schema = None;
        loop {
            let response = self.poll(&handle);
            if let Some(batch) = response.batch {
                schema.get_or_insert_with(|| Arc::clone(&batch.schema));
                rows.extend(batch.rows);
                continue;
            }
            if let Some(failure) = response.error {
                return Err(failure);
            }
            if response.status.is_terminal() {
                // the state flips before the last events land; drain them
                loop {
                    match handle
                        .inner
                        .events
                        .recv_timeout(Duration::from_millis(100))
                    {
                        Ok(QueryEvent::Batch(batch)) => {
                            schema.get_or_insert_with(|| Arc::clone(&batch.schema));
                            rows.extend(batch.rows);
                        }
                        Ok(QueryEvent::Failed(failure)) => return Err(failure),
                        Ok(QueryEvent::Done) | Err(_) => break,
                    }
                }
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.queries.lock().remove(&handle.inner.id);
        match handle.state() {
            QueryState::Completed => Ok(QueryOutput {
                schema: schema.unwrap_or_else(|| Arc::new(crate::common::Schema::empty())),
                rows,
            }),
            QueryState::Cancelled => Err(QueryFailure::from(EngineError::Cancelled)),
            _ => Err(QueryFailure::from(EngineError::Internal(
                "query ended without a result".into(),
            ))),
        }
    }

    fn effective_timeout(&self, qctx: &QueryContext) -> Duration {
        let default = self.config.resources.default_query_timeout;
        match qctx.timeout {
            Some(requested) if qctx.identity.access_level >= AccessLevel::Admin => requested,
            // non-admin overrides may only shorten the deadline
            Some(requested) => requested.min(default),
            None => default,
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

struct QueryWorker {
    query_id: QueryId,
    fed_plan: FederationPlan,
    root_fingerprint: Fingerprint,
    qctx: QueryContext,
    timeout: Duration,
    cancel: CancellationToken,
    monitor: Arc<Monitor>,
    inner: Arc<QueryInner>,
    tx: Sender<QueryEvent>,
    registry: Arc<SourceRegistry>,
    cache: Arc<ResultCache>,
    resources: Arc<ResourceManager>,
    security: Arc<SecurityEnforcer>,
    config: EngineConfig,
}

impl QueryWorker {
    fn set_state(&self, state: QueryState) {
        *self.inner.state.lock() = state;
    }

    fn run(self) {
        match self.execute() {
            Ok(output) => {
                self.set_state(QueryState::Completed);
                for chunk in output.rows.chunks(self.config.batch_size.max(1)) {
                    let _ = self.tx.send(QueryEvent::Batch(Batch::new(
                        Arc::clone(&output.schema),
                        chunk.to_vec(),
                    )));
                }
                let _ = self.tx.send(QueryEvent::Done);
            }
            Err(err) => {
                let state = match err {
                    EngineError::Cancelled | EngineError::Timeout => QueryState::Cancelled,
                    _ => QueryState::Failed,
                };
                self.set_state(state);
                tracing::debug!(
                    query_id = self.query_id,
                    error = %err,
                    code = err.code(),
                    "query did not complete"
                );
                let _ = self.tx.send(QueryEvent::Failed(QueryFailure::from(err)));
            }
        }
    }

    fn execute(&self) -> Result<QueryOutput> {
        // Queued → Admitted
        let grant = self.resources.admit(
            &self.qctx.identity.subject,
            self.timeout,
            &self.cancel,
        )?;
        self.set_state(QueryState::Admitted);

        let memory = self.effective_memory(&grant.memory());
        let ctx = ExecutionContext {
            query_id: self.query_id,
            identity: self.qctx.identity.clone(),
            monitor: Arc::clone(&self.monitor),
            memory: Arc::clone(&memory),
            cancel: self.cancel.clone(),
            mode: self.qctx.mode,
            adaptive: self.config.adaptive,
            batch_size: self.config.batch_size,
            seed: self.root_fingerprint.short(),
            spill_dir: self.config.spill_dir.clone(),
            throttle: self.resources.throttle_hint(),
        };

        // Admitted → Running
        self.set_state(QueryState::Running);
        self.security.audit_log().record(
            &self.qctx.identity,
            "query",
            AuditAction::Query,
            Decision::Allow,
        );

        let result = self.execute_with_cache(&ctx);

        // resources release on every terminal path; the grant's drop
        // releases the admission slot
        memory.release_all();
        drop(grant);
        result
    }

    fn execute_with_cache(&self, ctx: &ExecutionContext) -> Result<QueryOutput> {
        let engine = ExecutionEngine::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.cache),
            self.config.federation.partitions,
            self.config.optimizer.default_row_estimate,
        );

        match self.qctx.cache_policy {
            CachePolicy::Bypass => {
                let output = engine.execute(&self.fed_plan, ctx)?;
                self.finish(output, ctx)
            }
            CachePolicy::PopulateOnly => {
                let output = engine.execute(&self.fed_plan, ctx)?;
                let output = self.finish(output, ctx)?;
                self.cache.insert(
                    self.root_fingerprint,
                    CachedResult::new(Arc::clone(&output.schema), output.rows.clone()),
                    &self.fed_plan.dependencies,
                    self.fed_plan.estimated_cost.total(),
                );
                Ok(output)
            }
            CachePolicy::Use => {
                match self.cache.get_or_lead(self.root_fingerprint, &self.cancel)? {
                    FlightOutcome::Hit(hit) => {
                        ctx.monitor.record_cache_hit();
                        Ok(QueryOutput {
                            schema: hit.schema,
                            rows: hit.rows.as_ref().clone(),
                        })
                    }
                    FlightOutcome::Lead(guard) => {
                        ctx.monitor.record_cache_miss();
                        let output = engine.execute(&self.fed_plan, ctx)?;
                        let output = self.finish(output, ctx)?;
                        guard.complete(
                            CachedResult::new(Arc::clone(&output.schema), output.rows.clone()),
                            &self.fed_plan.dependencies,
                            self.fed_plan.estimated_cost.total(),
                        );
                        Ok(output)
                    }
                }
            }
        }
    }

    /// Terminal checks shared by all cache paths: the enforcer re-validates
    /// that no operator unmasked a column.
    fn finish(&self, output: QueryOutput, _ctx: &ExecutionContext) -> Result<QueryOutput> {
        self.security
            .validate_output(&output.schema, &self.qctx.identity)?;
        Ok(output)
    }

    fn effective_memory(&self, granted: &Arc<MemoryTracker>) -> Arc<MemoryTracker> {
        match self.qctx.memory_bytes {
            Some(requested) => {
                let budget = if self.qctx.identity.access_level >= AccessLevel::Admin {
                    requested
                } else {
                    requested.min(self.config.resources.per_query_memory_bytes)
                };
                Arc::new(MemoryTracker::new(budget))
            }
            None => Arc::clone(granted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{MemoryAdapter, SourceKind};
    use crate::common::{Column, ColumnType, Schema, Value};

    fn engine() -> FederatedQueryEngine {
        let engine = FederatedQueryEngine::new(EngineConfig::default()).unwrap();
        let pg = MemoryAdapter::new("pg", SourceKind::Relational);
        pg.add_table(
            "users",
            Schema::new(vec![
                Column::new("id", ColumnType::Int64, false),
                Column::new("age", ColumnType::Int64, true),
            ]),
            (0..100)
                .map(|i| vec![Value::Integer(i), Value::Integer(20 + (i % 30))])
                .collect(),
        );
        engine.register_source(Arc::new(pg)).unwrap();
        engine
    }

    fn identity() -> Identity {
        Identity::new("tester", AccessLevel::Read)
    }

    #[test]
    fn test_submit_poll_complete() {
        let engine = engine();
        let output = engine
            .run(
                QueryInput::Sql("SELECT id FROM users WHERE age > 45".into()),
                QueryContext::new(identity()),
            )
            .unwrap();
        // ages cycle 20..49; age > 45 keeps 4 of each full cycle of 30
        assert_eq!(output.rows.len(), 12);
    }

    #[test]
    fn test_parse_errors_surface_synchronously() {
        let engine = engine();
        let err = engine
            .submit(
                QueryInput::Sql("SELEKT 1".into()),
                QueryContext::new(identity()),
            )
            .err()
            .expect("parse error");
        assert!(matches!(err, EngineError::Parse { .. }));
    }

    #[test]
    fn test_cancel_before_poll() {
        let engine = engine();
        let handle = engine
            .submit(
                QueryInput::Sql("SELECT id FROM users".into()),
                QueryContext::new(identity()),
            )
            .unwrap();
        engine.cancel(&handle);
        // resources must come back within the configured cancellation bound
        let grace = EngineConfig::default().resources.cancellation_grace;
        let deadline = Instant::now() + grace;
        while !handle.state().is_terminal() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(handle.state().is_terminal());
    }

    #[test]
    fn test_cache_round_trip_and_invalidation() {
        let engine = engine();
        let sql = "SELECT id FROM users WHERE age > 45";
        let qctx = || QueryContext::new(identity());

        let first = engine.run(QueryInput::Sql(sql.into()), qctx()).unwrap();
        let stats_after_first = engine.cache_stats();
        let second = engine.run(QueryInput::Sql(sql.into()), qctx()).unwrap();
        let stats_after_second = engine.cache_stats();
        assert_eq!(first.rows, second.rows);
        assert!(stats_after_second.hits > stats_after_first.hits);

        engine.invalidate(&TableRef::new("pg", "users"));
        let third = engine.run(QueryInput::Sql(sql.into()), qctx()).unwrap();
        assert_eq!(first.rows, third.rows);
        let final_stats = engine.cache_stats();
        assert!(final_stats.evicted_invalidation >= 1);
        assert!(final_stats.misses > stats_after_second.misses);
    }

    #[test]
    fn test_json_ast_submission() {
        let engine = engine();
        let parser = QueryParser::new(engine.registry());
        let plan = parser.parse("SELECT id FROM users WHERE age > 45").unwrap();
        let ast = parser.print(&plan).unwrap();
        let output = engine
            .run(QueryInput::Ast(ast), QueryContext::new(identity()))
            .unwrap();
        assert_eq!(output.rows.len(), 12);
    }
}

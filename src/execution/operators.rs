// Scan, filter, project, limit, union and inline-result operators. The scan
// operator is the adapter boundary: it dispatches a subplan, retries
// transient failures with bounded exponential backoff, and optionally
// prefetches concurrently with sibling dispatches.

use crate::adapter::{BatchStream, SourceAdapter};
use crate::cache::{CachedResult, ResultCache};
use crate::common::{Batch, Row, Schema, TableRef, Value};
use crate::error::{EngineError, Result};
use crate::execution::expressions::ExpressionEvaluator;
use crate::execution::{ExecutionContext, Operator};
use crate::monitoring::SourceSample;
use crate::plan::{Expr, Fingerprint, LogicalPlan};
use crossbeam::channel::{bounded, Receiver};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Retry budget for transient adapter errors, always bounded by the query
/// deadline.
const MAX_DISPATCH_ATTEMPTS: u32 = 5;
const RETRY_BASE: Duration = Duration::from_millis(50);
const RETRY_CAP: Duration = Duration::from_secs(2);

/// Execute a subplan on an adapter, retrying transient failures with
/// jittered exponential backoff until the attempt budget or the query
/// deadline runs out.
pub fn execute_with_retry(
    adapter: &Arc<dyn SourceAdapter>,
    plan: &LogicalPlan,
    ctx: &ExecutionContext,
) -> Result<Box<dyn BatchStream>> {
    let source = adapter.descriptor().id;
    let mut backoff = RETRY_BASE;
    for attempt in 1..=MAX_DISPATCH_ATTEMPTS {
        ctx.cancel.check()?;
        let started = Instant::now();
        match adapter.execute(plan) {
            Ok(stream) => {
                ctx.monitor.record_source_sample(
                    &source,
                    SourceSample {
                        response_nanos: started.elapsed().as_nanos() as u64,
                        rows: 0,
                        failed: false,
                    },
                );
                return Ok(stream);
            }
            Err(err) if err.transient() && attempt < MAX_DISPATCH_ATTEMPTS => {
                ctx.monitor.record_source_sample(
                    &source,
                    SourceSample {
                        response_nanos: started.elapsed().as_nanos() as u64,
                        rows: 0,
                        failed: true,
                    },
                );
                let jitter = rand::rng().random_range(0.75..1.25);
                let mut sleep = backoff.mul_f64(jitter).min(RETRY_CAP);
                if let Some(remaining) = ctx.cancel.remaining() {
                    if remaining.is_zero() {
                        return Err(EngineError::Timeout);
                    }
                    sleep = sleep.min(remaining);
                }
                tracing::debug!(
                    source = %source,
                    attempt,
                    backoff_ms = sleep.as_millis() as u64,
                    error = %err,
                    "transient adapter error; retrying"
                );
                std::thread::sleep(sleep);
                backoff = (backoff * 2).min(RETRY_CAP);
            }
            Err(err) => {
                ctx.monitor.record_source_sample(
                    &source,
                    SourceSample {
                        response_nanos: started.elapsed().as_nanos() as u64,
                        rows: 0,
                        failed: true,
                    },
                );
                return Err(err);
            }
        }
    }
    Err(EngineError::adapter(
        source,
        crate::error::AdapterErrorKind::Timeout,
        "retry budget exhausted",
    ))
}

enum ScanSource {
    /// Stream pulled inline on `next()`.
    Inline(Option<Box<dyn BatchStream>>),
    /// Batches prefetched by a dispatch thread.
    Prefetch {
        receiver: Option<Receiver<Result<Batch>>>,
        worker: Option<JoinHandle<()>>,
    },
}

/// The adapter boundary operator. Dispatches `plan` to `adapter`; applies a
/// residual predicate/projection locally when the source could not take them
/// natively.
pub struct ScanExec {
    label: String,
    adapter: Arc<dyn SourceAdapter>,
    plan: Arc<LogicalPlan>,
    schema: Arc<Schema>,
    local_predicate: Option<Expr>,
    /// Indices into the dispatched stream's schema, when projecting locally.
    local_projection: Option<Vec<String>>,
    concurrent: bool,
    source: ScanSource,
}

impl ScanExec {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        plan: Arc<LogicalPlan>,
        schema: Arc<Schema>,
        local_predicate: Option<Expr>,
        local_projection: Option<Vec<String>>,
        concurrent: bool,
    ) -> Self {
        let label = format!("Scan({})", adapter.descriptor().id);
        Self {
            label,
            adapter,
            plan,
            schema,
            local_predicate,
            local_projection,
            concurrent,
            source: ScanSource::Inline(None),
        }
    }

    fn pull(&mut self, ctx: &ExecutionContext) -> Result<Option<Batch>> {
        match &mut self.source {
            ScanSource::Inline(stream) => match stream {
                Some(s) => s.next_batch(),
                None => Ok(None),
            },
            ScanSource::Prefetch { receiver, .. } => {
                let Some(rx) = receiver else { return Ok(None) };
                loop {
                    ctx.checkpoint()?;
                    match rx.recv_timeout(Duration::from_millis(25)) {
                        Ok(item) => return item.map(Some),
                        Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                            // waiting on the source: a backpressure incident
                            ctx.monitor.record_operator(&self.label, |m| {
                                m.blocked_nanos +=
                                    Duration::from_millis(25).as_nanos() as u64;
                            });
                            continue;
                        }
                        Err(crossbeam::channel::RecvTimeoutError::Disconnected) => {
                            return Ok(None)
                        }
                    }
                }
            }
        }
    }

    fn apply_residual(&mut self, batch: Batch, ctx: &ExecutionContext) -> Result<Batch> {
        let incoming_schema = Arc::clone(&batch.schema);
        let mut rows = batch.rows;
        if let Some(pred) = &self.local_predicate {
            let evaluator = ExpressionEvaluator::new(Arc::clone(&incoming_schema));
            let mut kept = Vec::with_capacity(rows.len());
            for row in rows {
                ctx.cancel.check()?;
                if evaluator.evaluate_predicate(pred, &row)? {
                    kept.push(row);
                }
            }
            rows = kept;
        }
        if let Some(names) = &self.local_projection {
            let mut indices = Vec::with_capacity(names.len());
            for name in names {
                let idx = incoming_schema.index_of(name).ok_or_else(|| {
                    EngineError::Execution(format!(
                        "projected column '{}' missing from source stream",
                        name
                    ))
                })?;
                indices.push(idx);
            }
            rows = rows
                .into_iter()
                .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
                .collect();
        }
        Ok(Batch::new(Arc::clone(&self.schema), rows))
    }
}

impl Operator for ScanExec {
    fn name(&self) -> String {
        self.label.clone()
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.schema)
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        if self.concurrent {
            let (tx, rx) = bounded::<Result<Batch>>(4);
            let adapter = Arc::clone(&self.adapter);
            let plan = Arc::clone(&self.plan);
            let cancel = ctx.cancel.clone();
            let thread_ctx = ExecutionContext {
                query_id: ctx.query_id,
                identity: ctx.identity.clone(),
                monitor: Arc::clone(&ctx.monitor),
                memory: Arc::clone(&ctx.memory),
                cancel: cancel.clone(),
                mode: ctx.mode,
                adaptive: ctx.adaptive,
                batch_size: ctx.batch_size,
                seed: ctx.seed,
                spill_dir: ctx.spill_dir.clone(),
                throttle: None,
            };
            let worker = std::thread::Builder::new()
                .name("lakefed-dispatch".into())
                .spawn(move || {
                    let mut stream = match execute_with_retry(&adapter, &plan, &thread_ctx) {
                        Ok(stream) => stream,
                        Err(err) => {
                            let _ = tx.send(Err(err));
                            return;
                        }
                    };
                    loop {
                        if cancel.check().is_err() {
                            return;
                        }
                        match stream.next_batch() {
                            Ok(Some(batch)) => {
                                if tx.send(Ok(batch)).is_err() {
                                    return; // consumer went away
                                }
                            }
                            Ok(None) => return,
                            Err(err) => {
                                let _ = tx.send(Err(err));
                                return;
                            }
                        }
                    }
                })
                .map_err(|e| EngineError::Internal(format!("dispatch thread: {}", e)))?;
            self.source = ScanSource::Prefetch {
                receiver: Some(rx),
                worker: Some(worker),
            };
        } else {
            let stream = execute_with_retry(&self.adapter, &self.plan, ctx)?;
            self.source = ScanSource::Inline(Some(stream));
        }
        Ok(())
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<Batch>> {
        ctx.checkpoint()?;
        let started = Instant::now();
        loop {
            let Some(batch) = self.pull(ctx)? else {
                return Ok(None);
            };
            let batch = self.apply_residual(batch, ctx)?;
            ctx.monitor.record_operator(&self.label, |m| {
                m.rows_out += batch.num_rows() as u64;
                m.wall_nanos += started.elapsed().as_nanos() as u64;
            });
            // residual filtering can empty a batch; keep pulling
            if batch.is_empty() {
                continue;
            }
            return Ok(Some(batch));
        }
    }

    fn close(&mut self, _ctx: &ExecutionContext) -> Result<()> {
        if let ScanSource::Prefetch { receiver, worker } = &mut self.source {
            // dropping the receiver unblocks the worker's send
            receiver.take();
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        } else {
            self.source = ScanSource::Inline(None);
        }
        Ok(())
    }
}

/// Serves a materialized result, used for cache hits and broadcast inputs.
pub struct InlineResultsExec {
    label: String,
    schema: Arc<Schema>,
    rows: Arc<Vec<Row>>,
    cursor: usize,
}

impl InlineResultsExec {
    pub fn new(label: impl Into<String>, schema: Arc<Schema>, rows: Arc<Vec<Row>>) -> Self {
        Self {
            label: label.into(),
            schema,
            rows,
            cursor: 0,
        }
    }
}

impl Operator for InlineResultsExec {
    fn name(&self) -> String {
        self.label.clone()
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.schema)
    }

    fn open(&mut self, _ctx: &ExecutionContext) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<Batch>> {
        ctx.checkpoint()?;
        if self.cursor >= self.rows.len() {
            return Ok(None);
        }
        let end = (self.cursor + ctx.batch_size()).min(self.rows.len());
        let rows = self.rows[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(Some(Batch::new(Arc::clone(&self.schema), rows)))
    }

    fn close(&mut self, _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }
}

/// Collects a child dispatch's output and populates the result cache when
/// the stream completes. Cache failures never fail the query.
pub struct CachingExec {
    inner: Box<dyn Operator>,
    cache: Arc<ResultCache>,
    fingerprint: Fingerprint,
    dependencies: Vec<TableRef>,
    cost: f64,
    collected: Vec<Row>,
    exhausted: bool,
}

impl CachingExec {
    pub fn new(
        inner: Box<dyn Operator>,
        cache: Arc<ResultCache>,
        fingerprint: Fingerprint,
        dependencies: Vec<TableRef>,
        cost: f64,
    ) -> Self {
        Self {
            inner,
            cache,
            fingerprint,
            dependencies,
            cost,
            collected: Vec::new(),
            exhausted: false,
        }
    }
}

impl Operator for CachingExec {
    fn name(&self) -> String {
        format!("Caching({})", self.inner.name())
    }

    fn schema(&self) -> Arc<Schema> {
        self.inner.schema()
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.inner.open(ctx)
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<Batch>> {
        match self.inner.next(ctx)? {
            Some(batch) => {
                self.collected.extend(batch.rows.iter().cloned());
                Ok(Some(batch))
            }
            None => {
                if !self.exhausted {
                    self.exhausted = true;
                    let result =
                        CachedResult::new(self.inner.schema(), std::mem::take(&mut self.collected));
                    self.cache
                        .insert(self.fingerprint, result, &self.dependencies, self.cost);
                }
                Ok(None)
            }
        }
    }

    fn close(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.inner.close(ctx)
    }
}

pub struct FilterExec {
    input: Box<dyn Operator>,
    predicate: Expr,
    evaluator: Option<ExpressionEvaluator>,
    label: String,
}

impl FilterExec {
    pub fn new(input: Box<dyn Operator>, predicate: Expr) -> Self {
        Self {
            label: format!("Filter({})", predicate),
            input,
            predicate,
            evaluator: None,
        }
    }
}

impl Operator for FilterExec {
    fn name(&self) -> String {
        self.label.clone()
    }

    fn schema(&self) -> Arc<Schema> {
        self.input.schema()
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.input.open(ctx)?;
        self.evaluator = Some(ExpressionEvaluator::new(self.input.schema()));
        Ok(())
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<Batch>> {
        let evaluator = self
            .evaluator
            .as_ref()
            .ok_or_else(|| EngineError::Internal("filter next() before open()".into()))?;
        loop {
            ctx.checkpoint()?;
            let Some(batch) = self.input.next(ctx)? else {
                return Ok(None);
            };
            let started = Instant::now();
            let rows_in = batch.num_rows() as u64;
            let mut kept = Vec::new();
            for row in batch.rows {
                if evaluator.evaluate_predicate(&self.predicate, &row)? {
                    kept.push(row);
                }
            }
            ctx.monitor.record_operator(&self.label, |m| {
                m.rows_in += rows_in;
                m.rows_out += kept.len() as u64;
                m.wall_nanos += started.elapsed().as_nanos() as u64;
            });
            if !kept.is_empty() {
                return Ok(Some(Batch::new(batch.schema, kept)));
            }
        }
    }

    fn close(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.input.close(ctx)
    }
}

pub struct ProjectExec {
    input: Box<dyn Operator>,
    exprs: Vec<(Expr, String)>,
    schema: Arc<Schema>,
    evaluator: Option<ExpressionEvaluator>,
}

impl ProjectExec {
    pub fn new(input: Box<dyn Operator>, exprs: Vec<(Expr, String)>, schema: Arc<Schema>) -> Self {
        Self {
            input,
            exprs,
            schema,
            evaluator: None,
        }
    }
}

impl Operator for ProjectExec {
    fn name(&self) -> String {
        "Project".to_string()
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.schema)
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.input.open(ctx)?;
        self.evaluator = Some(ExpressionEvaluator::new(self.input.schema()));
        Ok(())
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<Batch>> {
        ctx.checkpoint()?;
        let evaluator = self
            .evaluator
            .as_ref()
            .ok_or_else(|| EngineError::Internal("project next() before open()".into()))?;
        let Some(batch) = self.input.next(ctx)? else {
            return Ok(None);
        };
        let started = Instant::now();
        let mut rows = Vec::with_capacity(batch.num_rows());
        for row in &batch.rows {
            let mut out = Vec::with_capacity(self.exprs.len());
            for (expr, _) in &self.exprs {
                out.push(evaluator.evaluate(expr, row)?);
            }
            rows.push(out);
        }
        ctx.monitor.record_operator("Project", |m| {
            m.rows_in += batch.num_rows() as u64;
            m.rows_out += rows.len() as u64;
            m.wall_nanos += started.elapsed().as_nanos() as u64;
        });
        Ok(Some(Batch::new(Arc::clone(&self.schema), rows)))
    }

    fn close(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.input.close(ctx)
    }
}

pub struct LimitExec {
    input: Box<dyn Operator>,
    remaining_offset: usize,
    remaining: Option<usize>,
}

impl LimitExec {
    pub fn new(input: Box<dyn Operator>, limit: Option<usize>, offset: usize) -> Self {
        Self {
            input,
            remaining_offset: offset,
            remaining: limit,
        }
    }
}

impl Operator for LimitExec {
    fn name(&self) -> String {
        "Limit".to_string()
    }

    fn schema(&self) -> Arc<Schema> {
        self.input.schema()
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.input.open(ctx)
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<Batch>> {
        if self.remaining == Some(0) {
            return Ok(None);
        }
        loop {
            ctx.checkpoint()?;
            let Some(mut batch) = self.input.next(ctx)? else {
                return Ok(None);
            };
            if self.remaining_offset > 0 {
                let skip = self.remaining_offset.min(batch.num_rows());
                batch.rows.drain(..skip);
                self.remaining_offset -= skip;
            }
            if let Some(remaining) = &mut self.remaining {
                if batch.num_rows() > *remaining {
                    batch.rows.truncate(*remaining);
                }
                *remaining -= batch.num_rows();
            }
            if !batch.is_empty() {
                return Ok(Some(batch));
            }
            if self.remaining == Some(0) {
                return Ok(None);
            }
        }
    }

    fn close(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.input.close(ctx)
    }
}

pub struct UnionExec {
    inputs: Vec<Box<dyn Operator>>,
    schema: Arc<Schema>,
    current: usize,
    distinct: bool,
    seen: HashSet<Vec<Value>>,
    seen_bytes: usize,
}

impl UnionExec {
    pub fn new(inputs: Vec<Box<dyn Operator>>, schema: Arc<Schema>, all: bool) -> Self {
        Self {
            inputs,
            schema,
            current: 0,
            distinct: !all,
            seen: HashSet::new(),
            seen_bytes: 0,
        }
    }
}

impl Operator for UnionExec {
    fn name(&self) -> String {
        "Union".to_string()
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.schema)
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        for input in &mut self.inputs {
            input.open(ctx)?;
        }
        Ok(())
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<Batch>> {
        loop {
            ctx.checkpoint()?;
            if self.current >= self.inputs.len() {
                return Ok(None);
            }
            let Some(batch) = self.inputs[self.current].next(ctx)? else {
                self.current += 1;
                continue;
            };
            let rows = if self.distinct {
                let mut unique = Vec::new();
                for row in batch.rows {
                    if !self.seen.contains(&row) {
                        let bytes =
                            row.iter().map(|v| v.estimated_size()).sum::<usize>() + 24;
                        ctx.memory.try_reserve(bytes)?;
                        self.seen_bytes += bytes;
                        self.seen.insert(row.clone());
                        unique.push(row);
                    }
                }
                unique
            } else {
                batch.rows
            };
            if !rows.is_empty() {
                return Ok(Some(Batch::new(Arc::clone(&self.schema), rows)));
            }
        }
    }

    fn close(&mut self, ctx: &ExecutionContext) -> Result<()> {
        for input in &mut self.inputs {
            input.close(ctx)?;
        }
        ctx.memory.release(self.seen_bytes);
        self.seen_bytes = 0;
        self.seen.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Column, ColumnType};
    use crate::execution::engine::test_support::test_context;
    use crate::plan::BinaryOp;

    fn int_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![Column::new("x", ColumnType::Int64, false)]))
    }

    fn inline(rows: Vec<i64>) -> Box<dyn Operator> {
        Box::new(InlineResultsExec::new(
            "test",
            int_schema(),
            Arc::new(rows.into_iter().map(|i| vec![Value::Integer(i)]).collect()),
        ))
    }

    fn drain(mut op: Box<dyn Operator>, ctx: &ExecutionContext) -> Vec<Row> {
        op.open(ctx).unwrap();
        let mut rows = Vec::new();
        while let Some(batch) = op.next(ctx).unwrap() {
            rows.extend(batch.rows);
        }
        op.close(ctx).unwrap();
        rows
    }

    #[test]
    fn test_filter_drops_rows() {
        let ctx = test_context();
        let op = Box::new(FilterExec::new(
            inline(vec![1, 2, 3, 4]),
            Expr::binary(
                Expr::column("x"),
                BinaryOp::Gt,
                Expr::literal(Value::Integer(2)),
            ),
        ));
        let rows = drain(op, &ctx);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_limit_offset() {
        let ctx = test_context();
        let op = Box::new(LimitExec::new(inline(vec![1, 2, 3, 4, 5]), Some(2), 1));
        let rows = drain(op, &ctx);
        assert_eq!(
            rows,
            vec![vec![Value::Integer(2)], vec![Value::Integer(3)]]
        );
    }

    #[test]
    fn test_union_all_concatenates() {
        let ctx = test_context();
        let op = Box::new(UnionExec::new(
            vec![inline(vec![1, 2]), inline(vec![2, 3])],
            int_schema(),
            true,
        ));
        assert_eq!(drain(op, &ctx).len(), 4);
    }

    #[test]
    fn test_union_distinct_deduplicates() {
        let ctx = test_context();
        let op = Box::new(UnionExec::new(
            vec![inline(vec![1, 2]), inline(vec![2, 3])],
            int_schema(),
            false,
        ));
        assert_eq!(drain(op, &ctx).len(), 3);
    }

    #[test]
    fn test_cancelled_context_stops_operators() {
        let ctx = test_context();
        ctx.cancel.cancel();
        let mut op = FilterExec::new(
            inline(vec![1]),
            Expr::literal(Value::Boolean(true)),
        );
        op.open(&ctx).unwrap();
        assert!(matches!(op.next(&ctx), Err(EngineError::Cancelled)));
    }
}

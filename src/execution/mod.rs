// # Execution
//
// Pull-based physical operators. Every operator is an explicit state machine
// exposing `open` / `next` / `close`, receives the execution context on each
// call (no ambient state), checks cancellation at batch boundaries, and
// accounts materialized memory against the query budget.

pub mod adaptive;
pub mod aggregate;
pub mod engine;
pub mod expressions;
pub mod hash_join;
pub mod index_join;
pub mod operators;
pub mod sort_merge;
pub mod window;

pub use adaptive::{AdaptiveJoinExec, AdaptiveSettings};
pub use engine::{ExecutionEngine, ExecutionMode, QueryOutput, QueryState};
pub use expressions::ExpressionEvaluator;

use crate::common::{Batch, QueryId, Row, Schema, Value, DEFAULT_BATCH_ROWS};
use crate::error::Result;
use crate::monitoring::Monitor;
use crate::plan::SortKey;
use crate::resource::{CancellationToken, MemoryTracker};
use crate::security::Identity;
use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything an operator needs from its surroundings, passed explicitly.
pub struct ExecutionContext {
    pub query_id: QueryId,
    pub identity: Identity,
    pub monitor: Arc<Monitor>,
    pub memory: Arc<MemoryTracker>,
    pub cancel: CancellationToken,
    pub mode: ExecutionMode,
    pub adaptive: AdaptiveSettings,
    pub batch_size: usize,
    /// Seed for reproducible tie-breaking within this plan's execution.
    pub seed: u64,
    pub spill_dir: PathBuf,
    /// Cooperative yield hint sampled from the resource manager.
    pub throttle: Option<std::time::Duration>,
}

impl ExecutionContext {
    /// Cancellation check, honored at every `next()` boundary and before
    /// blocking waits. Also applies the CPU governor's yield hint.
    pub fn checkpoint(&self) -> Result<()> {
        self.cancel.check()?;
        if let Some(pause) = self.throttle {
            std::thread::sleep(pause);
        }
        Ok(())
    }

    pub fn batch_size(&self) -> usize {
        if self.batch_size == 0 {
            DEFAULT_BATCH_ROWS
        } else {
            self.batch_size
        }
    }
}

/// A pull-based physical operator.
pub trait Operator: Send {
    fn name(&self) -> String;

    fn schema(&self) -> Arc<Schema>;

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()>;

    /// The next batch, or `None` once exhausted. Implementations check
    /// `ctx.checkpoint()` before doing work.
    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<Batch>>;

    fn close(&mut self, ctx: &ExecutionContext) -> Result<()>;
}

/// Compare two rows on the given sort keys using already-evaluated key
/// values. NULL placement follows each key's `nulls_first`.
pub fn compare_key_values(a: &[Value], b: &[Value], keys: &[SortKey]) -> Ordering {
    for (i, key) in keys.iter().enumerate() {
        let ord = compare_sort_values(&a[i], &b[i], key.ascending, key.nulls_first);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

pub fn compare_sort_values(a: &Value, b: &Value, ascending: bool, nulls_first: bool) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => {
            if nulls_first {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (false, true) => {
            if nulls_first {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (false, false) => {
            let ord = a.partial_cmp(b).unwrap_or(Ordering::Equal);
            if ascending {
                ord
            } else {
                ord.reverse()
            }
        }
    }
}

/// Evaluate sort key expressions for one row.
pub fn evaluate_keys(
    evaluator: &ExpressionEvaluator,
    keys: &[SortKey],
    row: &Row,
) -> Result<Vec<Value>> {
    keys.iter()
        .map(|k| evaluator.evaluate(&k.expr, row))
        .collect()
}

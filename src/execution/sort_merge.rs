// External sort and merge join.
//
// The sort materializes against the memory budget; when the budget runs out
// it writes sorted runs to the spill directory and k-way merges them. A sort
// directly feeding a limit keeps only the top K rows instead. The merge join
// consumes inputs already ordered on the join keys and buffers duplicate key
// runs on the right side.

use crate::common::{Batch, Row, Schema, Value};
use crate::error::{EngineError, Result};
use crate::execution::expressions::ExpressionEvaluator;
use crate::execution::{compare_key_values, evaluate_keys, ExecutionContext, Operator};
use crate::plan::{Expr, SortKey};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Row count past which the in-memory sort goes parallel.
const PARALLEL_SORT_THRESHOLD: usize = 10_000;

type KeyedRow = (Vec<Value>, Row);

enum SortState {
    Pending,
    Emitting { rows: Vec<Row>, cursor: usize },
    Merging(KWayMerge),
}

pub struct SortExec {
    input: Box<dyn Operator>,
    keys: Vec<SortKey>,
    /// Top-K bound: sort fused with a downstream `LIMIT k [OFFSET o]` keeps
    /// only `k + o` rows.
    keep: Option<usize>,
    state: SortState,
    reserved_bytes: usize,
    spill_dir: Option<PathBuf>,
}

impl SortExec {
    pub fn new(input: Box<dyn Operator>, keys: Vec<SortKey>) -> Self {
        Self {
            input,
            keys,
            keep: None,
            state: SortState::Pending,
            reserved_bytes: 0,
            spill_dir: None,
        }
    }

    pub fn with_top_k(mut self, keep: usize) -> Self {
        self.keep = Some(keep);
        self
    }

    fn sort_keyed(&self, keyed: &mut Vec<KeyedRow>) {
        let keys = &self.keys;
        if keyed.len() >= PARALLEL_SORT_THRESHOLD {
            keyed.par_sort_by(|(a, _), (b, _)| compare_key_values(a, b, keys));
        } else {
            keyed.sort_by(|(a, _), (b, _)| compare_key_values(a, b, keys));
        }
    }

    fn materialize(&mut self, ctx: &ExecutionContext) -> Result<()> {
        let evaluator = ExpressionEvaluator::new(self.input.schema());
        let mut keyed: Vec<KeyedRow> = Vec::new();
        let mut runs: Vec<PathBuf> = Vec::new();
        let mut run_counter = 0usize;

        loop {
            ctx.checkpoint()?;
            let Some(batch) = self.input.next(ctx)? else {
                break;
            };
            let bytes = batch.estimated_size();
            if ctx.memory.try_reserve(bytes).is_err() {
                if let Some(keep) = self.keep {
                    // top-K never needs more than `keep` rows in memory
                    self.sort_keyed(&mut keyed);
                    keyed.truncate(keep);
                    ctx.memory.release(self.reserved_bytes);
                    self.reserved_bytes = 0;
                } else {
                    // spill the current buffer as a sorted run
                    self.sort_keyed(&mut keyed);
                    let run = self.write_run(&keyed, run_counter, ctx)?;
                    run_counter += 1;
                    runs.push(run);
                    keyed.clear();
                    ctx.memory.release(self.reserved_bytes);
                    self.reserved_bytes = 0;
                }
                ctx.memory.try_reserve(bytes)?;
            }
            self.reserved_bytes += bytes;
            for row in batch.rows {
                let key_values = evaluate_keys(&evaluator, &self.keys, &row)?;
                keyed.push((key_values, row));
            }
            // keep the top-K buffer bounded
            if let Some(keep) = self.keep {
                if keyed.len() > keep.saturating_mul(2).max(1024) {
                    self.sort_keyed(&mut keyed);
                    keyed.truncate(keep);
                }
            }
        }

        self.sort_keyed(&mut keyed);
        if let Some(keep) = self.keep {
            keyed.truncate(keep);
        }

        if runs.is_empty() {
            self.state = SortState::Emitting {
                rows: keyed.into_iter().map(|(_, row)| row).collect(),
                cursor: 0,
            };
        } else {
            // final in-memory chunk becomes the last run
            let run = self.write_run(&keyed, run_counter, ctx)?;
            runs.push(run);
            ctx.memory.release(self.reserved_bytes);
            self.reserved_bytes = 0;
            self.state = SortState::Merging(KWayMerge::open(runs, self.keys.clone())?);
        }
        Ok(())
    }

    fn write_run(
        &mut self,
        keyed: &[KeyedRow],
        counter: usize,
        ctx: &ExecutionContext,
    ) -> Result<PathBuf> {
        let dir = match &self.spill_dir {
            Some(dir) => dir.clone(),
            None => {
                let dir = ctx.spill_dir.join(format!(
                    "sort_{}_{}",
                    ctx.query_id,
                    uuid::Uuid::new_v4().simple()
                ));
                std::fs::create_dir_all(&dir)
                    .map_err(|e| EngineError::Execution(format!("spill dir: {}", e)))?;
                self.spill_dir = Some(dir.clone());
                dir
            }
        };
        let path = dir.join(format!("run_{:04}.jsonl", counter));
        let file = File::create(&path)
            .map_err(|e| EngineError::Execution(format!("run create: {}", e)))?;
        let mut writer = BufWriter::new(file);
        for entry in keyed {
            let line = serde_json::to_string(entry)
                .map_err(|e| EngineError::Execution(format!("run encode: {}", e)))?;
            writeln!(writer, "{}", line)
                .map_err(|e| EngineError::Execution(format!("run write: {}", e)))?;
        }
        writer
            .flush()
            .map_err(|e| EngineError::Execution(format!("run flush: {}", e)))?;
        tracing::debug!(rows = keyed.len(), path = %path.display(), "sort run spilled");
        Ok(path)
    }
}

impl Operator for SortExec {
    fn name(&self) -> String {
        "Sort".to_string()
    }

    fn schema(&self) -> Arc<Schema> {
        self.input.schema()
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.input.open(ctx)
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<Batch>> {
        ctx.checkpoint()?;
        if matches!(self.state, SortState::Pending) {
            let started = Instant::now();
            self.materialize(ctx)?;
            ctx.monitor.record_operator("Sort", |m| {
                m.wall_nanos += started.elapsed().as_nanos() as u64;
            });
        }
        match &mut self.state {
            SortState::Pending => unreachable!("materialized above"),
            SortState::Emitting { rows, cursor } => {
                if *cursor >= rows.len() {
                    return Ok(None);
                }
                let end = (*cursor + ctx.batch_size()).min(rows.len());
                let out = rows[*cursor..end].to_vec();
                *cursor = end;
                ctx.monitor.record_operator("Sort", |m| {
                    m.rows_out += out.len() as u64;
                });
                Ok(Some(Batch::new(self.input.schema(), out)))
            }
            SortState::Merging(merge) => {
                let mut out = Vec::with_capacity(ctx.batch_size());
                while out.len() < ctx.batch_size() {
                    match merge.next_row()? {
                        Some(row) => out.push(row),
                        None => break,
                    }
                }
                if out.is_empty() {
                    return Ok(None);
                }
                ctx.monitor.record_operator("Sort", |m| {
                    m.rows_out += out.len() as u64;
                });
                Ok(Some(Batch::new(self.input.schema(), out)))
            }
        }
    }

    fn close(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.input.close(ctx)?;
        ctx.memory.release(self.reserved_bytes);
        self.reserved_bytes = 0;
        self.state = SortState::Pending;
        if let Some(dir) = self.spill_dir.take() {
            let _ = std::fs::remove_dir_all(dir);
        }
        Ok(())
    }
}

/// Streaming k-way merge over sorted run files. Run counts are small enough
/// that a linear minimum scan beats heap bookkeeping.
struct KWayMerge {
    readers: Vec<std::io::Lines<BufReader<File>>>,
    heads: Vec<Option<KeyedRow>>,
    keys: Vec<SortKey>,
}

impl KWayMerge {
    fn open(runs: Vec<PathBuf>, keys: Vec<SortKey>) -> Result<Self> {
        let mut readers = Vec::with_capacity(runs.len());
        for run in &runs {
            let file = File::open(run)
                .map_err(|e| EngineError::Execution(format!("run open: {}", e)))?;
            readers.push(BufReader::new(file).lines());
        }
        let mut merge = Self {
            readers,
            heads: Vec::new(),
            keys,
        };
        for i in 0..merge.readers.len() {
            let head = merge.read_next(i)?;
            merge.heads.push(head);
        }
        Ok(merge)
    }

    fn read_next(&mut self, run: usize) -> Result<Option<KeyedRow>> {
        match self.readers[run].next() {
            Some(line) => {
                let line =
                    line.map_err(|e| EngineError::Execution(format!("run read: {}", e)))?;
                let entry: KeyedRow = serde_json::from_str(&line)
                    .map_err(|e| EngineError::Execution(format!("run decode: {}", e)))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        let mut min_run: Option<usize> = None;
        for (i, head) in self.heads.iter().enumerate() {
            let Some((head_keys, _)) = head else { continue };
            let better = match min_run {
                None => true,
                Some(current) => {
                    let (current_keys, _) = self.heads[current].as_ref().unwrap();
                    compare_key_values(head_keys, current_keys, &self.keys) == Ordering::Less
                }
            };
            if better {
                min_run = Some(i);
            }
        }
        match min_run {
            Some(run) => {
                let (_, row) = self.heads[run].take().unwrap();
                self.heads[run] = self.read_next(run)?;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }
}

// ============================================================================
// Merge join
// ============================================================================

/// Cursor over one sorted input, row at a time.
struct RowCursor {
    op: Box<dyn Operator>,
    keys: Vec<Expr>,
    evaluator: Option<ExpressionEvaluator>,
    batch: Vec<Row>,
    idx: usize,
    done: bool,
}

impl RowCursor {
    fn new(op: Box<dyn Operator>, keys: Vec<Expr>) -> Self {
        Self {
            op,
            keys,
            evaluator: None,
            batch: Vec::new(),
            idx: 0,
            done: false,
        }
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.op.open(ctx)?;
        self.evaluator = Some(ExpressionEvaluator::new(self.op.schema()));
        Ok(())
    }

    fn fill(&mut self, ctx: &ExecutionContext) -> Result<()> {
        while !self.done && self.idx >= self.batch.len() {
            match self.op.next(ctx)? {
                Some(batch) => {
                    self.batch = batch.rows;
                    self.idx = 0;
                }
                None => self.done = true,
            }
        }
        Ok(())
    }

    fn peek(&mut self, ctx: &ExecutionContext) -> Result<Option<(Vec<Value>, Row)>> {
        self.fill(ctx)?;
        if self.done {
            return Ok(None);
        }
        let row = self.batch[self.idx].clone();
        let evaluator = self.evaluator.as_ref().expect("opened");
        let mut key = Vec::with_capacity(self.keys.len());
        for expr in &self.keys {
            key.push(evaluator.evaluate(expr, &row)?);
        }
        Ok(Some((key, row)))
    }

    fn advance(&mut self) {
        self.idx += 1;
    }

    /// Collect the full run of rows whose key equals `key`.
    fn take_run(&mut self, key: &[Value], ctx: &ExecutionContext) -> Result<Vec<Row>> {
        let mut run = Vec::new();
        while let Some((next_key, row)) = self.peek(ctx)? {
            if next_key == key {
                run.push(row);
                self.advance();
            } else {
                break;
            }
        }
        Ok(run)
    }
}

/// Inner merge join over inputs sorted ascending on the join keys.
pub struct MergeJoinExec {
    left: Option<RowCursor>,
    right: Option<RowCursor>,
    residual: Option<Expr>,
    output_schema: Arc<Schema>,
    combined_schema: Arc<Schema>,
    pending: Vec<Row>,
}

impl MergeJoinExec {
    pub fn new(
        left: Box<dyn Operator>,
        right: Box<dyn Operator>,
        left_keys: Vec<Expr>,
        right_keys: Vec<Expr>,
        residual: Option<Expr>,
        output_schema: Arc<Schema>,
    ) -> Self {
        let combined_schema = Arc::new(left.schema().join(&right.schema()));
        Self {
            left: Some(RowCursor::new(left, left_keys)),
            right: Some(RowCursor::new(right, right_keys)),
            residual,
            output_schema,
            combined_schema,
            pending: Vec::new(),
        }
    }

    fn fill_pending(&mut self, ctx: &ExecutionContext) -> Result<()> {
        let residual_eval = ExpressionEvaluator::new(Arc::clone(&self.combined_schema));
        let left = self.left.as_mut().expect("open");
        let right = self.right.as_mut().expect("open");
        while self.pending.is_empty() {
            ctx.checkpoint()?;
            let (Some((lkey, _)), Some((rkey, _))) = (left.peek(ctx)?, right.peek(ctx)?) else {
                return Ok(());
            };
            // null keys never match in a join; skip them
            if lkey.iter().any(Value::is_null) {
                left.advance();
                continue;
            }
            if rkey.iter().any(Value::is_null) {
                right.advance();
                continue;
            }
            match compare_keys(&lkey, &rkey)? {
                Ordering::Less => left.advance(),
                Ordering::Greater => right.advance(),
                Ordering::Equal => {
                    // buffer the duplicate runs on both sides
                    let left_run = left.take_run(&lkey, ctx)?;
                    let right_run = right.take_run(&rkey, ctx)?;
                    for l in &left_run {
                        for r in &right_run {
                            let mut combined = l.clone();
                            combined.extend(r.iter().cloned());
                            let passes = match &self.residual {
                                Some(residual) => {
                                    residual_eval.evaluate_predicate(residual, &combined)?
                                }
                                None => true,
                            };
                            if passes {
                                self.pending.push(combined);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn compare_keys(a: &[Value], b: &[Value]) -> Result<Ordering> {
    for (x, y) in a.iter().zip(b.iter()) {
        match x.partial_cmp(y) {
            Some(Ordering::Equal) => continue,
            Some(ord) => return Ok(ord),
            None => {
                return Err(EngineError::TypeMismatch(format!(
                    "cannot merge-join {} with {}",
                    x.type_name(),
                    y.type_name()
                )))
            }
        }
    }
    Ok(Ordering::Equal)
}

impl Operator for MergeJoinExec {
    fn name(&self) -> String {
        "MergeJoin".to_string()
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.output_schema)
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.left.as_mut().expect("cursor").open(ctx)?;
        self.right.as_mut().expect("cursor").open(ctx)
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<Batch>> {
        ctx.checkpoint()?;
        let started = Instant::now();
        self.fill_pending(ctx)?;
        if self.pending.is_empty() {
            return Ok(None);
        }
        let take = self.pending.len().min(ctx.batch_size());
        let rows: Vec<Row> = self.pending.drain(..take).collect();
        ctx.monitor.record_operator("MergeJoin", |m| {
            m.rows_out += rows.len() as u64;
            m.wall_nanos += started.elapsed().as_nanos() as u64;
        });
        Ok(Some(Batch::new(Arc::clone(&self.output_schema), rows)))
    }

    fn close(&mut self, ctx: &ExecutionContext) -> Result<()> {
        if let Some(mut cursor) = self.left.take() {
            cursor.op.close(ctx)?;
        }
        if let Some(mut cursor) = self.right.take() {
            cursor.op.close(ctx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Column, ColumnType};
    use crate::execution::engine::test_support::{test_context, test_context_with_memory};
    use crate::execution::operators::InlineResultsExec;

    fn int_schema(rel: &str, name: &str) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Column::new(name, ColumnType::Int64, true).with_relation(rel)
        ]))
    }

    fn ints(rel: &str, name: &str, values: Vec<i64>) -> Box<dyn Operator> {
        Box::new(InlineResultsExec::new(
            "ints",
            int_schema(rel, name),
            Arc::new(values.into_iter().map(|i| vec![Value::Integer(i)]).collect()),
        ))
    }

    fn run(mut op: impl Operator, ctx: &ExecutionContext) -> Vec<Row> {
        op.open(ctx).unwrap();
        let mut rows = Vec::new();
        while let Some(batch) = op.next(ctx).unwrap() {
            rows.extend(batch.rows);
        }
        op.close(ctx).unwrap();
        rows
    }

    #[test]
    fn test_in_memory_sort() {
        let ctx = test_context();
        let sort = SortExec::new(
            ints("t", "x", vec![3, 1, 2]),
            vec![SortKey::asc(Expr::column("x"))],
        );
        let rows = run(sort, &ctx);
        assert_eq!(
            rows,
            vec![
                vec![Value::Integer(1)],
                vec![Value::Integer(2)],
                vec![Value::Integer(3)],
            ]
        );
    }

    #[test]
    fn test_sort_descending_nulls_last() {
        let ctx = test_context();
        let schema = int_schema("t", "x");
        let input = Box::new(InlineResultsExec::new(
            "in",
            schema,
            Arc::new(vec![
                vec![Value::Integer(1)],
                vec![Value::Null],
                vec![Value::Integer(5)],
            ]),
        ));
        let sort = SortExec::new(input, vec![SortKey::desc(Expr::column("x"))]);
        let rows = run(sort, &ctx);
        assert_eq!(
            rows,
            vec![
                vec![Value::Integer(5)],
                vec![Value::Integer(1)],
                vec![Value::Null],
            ]
        );
    }

    #[test]
    fn test_external_sort_spills_and_merges() {
        // room for one input batch but not two forces run spilling
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = test_context_with_memory(40_000);
        ctx.spill_dir = tmp.path().to_path_buf();
        let values: Vec<i64> = (0..2_000).rev().collect();
        let sort = SortExec::new(
            ints("t", "x", values),
            vec![SortKey::asc(Expr::column("x"))],
        );
        let rows = run(sort, &ctx);
        assert_eq!(rows.len(), 2_000);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row[0], Value::Integer(i as i64));
        }
        assert_eq!(ctx.memory.used(), 0);
    }

    #[test]
    fn test_top_k() {
        let ctx = test_context();
        let sort = SortExec::new(
            ints("t", "x", (0..1_000).collect()),
            vec![SortKey::desc(Expr::column("x"))],
        )
        .with_top_k(3);
        let rows = run(sort, &ctx);
        assert_eq!(
            rows,
            vec![
                vec![Value::Integer(999)],
                vec![Value::Integer(998)],
                vec![Value::Integer(997)],
            ]
        );
    }

    #[test]
    fn test_merge_join_with_duplicate_runs() {
        let ctx = test_context();
        let join = MergeJoinExec::new(
            ints("l", "a", vec![1, 2, 2, 3]),
            ints("r", "b", vec![2, 2, 3, 4]),
            vec![Expr::qualified_column("l", "a")],
            vec![Expr::qualified_column("r", "b")],
            None,
            Arc::new(
                int_schema("l", "a")
                    .as_ref()
                    .join(&int_schema("r", "b")),
            ),
        );
        let rows = run(join, &ctx);
        // 2x2 run cross product plus the single 3 match
        assert_eq!(rows.len(), 5);
    }
}

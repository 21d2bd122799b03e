// Hash join and partitioned (grace-style) hash join.
//
// The in-memory hash join materializes its build side against the query
// memory budget; when the budget runs out it escalates to the partitioned
// variant, which spills both sides into hash partitions on disk and joins
// partition by partition. Inner and semi joins prefilter the probe side
// through a bloom filter built over the build keys.

use crate::common::{Batch, Row, Schema, Value};
use crate::error::{EngineError, Result};
use crate::execution::expressions::ExpressionEvaluator;
use crate::execution::{ExecutionContext, Operator};
use crate::monitoring::AdaptationEvent;
use crate::plan::{BinaryOp, Expr, JoinType};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Equi-key pairs plus whatever conjuncts were not equi-joinable.
#[derive(Debug, Clone)]
pub struct JoinCondition {
    pub left_keys: Vec<Expr>,
    pub right_keys: Vec<Expr>,
    pub residual: Option<Expr>,
}

/// Split a join condition into equi-key pairs (column-to-column equality
/// across sides) and a residual predicate evaluated against the combined
/// row.
pub fn split_join_condition(
    condition: &Expr,
    left_schema: &Schema,
    right_schema: &Schema,
) -> JoinCondition {
    let mut left_keys = Vec::new();
    let mut right_keys = Vec::new();
    let mut residual = Vec::new();
    for conjunct in condition.split_conjunction() {
        if let Expr::BinaryOp {
            left,
            op: BinaryOp::Eq,
            right,
        } = conjunct
        {
            if let (Expr::Column { relation: lr, name: ln }, Expr::Column { relation: rr, name: rn }) =
                (left.as_ref(), right.as_ref())
            {
                let l_in_left = !left_schema.resolve(lr.as_deref(), ln).is_empty();
                let l_in_right = !right_schema.resolve(lr.as_deref(), ln).is_empty();
                let r_in_left = !left_schema.resolve(rr.as_deref(), rn).is_empty();
                let r_in_right = !right_schema.resolve(rr.as_deref(), rn).is_empty();
                if l_in_left && !l_in_right && r_in_right && !r_in_left {
                    left_keys.push(left.as_ref().clone());
                    right_keys.push(right.as_ref().clone());
                    continue;
                }
                if l_in_right && !l_in_left && r_in_left && !r_in_right {
                    left_keys.push(right.as_ref().clone());
                    right_keys.push(left.as_ref().clone());
                    continue;
                }
            }
        }
        residual.push(conjunct.clone());
    }
    JoinCondition {
        left_keys,
        right_keys,
        residual: Expr::conjunction(residual),
    }
}

/// Join key for one row; `None` when any key value is NULL (null keys never
/// match).
pub fn evaluate_join_key(
    evaluator: &ExpressionEvaluator,
    keys: &[Expr],
    row: &Row,
) -> Result<Option<Vec<Value>>> {
    let mut out = Vec::with_capacity(keys.len());
    for key in keys {
        let v = evaluator.evaluate(key, row)?;
        if v.is_null() {
            return Ok(None);
        }
        out.push(v);
    }
    Ok(Some(out))
}

// ============================================================================
// Bloom filter
// ============================================================================

/// Blocked bloom filter over join keys, used to drop probe rows before the
/// hash table lookup. Only sound for joins that discard non-matching probe
/// rows (inner, semi).
pub struct BloomFilter {
    bits: Vec<u64>,
    mask: usize,
    hashes: u32,
}

impl BloomFilter {
    pub fn new(expected_items: usize) -> Self {
        let bits_needed = (expected_items.max(64) * 10).next_power_of_two();
        Self {
            bits: vec![0u64; bits_needed / 64],
            mask: bits_needed - 1,
            hashes: 7,
        }
    }

    fn positions(&self, key: &[Value]) -> impl Iterator<Item = usize> + '_ {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let h1 = hasher.finish();
        let h2 = h1.rotate_left(31) | 1;
        let mask = self.mask;
        (0..self.hashes).map(move |i| (h1.wrapping_add(h2.wrapping_mul(i as u64))) as usize & mask)
    }

    pub fn insert(&mut self, key: &[Value]) {
        let positions: Vec<usize> = self.positions(key).collect();
        for pos in positions {
            self.bits[pos / 64] |= 1 << (pos % 64);
        }
    }

    pub fn contains(&self, key: &[Value]) -> bool {
        self.positions(key)
            .collect::<Vec<_>>()
            .iter()
            .all(|&pos| self.bits[pos / 64] & (1 << (pos % 64)) != 0)
    }
}

// ============================================================================
// Shared join core
// ============================================================================

/// Join semantics shared by the in-memory and per-partition paths.
#[derive(Clone)]
struct JoinCore {
    join_type: JoinType,
    build_is_left: bool,
    condition: JoinCondition,
    combined_schema: Arc<Schema>,
    output_schema: Arc<Schema>,
    left_width: usize,
    right_width: usize,
}

impl JoinCore {
    fn build_keys(&self) -> &[Expr] {
        if self.build_is_left {
            &self.condition.left_keys
        } else {
            &self.condition.right_keys
        }
    }

    fn probe_keys(&self) -> &[Expr] {
        if self.build_is_left {
            &self.condition.right_keys
        } else {
            &self.condition.left_keys
        }
    }

    fn combine(&self, build_row: &Row, probe_row: &Row) -> Row {
        let (left, right) = if self.build_is_left {
            (build_row, probe_row)
        } else {
            (probe_row, build_row)
        };
        match self.join_type {
            JoinType::Semi | JoinType::Anti => left.clone(),
            _ => {
                let mut out = Vec::with_capacity(left.len() + right.len());
                out.extend(left.iter().cloned());
                out.extend(right.iter().cloned());
                out
            }
        }
    }

    fn combine_full(&self, build_row: &Row, probe_row: &Row) -> Row {
        let (left, right) = if self.build_is_left {
            (build_row, probe_row)
        } else {
            (probe_row, build_row)
        };
        let mut out = Vec::with_capacity(left.len() + right.len());
        out.extend(left.iter().cloned());
        out.extend(right.iter().cloned());
        out
    }

    fn pad_probe(&self, probe_row: &Row) -> Row {
        // probe side preserved, build side padded with NULLs
        let build_width = if self.build_is_left {
            self.left_width
        } else {
            self.right_width
        };
        let build_nulls = vec![Value::Null; build_width];
        self.combine(&build_nulls, probe_row)
    }

    fn pad_build(&self, build_row: &Row) -> Row {
        let probe_width = if self.build_is_left {
            self.right_width
        } else {
            self.left_width
        };
        let probe_nulls = vec![Value::Null; probe_width];
        self.combine(build_row, &probe_nulls)
    }

    fn probe_side_preserved(&self) -> bool {
        if self.build_is_left {
            self.join_type.preserves_right()
        } else {
            self.join_type.preserves_left()
        }
    }

    fn build_side_preserved(&self) -> bool {
        if self.build_is_left {
            self.join_type.preserves_left()
        } else {
            self.join_type.preserves_right()
        }
    }

    /// Join one probe row against the build table, appending output rows.
    #[allow(clippy::too_many_arguments)]
    fn probe_row(
        &self,
        probe_row: &Row,
        key: Option<Vec<Value>>,
        table: &HashMap<Vec<Value>, Vec<usize>>,
        build_rows: &[Row],
        matched: &mut [bool],
        residual_eval: &ExpressionEvaluator,
        bloom: Option<&BloomFilter>,
        out: &mut Vec<Row>,
    ) -> Result<()> {
        let candidates = match &key {
            Some(key) => {
                if bloom.map(|b| !b.contains(key)).unwrap_or(false) {
                    None
                } else {
                    table.get(key)
                }
            }
            None => None,
        };
        let mut any_match = false;
        if let Some(indices) = candidates {
            for &idx in indices {
                let combined = self.combine_full(&build_rows[idx], probe_row);
                let passes = match &self.condition.residual {
                    Some(residual) => residual_eval.evaluate_predicate(residual, &combined)?,
                    None => true,
                };
                if !passes {
                    continue;
                }
                any_match = true;
                matched[idx] = true;
                match self.join_type {
                    JoinType::Semi => {
                        out.push(probe_row.clone());
                        return Ok(()); // one match is enough
                    }
                    JoinType::Anti => {
                        return Ok(()); // matched anti rows are dropped
                    }
                    _ => out.push(self.combine(&build_rows[idx], probe_row)),
                }
            }
        }
        if !any_match {
            match self.join_type {
                JoinType::Anti => out.push(probe_row.clone()),
                _ if self.probe_side_preserved() => out.push(self.pad_probe(probe_row)),
                _ => {}
            }
        }
        Ok(())
    }
}

// ============================================================================
// In-memory hash join
// ============================================================================

enum HashJoinState {
    Pending,
    Probing {
        table: HashMap<Vec<Value>, Vec<usize>>,
        build_rows: Vec<Row>,
        matched: Vec<bool>,
        bloom: Option<BloomFilter>,
        emitted_unmatched: bool,
    },
    Escalated(Box<PartitionedHashJoinExec>),
}

pub struct HashJoinExec {
    build: Box<dyn Operator>,
    probe: Box<dyn Operator>,
    core: JoinCore,
    state: HashJoinState,
    reserved_bytes: usize,
    partitions_on_escalation: usize,
}

impl HashJoinExec {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        left: Box<dyn Operator>,
        right: Box<dyn Operator>,
        join_type: JoinType,
        condition: JoinCondition,
        build_is_left: bool,
        output_schema: Arc<Schema>,
        partitions_on_escalation: usize,
    ) -> Self {
        // semi/anti joins emit probe-side rows, so the build must be right
        let build_is_left = match join_type {
            JoinType::Semi | JoinType::Anti => false,
            _ => build_is_left,
        };
        let left_schema = left.schema();
        let right_schema = right.schema();
        let combined_schema = Arc::new(left_schema.join(&right_schema));
        let core = JoinCore {
            join_type,
            build_is_left,
            condition,
            combined_schema,
            output_schema,
            left_width: left_schema.len(),
            right_width: right_schema.len(),
        };
        let (build, probe) = if build_is_left {
            (left, right)
        } else {
            (right, left)
        };
        Self {
            build,
            probe,
            core,
            state: HashJoinState::Pending,
            reserved_bytes: 0,
            partitions_on_escalation,
        }
    }

    fn build_table(&mut self, ctx: &ExecutionContext) -> Result<()> {
        let build_schema = self.build.schema();
        let key_eval = ExpressionEvaluator::new(Arc::clone(&build_schema));
        let mut build_rows: Vec<Row> = Vec::new();
        let mut table: HashMap<Vec<Value>, Vec<usize>> = HashMap::new();

        loop {
            ctx.checkpoint()?;
            let Some(batch) = self.build.next(ctx)? else {
                break;
            };
            let bytes = batch.estimated_size();
            if ctx.memory.try_reserve(bytes).is_err() {
                // out of budget: hand everything to the partitioned variant
                tracing::debug!(
                    buffered_rows = build_rows.len(),
                    "hash join build side exceeded memory budget; escalating"
                );
                ctx.monitor.record_adaptation(AdaptationEvent {
                    operator: self.name(),
                    from_strategy: "hash_join".into(),
                    to_strategy: "partitioned_hash_join".into(),
                    reason: "memory budget exhausted during build".into(),
                    estimated_rows: 0,
                    actual_rows: build_rows.len() as u64,
                });
                let mut pending = batch.rows;
                pending.extend(std::mem::take(&mut build_rows));
                ctx.memory.release(self.reserved_bytes);
                self.reserved_bytes = 0;
                let mut escalated = PartitionedHashJoinExec::from_escalation(
                    self.core.clone(),
                    pending,
                    std::mem::replace(&mut self.build, Box::new(ExhaustedOp)),
                    std::mem::replace(&mut self.probe, Box::new(ExhaustedOp)),
                    self.partitions_on_escalation,
                );
                escalated.open(ctx)?;
                self.state = HashJoinState::Escalated(Box::new(escalated));
                return Ok(());
            }
            self.reserved_bytes += bytes;
            for row in batch.rows {
                if let Some(key) = evaluate_join_key(&key_eval, self.core.build_keys(), &row)? {
                    table.entry(key).or_default().push(build_rows.len());
                }
                build_rows.push(row);
            }
        }

        // bloom prefilter is only sound where non-matching probe rows drop out
        let bloom = match self.core.join_type {
            JoinType::Inner | JoinType::Semi => {
                let mut bloom = BloomFilter::new(table.len());
                for key in table.keys() {
                    bloom.insert(key);
                }
                Some(bloom)
            }
            _ => None,
        };

        let matched = vec![false; build_rows.len()];
        self.state = HashJoinState::Probing {
            table,
            build_rows,
            matched,
            bloom,
            emitted_unmatched: false,
        };
        Ok(())
    }
}

/// Stand-in for operators moved out during escalation.
struct ExhaustedOp;

impl Operator for ExhaustedOp {
    fn name(&self) -> String {
        "Exhausted".into()
    }
    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::empty())
    }
    fn open(&mut self, _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }
    fn next(&mut self, _ctx: &ExecutionContext) -> Result<Option<Batch>> {
        Ok(None)
    }
    fn close(&mut self, _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }
}

impl Operator for HashJoinExec {
    fn name(&self) -> String {
        format!("HashJoin({:?})", self.core.join_type)
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.core.output_schema)
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.build.open(ctx)?;
        self.probe.open(ctx)
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<Batch>> {
        ctx.checkpoint()?;
        if matches!(self.state, HashJoinState::Pending) {
            self.build_table(ctx)?;
        }
        if let HashJoinState::Escalated(inner) = &mut self.state {
            return inner.next(ctx);
        }

        let started = Instant::now();
        let label = self.name();
        let output_schema = Arc::clone(&self.core.output_schema);
        let residual_eval = ExpressionEvaluator::new(Arc::clone(&self.core.combined_schema));
        let probe_schema = self.probe.schema();
        let probe_eval = ExpressionEvaluator::new(probe_schema);

        let HashJoinState::Probing {
            table,
            build_rows,
            matched,
            bloom,
            emitted_unmatched,
        } = &mut self.state
        else {
            return Err(EngineError::Internal("hash join state machine".into()));
        };

        loop {
            match self.probe.next(ctx)? {
                Some(batch) => {
                    let rows_in = batch.num_rows() as u64;
                    let mut out = Vec::new();
                    for row in &batch.rows {
                        let key =
                            evaluate_join_key(&probe_eval, self.core.probe_keys(), row)?;
                        self.core.probe_row(
                            row,
                            key,
                            table,
                            build_rows,
                            matched,
                            &residual_eval,
                            bloom.as_ref(),
                            &mut out,
                        )?;
                    }
                    ctx.monitor.record_operator(&label, |m| {
                        m.rows_in += rows_in;
                        m.rows_out += out.len() as u64;
                        m.wall_nanos += started.elapsed().as_nanos() as u64;
                    });
                    if out.is_empty() {
                        ctx.checkpoint()?;
                        continue;
                    }
                    return Ok(Some(Batch::new(Arc::clone(&output_schema), out)));
                }
                None => {
                    // outer joins still owe the unmatched build rows
                    if self.core.build_side_preserved() && !*emitted_unmatched {
                        *emitted_unmatched = true;
                        let mut out = Vec::new();
                        for (idx, row) in build_rows.iter().enumerate() {
                            if !matched[idx] {
                                out.push(self.core.pad_build(row));
                            }
                        }
                        if !out.is_empty() {
                            return Ok(Some(Batch::new(Arc::clone(&output_schema), out)));
                        }
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn close(&mut self, ctx: &ExecutionContext) -> Result<()> {
        if let HashJoinState::Escalated(inner) = &mut self.state {
            inner.close(ctx)?;
        }
        self.build.close(ctx)?;
        self.probe.close(ctx)?;
        ctx.memory.release(self.reserved_bytes);
        self.reserved_bytes = 0;
        self.state = HashJoinState::Pending;
        Ok(())
    }
}

// ============================================================================
// Partitioned hash join
// ============================================================================

/// Grace-style partitioned hash join: both sides are hash-partitioned into
/// spill files, then each partition pair is joined in memory. Memory use is
/// bounded by the largest single partition.
pub struct PartitionedHashJoinExec {
    left: Box<dyn Operator>,
    right: Box<dyn Operator>,
    core: JoinCore,
    partitions: usize,
    /// Build rows inherited from an escalated in-memory join.
    carried_build_rows: Vec<Row>,
    spill_dir: Option<PathBuf>,
    partitioned: bool,
    current_partition: usize,
    pending: Vec<Row>,
}

impl PartitionedHashJoinExec {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        left: Box<dyn Operator>,
        right: Box<dyn Operator>,
        join_type: JoinType,
        condition: JoinCondition,
        build_is_left: bool,
        output_schema: Arc<Schema>,
        partitions: usize,
    ) -> Self {
        let build_is_left = match join_type {
            JoinType::Semi | JoinType::Anti => false,
            _ => build_is_left,
        };
        let left_schema = left.schema();
        let right_schema = right.schema();
        let combined_schema = Arc::new(left_schema.join(&right_schema));
        let core = JoinCore {
            join_type,
            build_is_left,
            condition,
            combined_schema,
            output_schema,
            left_width: left_schema.len(),
            right_width: right_schema.len(),
        };
        Self {
            left,
            right,
            core,
            partitions: partitions.max(2),
            carried_build_rows: Vec::new(),
            spill_dir: None,
            partitioned: false,
            current_partition: 0,
            pending: Vec::new(),
        }
    }

    fn from_escalation(
        core: JoinCore,
        carried_build_rows: Vec<Row>,
        build: Box<dyn Operator>,
        probe: Box<dyn Operator>,
        partitions: usize,
    ) -> Self {
        // map build/probe back onto left/right roles
        let (left, right) = if core.build_is_left {
            (build, probe)
        } else {
            (probe, build)
        };
        Self {
            left,
            right,
            core,
            partitions: partitions.max(2),
            carried_build_rows,
            spill_dir: None,
            partitioned: false,
            current_partition: 0,
            pending: Vec::new(),
        }
    }

    fn partition_of(key: &Option<Vec<Value>>, partitions: usize) -> usize {
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() as usize) % partitions
            }
            // null keys cluster in partition 0 so preserved-side padding
            // still sees them exactly once
            None => 0,
        }
    }

    fn spill_path(&self, side: &str, partition: usize) -> PathBuf {
        self.spill_dir
            .as_ref()
            .expect("spill dir created during partitioning")
            .join(format!("{}_{:04}.jsonl", side, partition))
    }

    fn partition_side(
        &mut self,
        is_build: bool,
        ctx: &ExecutionContext,
    ) -> Result<()> {
        let side_label = if is_build { "build" } else { "probe" };
        let (schema, keys) = if is_build {
            let schema = if self.core.build_is_left {
                self.left.schema()
            } else {
                self.right.schema()
            };
            (schema, self.core.build_keys().to_vec())
        } else {
            let schema = if self.core.build_is_left {
                self.right.schema()
            } else {
                self.left.schema()
            };
            (schema, self.core.probe_keys().to_vec())
        };
        let evaluator = ExpressionEvaluator::new(schema);

        let mut writers: Vec<BufWriter<File>> = Vec::with_capacity(self.partitions);
        for i in 0..self.partitions {
            let path = self.spill_path(side_label, i);
            let file = File::create(&path)
                .map_err(|e| EngineError::Execution(format!("spill create: {}", e)))?;
            writers.push(BufWriter::new(file));
        }

        let mut write_row = |row: &Row, writers: &mut Vec<BufWriter<File>>| -> Result<()> {
            let key = evaluate_join_key(&evaluator, &keys, row)?;
            let partition = Self::partition_of(&key, self.partitions);
            let line = serde_json::to_string(row)
                .map_err(|e| EngineError::Execution(format!("spill encode: {}", e)))?;
            writeln!(writers[partition], "{}", line)
                .map_err(|e| EngineError::Execution(format!("spill write: {}", e)))?;
            Ok(())
        };

        if is_build {
            for row in std::mem::take(&mut self.carried_build_rows) {
                write_row(&row, &mut writers)?;
            }
        }
        loop {
            ctx.checkpoint()?;
            let side = if is_build {
                if self.core.build_is_left {
                    &mut self.left
                } else {
                    &mut self.right
                }
            } else if self.core.build_is_left {
                &mut self.right
            } else {
                &mut self.left
            };
            let Some(batch) = side.next(ctx)? else { break };
            for row in &batch.rows {
                write_row(row, &mut writers)?;
            }
        }
        for mut writer in writers {
            writer
                .flush()
                .map_err(|e| EngineError::Execution(format!("spill flush: {}", e)))?;
        }
        Ok(())
    }

    fn load_partition(&self, side: &str, partition: usize) -> Result<Vec<Row>> {
        let path = self.spill_path(side, partition);
        let file =
            File::open(&path).map_err(|e| EngineError::Execution(format!("spill open: {}", e)))?;
        let reader = BufReader::new(file);
        let mut rows = Vec::new();
        for line in reader.lines() {
            let line =
                line.map_err(|e| EngineError::Execution(format!("spill read: {}", e)))?;
            if line.is_empty() {
                continue;
            }
            let row: Row = serde_json::from_str(&line)
                .map_err(|e| EngineError::Execution(format!("spill decode: {}", e)))?;
            rows.push(row);
        }
        Ok(rows)
    }

    /// Join one partition entirely in memory.
    fn join_partition(&self, partition: usize, ctx: &ExecutionContext) -> Result<Vec<Row>> {
        let build_rows = self.load_partition("build", partition)?;
        let probe_rows = self.load_partition("probe", partition)?;
        let bytes: usize = build_rows
            .iter()
            .map(|r| r.iter().map(|v| v.estimated_size()).sum::<usize>() + 24)
            .sum();
        ctx.memory.try_reserve(bytes)?;

        let result = (|| {
            let build_schema = if self.core.build_is_left {
                // schemas only matter for key evaluation widths
                self.left.schema()
            } else {
                self.right.schema()
            };
            let probe_schema = if self.core.build_is_left {
                self.right.schema()
            } else {
                self.left.schema()
            };
            let build_eval = ExpressionEvaluator::new(build_schema);
            let probe_eval = ExpressionEvaluator::new(probe_schema);
            let residual_eval =
                ExpressionEvaluator::new(Arc::clone(&self.core.combined_schema));

            let mut table: HashMap<Vec<Value>, Vec<usize>> = HashMap::new();
            for (idx, row) in build_rows.iter().enumerate() {
                if let Some(key) = evaluate_join_key(&build_eval, self.core.build_keys(), row)? {
                    table.entry(key).or_default().push(idx);
                }
            }
            let mut matched = vec![false; build_rows.len()];
            let mut out = Vec::new();
            for row in &probe_rows {
                ctx.cancel.check()?;
                let key = evaluate_join_key(&probe_eval, self.core.probe_keys(), row)?;
                self.core.probe_row(
                    row,
                    key,
                    &table,
                    &build_rows,
                    &mut matched,
                    &residual_eval,
                    None,
                    &mut out,
                )?;
            }
            if self.core.build_side_preserved() {
                for (idx, row) in build_rows.iter().enumerate() {
                    if !matched[idx] {
                        out.push(self.core.pad_build(row));
                    }
                }
            }
            Ok(out)
        })();
        ctx.memory.release(bytes);
        result
    }
}

impl Operator for PartitionedHashJoinExec {
    fn name(&self) -> String {
        format!("PartitionedHashJoin({:?})", self.core.join_type)
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.core.output_schema)
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        if self.spill_dir.is_none() {
            let dir = ctx.spill_dir.join(format!(
                "join_{}_{}",
                ctx.query_id,
                uuid::Uuid::new_v4().simple()
            ));
            std::fs::create_dir_all(&dir)
                .map_err(|e| EngineError::Execution(format!("spill dir: {}", e)))?;
            self.spill_dir = Some(dir);
        }
        Ok(())
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<Batch>> {
        ctx.checkpoint()?;
        if !self.partitioned {
            self.partition_side(true, ctx)?;
            self.partition_side(false, ctx)?;
            self.partitioned = true;
        }
        loop {
            if !self.pending.is_empty() {
                let take = self.pending.len().min(ctx.batch_size());
                let rows: Vec<Row> = self.pending.drain(..take).collect();
                return Ok(Some(Batch::new(
                    Arc::clone(&self.core.output_schema),
                    rows,
                )));
            }
            if self.current_partition >= self.partitions {
                return Ok(None);
            }
            let partition = self.current_partition;
            self.current_partition += 1;
            self.pending = self.join_partition(partition, ctx)?;
        }
    }

    fn close(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.left.close(ctx)?;
        self.right.close(ctx)?;
        if let Some(dir) = self.spill_dir.take() {
            let _ = std::fs::remove_dir_all(dir);
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

    fn schema(cols: &[(&str, &str)]) -> Arc<Schema> {
        Arc::new(Schema::new(
            cols.iter()
                .map(|(rel, name)| {
                    Column::new(*name, ColumnType::Int64, true).with_relation(*rel)
                })
                .collect(),
        ))
    }

    fn side(rel: &str, col: &str, values: Vec<Option<i64>>) -> Box<dyn Operator> {
        Box::new(InlineResultsExec::new(
            format!("side({})", rel),
            schema(&[(rel, col)]),
            Arc::new(
                values
                    .into_iter()
                    .map(|v| vec![v.map(Value::Integer).unwrap_or(Value::Null)])
                    .collect(),
            ),
        ))
    }

    fn condition(left: &str, lcol: &str, right: &str, rcol: &str) -> JoinCondition {
        JoinCondition {
            left_keys: vec![Expr::qualified_column(left, lcol)],
            right_keys: vec![Expr::qualified_column(right, rcol)],
            residual: None,
        }
    }

    fn out_schema() -> Arc<Schema> {
        schema(&[("l", "a"), ("r", "b")])
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
    fn test_inner_join_matches() {
        let ctx = test_context();
        let join = HashJoinExec::new(
            side("l", "a", vec![Some(1), Some(2), Some(3)]),
            side("r", "b", vec![Some(2), Some(3), Some(4)]),
            JoinType::Inner,
            condition("l", "a", "r", "b"),
            true,
            out_schema(),
            4,
        );
        let mut rows = run(join, &ctx);
        rows.sort_by(|a, b| a[0].partial_cmp(&b[0]).unwrap());
        assert_eq!(
            rows,
            vec![
                vec![Value::Integer(2), Value::Integer(2)],
                vec![Value::Integer(3), Value::Integer(3)],
            ]
        );
    }

    #[test]
    fn test_null_keys_never_match() {
        let ctx = test_context();
        let join = HashJoinExec::new(
            side("l", "a", vec![None, Some(1)]),
            side("r", "b", vec![None, Some(1)]),
            JoinType::Inner,
            condition("l", "a", "r", "b"),
            true,
            out_schema(),
            4,
        );
        let rows = run(join, &ctx);
        assert_eq!(rows, vec![vec![Value::Integer(1), Value::Integer(1)]]);
    }

    #[test]
    fn test_left_join_pads_unmatched() {
        let ctx = test_context();
        let join = HashJoinExec::new(
            side("l", "a", vec![Some(1), Some(2)]),
            side("r", "b", vec![Some(2)]),
            JoinType::Left,
            condition("l", "a", "r", "b"),
            false,
            out_schema(),
            4,
        );
        let mut rows = run(join, &ctx);
        rows.sort_by(|a, b| a[0].partial_cmp(&b[0]).unwrap());
        assert_eq!(
            rows,
            vec![
                vec![Value::Integer(1), Value::Null],
                vec![Value::Integer(2), Value::Integer(2)],
            ]
        );
    }

    #[test]
    fn test_full_join_pads_both_sides() {
        let ctx = test_context();
        let join = HashJoinExec::new(
            side("l", "a", vec![Some(1), Some(2)]),
            side("r", "b", vec![Some(2), Some(3)]),
            JoinType::Full,
            condition("l", "a", "r", "b"),
            true,
            out_schema(),
            4,
        );
        let rows = run(join, &ctx);
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn test_semi_and_anti() {
        let ctx = test_context();
        let semi = HashJoinExec::new(
            side("l", "a", vec![Some(1), Some(2), Some(3)]),
            side("r", "b", vec![Some(2), Some(2), Some(3)]),
            JoinType::Semi,
            condition("l", "a", "r", "b"),
            true,
            schema(&[("l", "a")]),
            4,
        );
        let mut semi_rows = run(semi, &ctx);
        semi_rows.sort_by(|a, b| a[0].partial_cmp(&b[0]).unwrap());
        // semi join never duplicates despite two matching build rows
        assert_eq!(
            semi_rows,
            vec![vec![Value::Integer(2)], vec![Value::Integer(3)]]
        );

        let anti = HashJoinExec::new(
            side("l", "a", vec![Some(1), Some(2), Some(3)]),
            side("r", "b", vec![Some(2), Some(3)]),
            JoinType::Anti,
            condition("l", "a", "r", "b"),
            true,
            schema(&[("l", "a")]),
            4,
        );
        assert_eq!(run(anti, &ctx), vec![vec![Value::Integer(1)]]);
    }

    #[test]
    fn test_memory_pressure_escalates_to_partitioned() {
        // a budget too small for the build side (but big enough for one
        // partition) forces escalation
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = test_context_with_memory(4_096);
        ctx.spill_dir = tmp.path().to_path_buf();
        let join = HashJoinExec::new(
            side("l", "a", (0..200).map(Some).collect()),
            side("r", "b", (0..200).map(Some).collect()),
            JoinType::Inner,
            condition("l", "a", "r", "b"),
            true,
            out_schema(),
            4,
        );
        let rows = run(join, &ctx);
        assert_eq!(rows.len(), 200);
        assert!(!ctx.monitor.adaptations().is_empty());
        assert_eq!(ctx.memory.used(), 0);
    }

    #[test]
    fn test_partitioned_join_direct() {
        let ctx = test_context();
        let join = PartitionedHashJoinExec::new(
            side("l", "a", (0..50).map(Some).collect()),
            side("r", "b", (25..75).map(Some).collect()),
            JoinType::Inner,
            condition("l", "a", "r", "b"),
            true,
            out_schema(),
            8,
        );
        let rows = run(join, &ctx);
        assert_eq!(rows.len(), 25);
    }

    #[test]
    fn test_bloom_filter_no_false_negatives() {
        let mut bloom = BloomFilter::new(100);
        for i in 0..100i64 {
            bloom.insert(&[Value::Integer(i)]);
        }
        for i in 0..100i64 {
            assert!(bloom.contains(&[Value::Integer(i)]));
        }
    }
}

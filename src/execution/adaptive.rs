// Adaptive execution.
//
// The adaptive join wrapper samples its build side before committing to the
// planned algorithm. When the observed cardinality deviates from the
// planner's estimate beyond the configured threshold, the algorithm is
// re-selected at the batch boundary (broadcast hash escalates to partitioned
// hash, an over-partitioned plan falls back to a plain hash join) and the
// switch lands in the monitor.

use crate::common::{Batch, Row, Schema};
use crate::error::{EngineError, Result};
use crate::execution::hash_join::{HashJoinExec, JoinCondition, PartitionedHashJoinExec};
use crate::execution::{ExecutionContext, Operator};
use crate::federation::JoinAlgorithm;
use crate::monitoring::AdaptationEvent;
use crate::plan::JoinType;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdaptiveSettings {
    pub enabled: bool,
    /// Rows sampled per operator before estimates are re-checked.
    pub sample_rows: usize,
    /// Relative deviation (|actual - estimated| / estimated) that triggers
    /// re-selection.
    pub deviation_threshold: f64,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rows: 1_000,
            deviation_threshold: 0.5,
        }
    }
}

/// Equi-width histogram over sampled values. Samples are kept raw (bounded)
/// and bucketed on demand, so the bucket bounds cover the whole sample.
/// Feeds selectivity and skew estimates back into re-planning decisions.
#[derive(Debug, Clone)]
pub struct Histogram {
    samples: Vec<f64>,
    num_buckets: usize,
    capacity: usize,
}

impl Histogram {
    pub fn new(num_buckets: usize) -> Self {
        Self {
            samples: Vec::new(),
            num_buckets: num_buckets.max(1),
            capacity: 16_384,
        }
    }

    pub fn add(&mut self, value: f64) {
        if self.samples.len() < self.capacity && value.is_finite() {
            self.samples.push(value);
        }
    }

    fn buckets(&self) -> Option<(f64, f64, Vec<u64>)> {
        if self.samples.is_empty() {
            return None;
        }
        let min = self.samples.iter().cloned().fold(f64::MAX, f64::min);
        let max = self.samples.iter().cloned().fold(f64::MIN, f64::max);
        let span = (max - min).max(f64::EPSILON);
        let mut buckets = vec![0u64; self.num_buckets];
        for &v in &self.samples {
            let idx = (((v - min) / span) * (self.num_buckets - 1) as f64) as usize;
            buckets[idx.min(self.num_buckets - 1)] += 1;
        }
        Some((min, span, buckets))
    }

    /// Fraction of sampled values inside `[low, high]`. 0.5 when nothing was
    /// sampled.
    pub fn estimate_selectivity(&self, low: f64, high: f64) -> f64 {
        let Some((min, span, buckets)) = self.buckets() else {
            return 0.5;
        };
        let width = span / self.num_buckets as f64;
        let mut matching = 0u64;
        for (i, count) in buckets.iter().enumerate() {
            let bucket_low = min + i as f64 * width;
            let bucket_high = bucket_low + width;
            if bucket_high >= low && bucket_low <= high {
                matching += count;
            }
        }
        matching as f64 / self.samples.len() as f64
    }

    /// Largest single-bucket share of the sample; near 1.0 means the values
    /// cluster heavily.
    pub fn skew(&self) -> f64 {
        match self.buckets() {
            Some((_, _, buckets)) => {
                *buckets.iter().max().unwrap_or(&0) as f64 / self.samples.len() as f64
            }
            None => 0.0,
        }
    }
}

/// Replays buffered batches before draining the remaining input. Lets the
/// sampled prefix be handed to whichever operator wins re-selection.
pub struct ReplayExec {
    buffered: VecDeque<Batch>,
    rest: Box<dyn Operator>,
    schema: Arc<Schema>,
}

impl ReplayExec {
    pub fn new(buffered: Vec<Batch>, rest: Box<dyn Operator>) -> Self {
        let schema = rest.schema();
        Self {
            buffered: buffered.into(),
            rest,
            schema,
        }
    }
}

impl Operator for ReplayExec {
    fn name(&self) -> String {
        "Replay".to_string()
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.schema)
    }

    fn open(&mut self, _ctx: &ExecutionContext) -> Result<()> {
        // the wrapped input was opened by the sampler
        Ok(())
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<Batch>> {
        if let Some(batch) = self.buffered.pop_front() {
            return Ok(Some(batch));
        }
        self.rest.next(ctx)
    }

    fn close(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.rest.close(ctx)
    }
}

enum AdaptiveJoinState {
    Sampling,
    Running(Box<dyn Operator>),
}

/// Samples the designated build side, re-selects the join algorithm if the
/// planner's estimate was off, then delegates.
pub struct AdaptiveJoinExec {
    left: Option<Box<dyn Operator>>,
    right: Option<Box<dyn Operator>>,
    join_type: JoinType,
    condition: JoinCondition,
    planned: JoinAlgorithm,
    estimated_build_rows: u64,
    output_schema: Arc<Schema>,
    partitions: usize,
    state: AdaptiveJoinState,
}

impl AdaptiveJoinExec {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        left: Box<dyn Operator>,
        right: Box<dyn Operator>,
        join_type: JoinType,
        condition: JoinCondition,
        planned: JoinAlgorithm,
        estimated_build_rows: u64,
        output_schema: Arc<Schema>,
        partitions: usize,
    ) -> Self {
        Self {
            left: Some(left),
            right: Some(right),
            join_type,
            condition,
            planned,
            estimated_build_rows,
            output_schema,
            partitions,
            state: AdaptiveJoinState::Sampling,
        }
    }

    fn build_is_left(&self) -> bool {
        match self.planned {
            JoinAlgorithm::BroadcastHash { build_left } => build_left,
            _ => true,
        }
    }

    fn sample_and_select(&mut self, ctx: &ExecutionContext) -> Result<Box<dyn Operator>> {
        let build_is_left = self.build_is_left();
        let left = self.left.take().expect("inputs taken once");
        let right = self.right.take().expect("inputs taken once");
        let (mut build, probe) = if build_is_left {
            (left, right)
        } else {
            (right, left)
        };

        // sample the build side up to the window, building a key histogram
        // along the way
        let build_keys = if build_is_left {
            self.condition.left_keys.clone()
        } else {
            self.condition.right_keys.clone()
        };
        let key_eval = crate::execution::expressions::ExpressionEvaluator::new(build.schema());
        let mut histogram = Histogram::new(32);
        let mut buffered: Vec<Batch> = Vec::new();
        let mut sampled_rows = 0usize;
        let mut exhausted = false;
        while sampled_rows < ctx.adaptive.sample_rows.max(1) {
            ctx.checkpoint()?;
            match build.next(ctx)? {
                Some(batch) => {
                    sampled_rows += batch.num_rows();
                    if let Some(key) = build_keys.first() {
                        for row in &batch.rows {
                            match key_eval.evaluate(key, row)? {
                                crate::common::Value::Integer(i) => histogram.add(i as f64),
                                crate::common::Value::Float(f) => histogram.add(f),
                                _ => {}
                            }
                        }
                    }
                    buffered.push(batch);
                }
                None => {
                    exhausted = true;
                    break;
                }
            }
        }

        let estimated = self.estimated_build_rows.max(1);
        let actual_at_least = sampled_rows as u64;
        let deviation = (actual_at_least as f64 - estimated as f64).abs() / estimated as f64;
        let over_estimate = !exhausted && deviation > ctx.adaptive.deviation_threshold;
        let under_estimate = exhausted
            && deviation > ctx.adaptive.deviation_threshold
            && actual_at_least < estimated;

        // skewed keys cluster into few partitions; compensate with more
        let partitions = if histogram.skew() > 0.5 {
            self.partitions * 2
        } else {
            self.partitions
        };
        let selected = match self.planned {
            JoinAlgorithm::BroadcastHash { .. } if over_estimate => {
                JoinAlgorithm::PartitionedHash { partitions }
            }
            JoinAlgorithm::PartitionedHash { .. } if under_estimate => {
                JoinAlgorithm::BroadcastHash {
                    build_left: build_is_left,
                }
            }
            planned => planned,
        };

        if selected != self.planned {
            ctx.monitor.record_adaptation(AdaptationEvent {
                operator: "Join".into(),
                from_strategy: strategy_name(&self.planned).into(),
                to_strategy: strategy_name(&selected).into(),
                reason: format!(
                    "build side sampled {} rows against an estimate of {}",
                    if exhausted {
                        actual_at_least.to_string()
                    } else {
                        format!(">{}", actual_at_least)
                    },
                    estimated
                ),
                estimated_rows: estimated,
                actual_rows: actual_at_least,
            });
        }

        let build: Box<dyn Operator> = Box::new(ReplayExec::new(buffered, build));
        // both inputs are already open; the replay wrapper's open is a no-op
        let probe: Box<dyn Operator> = Box::new(ReplayExec::new(Vec::new(), probe));
        // restore left/right orientation for the concrete operator
        let (left, right) = if build_is_left {
            (build, probe)
        } else {
            (probe, build)
        };
        let op: Box<dyn Operator> = match selected {
            JoinAlgorithm::BroadcastHash { build_left } => {
                let mut op = HashJoinExec::new(
                    left,
                    right,
                    self.join_type,
                    self.condition.clone(),
                    build_left,
                    Arc::clone(&self.output_schema),
                    self.partitions,
                );
                op.open(ctx)?;
                Box::new(op)
            }
            JoinAlgorithm::PartitionedHash { partitions } => {
                let mut op = PartitionedHashJoinExec::new(
                    left,
                    right,
                    self.join_type,
                    self.condition.clone(),
                    build_is_left,
                    Arc::clone(&self.output_schema),
                    partitions,
                );
                op.open(ctx)?;
                return Ok(Box::new(op));
            }
            other => {
                return Err(EngineError::Internal(format!(
                    "adaptive join cannot host {:?}",
                    other
                )))
            }
        };
        Ok(op)
    }
}

fn strategy_name(algorithm: &JoinAlgorithm) -> &'static str {
    match algorithm {
        JoinAlgorithm::BroadcastHash { .. } => "broadcast_hash_join",
        JoinAlgorithm::PartitionedHash { .. } => "partitioned_hash_join",
        JoinAlgorithm::SortMerge => "sort_merge_join",
        JoinAlgorithm::IndexLookup => "index_join",
    }
}

impl Operator for AdaptiveJoinExec {
    fn name(&self) -> String {
        "AdaptiveJoin".to_string()
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.output_schema)
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        if let Some(left) = &mut self.left {
            left.open(ctx)?;
        }
        if let Some(right) = &mut self.right {
            right.open(ctx)?;
        }
        Ok(())
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<Batch>> {
        ctx.checkpoint()?;
        if matches!(self.state, AdaptiveJoinState::Sampling) {
            let op = self.sample_and_select(ctx)?;
            self.state = AdaptiveJoinState::Running(op);
        }
        match &mut self.state {
            AdaptiveJoinState::Running(op) => op.next(ctx),
            AdaptiveJoinState::Sampling => unreachable!("selected above"),
        }
    }

    fn close(&mut self, ctx: &ExecutionContext) -> Result<()> {
        if let AdaptiveJoinState::Running(op) = &mut self.state {
            op.close(ctx)?;
        }
        if let Some(left) = &mut self.left {
            left.close(ctx)?;
        }
        if let Some(right) = &mut self.right {
            right.close(ctx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Column, ColumnType, Value};
    use crate::execution::engine::test_support::test_context;
    use crate::execution::operators::InlineResultsExec;
    use crate::plan::Expr;

    fn side(rel: &str, col: &str, n: i64) -> Box<dyn Operator> {
        Box::new(InlineResultsExec::new(
            "side",
            Arc::new(Schema::new(vec![
                Column::new(col, ColumnType::Int64, true).with_relation(rel)
            ])),
            Arc::new((0..n).map(|i| vec![Value::Integer(i)]).collect()),
        ))
    }

    fn condition() -> JoinCondition {
        JoinCondition {
            left_keys: vec![Expr::qualified_column("l", "a")],
            right_keys: vec![Expr::qualified_column("r", "b")],
            residual: None,
        }
    }

    fn out_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Column::new("a", ColumnType::Int64, true).with_relation("l"),
            Column::new("b", ColumnType::Int64, true).with_relation("r"),
        ]))
    }

    #[test]
    fn test_switches_to_partitioned_on_underestimate() {
        let ctx = test_context();
        // planner expected 50 build rows; the build side actually has 5000
        let mut join = AdaptiveJoinExec::new(
            side("l", "a", 5_000),
            side("r", "b", 100),
            JoinType::Inner,
            condition(),
            JoinAlgorithm::BroadcastHash { build_left: true },
            50,
            out_schema(),
            4,
        );
        join.open(&ctx).unwrap();
        let mut rows = 0;
        while let Some(batch) = join.next(&ctx).unwrap() {
            rows += batch.num_rows();
        }
        join.close(&ctx).unwrap();
        assert_eq!(rows, 100);
        let adaptations = ctx.monitor.adaptations();
        assert_eq!(adaptations.len(), 1);
        assert_eq!(adaptations[0].to_strategy, "partitioned_hash_join");
    }

    #[test]
    fn test_histogram_selectivity_and_skew() {
        let mut h = Histogram::new(10);
        for i in 0..100 {
            h.add(i as f64);
        }
        let sel = h.estimate_selectivity(0.0, 49.0);
        assert!(sel > 0.3 && sel < 0.7, "selectivity {} out of range", sel);
        assert!(h.skew() < 0.3);

        let mut clustered = Histogram::new(10);
        for _ in 0..90 {
            clustered.add(5.0);
        }
        for i in 0..10 {
            clustered.add(i as f64 * 100.0);
        }
        assert!(clustered.skew() > 0.5);
    }

    #[test]
    fn test_accurate_estimate_keeps_plan() {
        let ctx = test_context();
        let mut join = AdaptiveJoinExec::new(
            side("l", "a", 100),
            side("r", "b", 100),
            JoinType::Inner,
            condition(),
            JoinAlgorithm::BroadcastHash { build_left: true },
            100,
            out_schema(),
            4,
        );
        join.open(&ctx).unwrap();
        let mut rows = 0;
        while let Some(batch) = join.next(&ctx).unwrap() {
            rows += batch.num_rows();
        }
        join.close(&ctx).unwrap();
        assert_eq!(rows, 100);
        assert!(ctx.monitor.adaptations().is_empty());
    }
}

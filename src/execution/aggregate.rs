// Hash aggregation.
//
// Groups key the hash table by the tuple of group values; NULL group values
// form their own groups. NULL inputs are skipped by every aggregate except
// COUNT(*). Output rows come out sorted by group key so runs are
// reproducible for a given plan. Large inputs with purely algebraic
// aggregates pre-aggregate chunk-parallel and merge.

use crate::common::{Batch, Decimal, Row, Schema, Value};
use crate::error::{EngineError, Result};
use crate::execution::expressions::ExpressionEvaluator;
use crate::execution::{ExecutionContext, ExecutionMode, Operator};
use crate::monitoring::AdaptationEvent;
use crate::plan::{AggExpr, AggFunc, Expr};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

/// Input row multiple below which parallel pre-aggregation is not worth it.
const PARALLEL_AGG_THRESHOLD: usize = 50_000;

// ============================================================================
// Accumulators
// ============================================================================

#[derive(Debug, Clone)]
enum SumState {
    Empty,
    Int(i128),
    Float(f64),
    Dec(Decimal),
}

#[derive(Debug, Clone)]
enum Accumulator {
    Count(u64),
    CountDistinct(HashSet<Value>),
    Sum(SumState),
    Min(Option<Value>),
    Max(Option<Value>),
    Avg { sum: f64, count: u64 },
    /// Welford-style totals for variance and stddev.
    Variance { count: u64, sum: f64, sum_sq: f64, stddev: bool },
    /// Full value list for order statistics.
    Ordered { values: Vec<f64>, fraction: f64, median: bool },
    Mode(HashMap<Value, u64>),
    Correlation { n: u64, sx: f64, sy: f64, sxy: f64, sx2: f64, sy2: f64 },
    MovingAvg { window: usize, values: VecDeque<f64> },
}

impl Accumulator {
    fn new(func: &AggFunc) -> Self {
        match func {
            AggFunc::Count => Accumulator::Count(0),
            AggFunc::CountDistinct => Accumulator::CountDistinct(HashSet::new()),
            AggFunc::Sum => Accumulator::Sum(SumState::Empty),
            AggFunc::Min => Accumulator::Min(None),
            AggFunc::Max => Accumulator::Max(None),
            AggFunc::Avg => Accumulator::Avg { sum: 0.0, count: 0 },
            AggFunc::Variance => Accumulator::Variance {
                count: 0,
                sum: 0.0,
                sum_sq: 0.0,
                stddev: false,
            },
            AggFunc::Stddev => Accumulator::Variance {
                count: 0,
                sum: 0.0,
                sum_sq: 0.0,
                stddev: true,
            },
            AggFunc::Median => Accumulator::Ordered {
                values: Vec::new(),
                fraction: 0.5,
                median: true,
            },
            AggFunc::Percentile(p) => Accumulator::Ordered {
                values: Vec::new(),
                fraction: *p,
                median: false,
            },
            AggFunc::Mode => Accumulator::Mode(HashMap::new()),
            AggFunc::Correlation => Accumulator::Correlation {
                n: 0,
                sx: 0.0,
                sy: 0.0,
                sxy: 0.0,
                sx2: 0.0,
                sy2: 0.0,
            },
            AggFunc::MovingAvg(window) => Accumulator::MovingAvg {
                window: (*window).max(1),
                values: VecDeque::new(),
            },
        }
    }

    fn update(&mut self, value: Option<&Value>, second: Option<&Value>) -> Result<()> {
        match self {
            Accumulator::Count(count) => {
                // COUNT(*) counts rows; COUNT(expr) counts non-null values
                match value {
                    None => *count += 1,
                    Some(v) if !v.is_null() => *count += 1,
                    _ => {}
                }
            }
            Accumulator::CountDistinct(seen) => {
                if let Some(v) = value {
                    if !v.is_null() {
                        seen.insert(v.clone());
                    }
                }
            }
            Accumulator::Sum(state) => {
                let Some(v) = non_null(value) else { return Ok(()) };
                *state = match (state.clone(), v) {
                    (SumState::Empty, Value::Integer(i)) => SumState::Int(*i as i128),
                    (SumState::Empty, Value::Float(f)) => SumState::Float(*f),
                    (SumState::Empty, Value::Decimal(d)) => SumState::Dec(*d),
                    (SumState::Int(acc), Value::Integer(i)) => SumState::Int(acc + *i as i128),
                    (SumState::Int(acc), Value::Float(f)) => SumState::Float(acc as f64 + f),
                    (SumState::Float(acc), Value::Integer(i)) => SumState::Float(acc + *i as f64),
                    (SumState::Float(acc), Value::Float(f)) => SumState::Float(acc + f),
                    (SumState::Dec(acc), Value::Decimal(d)) => SumState::Dec(acc.checked_add(d)?),
                    (SumState::Dec(acc), Value::Integer(i)) => {
                        SumState::Dec(acc.checked_add(&Decimal::from_i64(*i))?)
                    }
                    (_, other) => {
                        return Err(EngineError::TypeMismatch(format!(
                            "SUM over {}",
                            other.type_name()
                        )))
                    }
                };
            }
            Accumulator::Min(best) => {
                if let Some(v) = non_null(value) {
                    let replace = match best {
                        None => true,
                        Some(current) => {
                            v.partial_cmp(current).unwrap_or(Ordering::Greater)
                                == Ordering::Less
                        }
                    };
                    if replace {
                        *best = Some(v.clone());
                    }
                }
            }
            Accumulator::Max(best) => {
                if let Some(v) = non_null(value) {
                    let replace = match best {
                        None => true,
                        Some(current) => {
                            v.partial_cmp(current).unwrap_or(Ordering::Less)
                                == Ordering::Greater
                        }
                    };
                    if replace {
                        *best = Some(v.clone());
                    }
                }
            }
            Accumulator::Avg { sum, count } => {
                if let Some(f) = numeric(value)? {
                    *sum += f;
                    *count += 1;
                }
            }
            Accumulator::Variance { count, sum, sum_sq, .. } => {
                if let Some(f) = numeric(value)? {
                    *count += 1;
                    *sum += f;
                    *sum_sq += f * f;
                }
            }
            Accumulator::Ordered { values, .. } => {
                if let Some(f) = numeric(value)? {
                    values.push(f);
                }
            }
            Accumulator::Mode(counts) => {
                if let Some(v) = non_null(value) {
                    *counts.entry(v.clone()).or_insert(0) += 1;
                }
            }
            Accumulator::Correlation { n, sx, sy, sxy, sx2, sy2 } => {
                let (Some(x), Some(y)) = (numeric(value)?, numeric(second)?) else {
                    return Ok(());
                };
                *n += 1;
                *sx += x;
                *sy += y;
                *sxy += x * y;
                *sx2 += x * x;
                *sy2 += y * y;
            }
            Accumulator::MovingAvg { window, values } => {
                if let Some(f) = numeric(value)? {
                    if values.len() == *window {
                        values.pop_front();
                    }
                    values.push_back(f);
                }
            }
        }
        Ok(())
    }

    /// Merge a partial accumulator from parallel pre-aggregation. Only the
    /// algebraic variants support this.
    fn merge(&mut self, other: Accumulator) -> Result<()> {
        match (self, other) {
            (Accumulator::Count(a), Accumulator::Count(b)) => *a += b,
            (Accumulator::Sum(a), Accumulator::Sum(b)) => {
                *a = match (a.clone(), b) {
                    (SumState::Empty, s) => s,
                    (s, SumState::Empty) => s,
                    (SumState::Int(x), SumState::Int(y)) => SumState::Int(x + y),
                    (SumState::Float(x), SumState::Float(y)) => SumState::Float(x + y),
                    (SumState::Dec(x), SumState::Dec(y)) => SumState::Dec(x.checked_add(&y)?),
                    (SumState::Int(x), SumState::Float(y))
                    | (SumState::Float(y), SumState::Int(x)) => SumState::Float(x as f64 + y),
                    _ => return Err(EngineError::Internal("sum state mismatch".into())),
                };
            }
            (Accumulator::Min(a), Accumulator::Min(b)) => {
                if let Some(v) = b {
                    let dummy = Some(&v);
                    let mut acc = Accumulator::Min(a.take());
                    acc.update(dummy, None)?;
                    if let Accumulator::Min(inner) = acc {
                        *a = inner;
                    }
                }
            }
            (Accumulator::Max(a), Accumulator::Max(b)) => {
                if let Some(v) = b {
                    let dummy = Some(&v);
                    let mut acc = Accumulator::Max(a.take());
                    acc.update(dummy, None)?;
                    if let Accumulator::Max(inner) = acc {
                        *a = inner;
                    }
                }
            }
            (
                Accumulator::Avg { sum: asum, count: acount },
                Accumulator::Avg { sum: bsum, count: bcount },
            ) => {
                *asum += bsum;
                *acount += bcount;
            }
            _ => return Err(EngineError::Internal("non-mergeable accumulator".into())),
        }
        Ok(())
    }

    fn finalize(self) -> Result<Value> {
        Ok(match self {
            Accumulator::Count(count) => Value::Integer(count as i64),
            Accumulator::CountDistinct(seen) => Value::Integer(seen.len() as i64),
            Accumulator::Sum(state) => match state {
                SumState::Empty => Value::Null,
                SumState::Int(i) => {
                    if i > i64::MAX as i128 || i < i64::MIN as i128 {
                        return Err(EngineError::Arithmetic("SUM overflow".into()));
                    }
                    Value::Integer(i as i64)
                }
                SumState::Float(f) => Value::Float(f),
                SumState::Dec(d) => Value::Decimal(d),
            },
            Accumulator::Min(v) | Accumulator::Max(v) => v.unwrap_or(Value::Null),
            Accumulator::Avg { sum, count } => {
                if count == 0 {
                    Value::Null
                } else {
                    Value::Float(sum / count as f64)
                }
            }
            Accumulator::Variance { count, sum, sum_sq, stddev } => {
                if count < 2 {
                    Value::Null
                } else {
                    let n = count as f64;
                    let variance = (sum_sq - sum * sum / n) / (n - 1.0);
                    let variance = variance.max(0.0);
                    Value::Float(if stddev { variance.sqrt() } else { variance })
                }
            }
            Accumulator::Ordered { mut values, fraction, median } => {
                if values.is_empty() {
                    return Ok(Value::Null);
                }
                values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
                if median && values.len() % 2 == 0 {
                    let hi = values.len() / 2;
                    Value::Float((values[hi - 1] + values[hi]) / 2.0)
                } else {
                    let rank = ((fraction * values.len() as f64).ceil() as usize)
                        .clamp(1, values.len());
                    Value::Float(values[rank - 1])
                }
            }
            Accumulator::Mode(counts) => {
                // deterministic: highest count, ties to the smallest value
                counts
                    .into_iter()
                    .max_by(|(va, ca), (vb, cb)| {
                        ca.cmp(cb).then_with(|| {
                            vb.partial_cmp(va).unwrap_or(Ordering::Equal)
                        })
                    })
                    .map(|(v, _)| v)
                    .unwrap_or(Value::Null)
            }
            Accumulator::Correlation { n, sx, sy, sxy, sx2, sy2 } => {
                if n < 2 {
                    Value::Null
                } else {
                    let nf = n as f64;
                    let cov = sxy - sx * sy / nf;
                    let vx = sx2 - sx * sx / nf;
                    let vy = sy2 - sy * sy / nf;
                    if vx <= 0.0 || vy <= 0.0 {
                        Value::Null
                    } else {
                        Value::Float(cov / (vx.sqrt() * vy.sqrt()))
                    }
                }
            }
            Accumulator::MovingAvg { values, .. } => {
                if values.is_empty() {
                    Value::Null
                } else {
                    Value::Float(values.iter().sum::<f64>() / values.len() as f64)
                }
            }
        })
    }
}

fn non_null(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

fn numeric(value: Option<&Value>) -> Result<Option<f64>> {
    match non_null(value) {
        None => Ok(None),
        Some(Value::Integer(i)) => Ok(Some(*i as f64)),
        Some(Value::Float(f)) => Ok(Some(*f)),
        Some(Value::Decimal(d)) => Ok(Some(d.to_f64())),
        Some(other) => Err(EngineError::TypeMismatch(format!(
            "numeric aggregate over {}",
            other.type_name()
        ))),
    }
}

fn is_algebraic(func: &AggFunc) -> bool {
    matches!(
        func,
        AggFunc::Count | AggFunc::Sum | AggFunc::Min | AggFunc::Max | AggFunc::Avg
    )
}

// ============================================================================
// Operator
// ============================================================================

type GroupMap = HashMap<Vec<Value>, Vec<Accumulator>>;

fn accumulate_rows(
    rows: &[Row],
    group_keys: &[Expr],
    aggregates: &[AggExpr],
    evaluator: &ExpressionEvaluator,
) -> Result<GroupMap> {
    let mut groups: GroupMap = HashMap::new();
    for row in rows {
        let mut key = Vec::with_capacity(group_keys.len());
        for expr in group_keys {
            key.push(evaluator.evaluate(expr, row)?);
        }
        let accs = groups
            .entry(key)
            .or_insert_with(|| aggregates.iter().map(|a| Accumulator::new(&a.func)).collect());
        for (agg, acc) in aggregates.iter().zip(accs.iter_mut()) {
            let value = match &agg.arg {
                Some(expr) => Some(evaluator.evaluate(expr, row)?),
                None => None,
            };
            let second = match &agg.second_arg {
                Some(expr) => Some(evaluator.evaluate(expr, row)?),
                None => None,
            };
            acc.update(value.as_ref(), second.as_ref())?;
        }
    }
    Ok(groups)
}

pub struct AggregateExec {
    input: Box<dyn Operator>,
    group_keys: Vec<Expr>,
    aggregates: Vec<AggExpr>,
    output_schema: Arc<Schema>,
    output: Option<Vec<Row>>,
    cursor: usize,
    reserved_bytes: usize,
}

impl AggregateExec {
    pub fn new(
        input: Box<dyn Operator>,
        group_keys: Vec<Expr>,
        aggregates: Vec<AggExpr>,
        output_schema: Arc<Schema>,
    ) -> Self {
        Self {
            input,
            group_keys,
            aggregates,
            output_schema,
            output: None,
            cursor: 0,
            reserved_bytes: 0,
        }
    }

    fn compute(&mut self, ctx: &ExecutionContext) -> Result<()> {
        let evaluator = ExpressionEvaluator::new(self.input.schema());
        let mut rows: Vec<Row> = Vec::new();
        loop {
            ctx.checkpoint()?;
            let Some(batch) = self.input.next(ctx)? else { break };
            let bytes = batch.estimated_size();
            ctx.memory.try_reserve(bytes)?;
            self.reserved_bytes += bytes;
            rows.extend(batch.rows);
        }

        let all_algebraic = self.aggregates.iter().all(|a| is_algebraic(&a.func));
        let parallel = ctx.mode == ExecutionMode::Adaptive
            && all_algebraic
            && rows.len() >= PARALLEL_AGG_THRESHOLD;

        let mut groups: GroupMap = if parallel {
            ctx.monitor.record_adaptation(AdaptationEvent {
                operator: "Aggregate".into(),
                from_strategy: "hash_aggregate".into(),
                to_strategy: "parallel_hash_aggregate".into(),
                reason: "large input with algebraic aggregates".into(),
                estimated_rows: 0,
                actual_rows: rows.len() as u64,
            });
            let chunk_size = (rows.len() / rayon::current_num_threads()).max(1_024);
            let group_keys = self.group_keys.clone();
            let aggregates = self.aggregates.clone();
            let partials: Vec<Result<GroupMap>> = rows
                .par_chunks(chunk_size)
                .map(|chunk| accumulate_rows(chunk, &group_keys, &aggregates, &evaluator))
                .collect();
            let mut merged: GroupMap = HashMap::new();
            for partial in partials {
                for (key, accs) in partial? {
                    match merged.get_mut(&key) {
                        Some(existing) => {
                            for (a, b) in existing.iter_mut().zip(accs) {
                                a.merge(b)?;
                            }
                        }
                        None => {
                            merged.insert(key, accs);
                        }
                    }
                }
            }
            merged
        } else {
            accumulate_rows(&rows, &self.group_keys, &self.aggregates, &evaluator)?
        };

        // a global aggregation over no rows still produces one row
        if groups.is_empty() && self.group_keys.is_empty() {
            groups.insert(
                Vec::new(),
                self.aggregates
                    .iter()
                    .map(|a| Accumulator::new(&a.func))
                    .collect(),
            );
        }

        let mut out: Vec<Row> = Vec::with_capacity(groups.len());
        for (key, accs) in groups {
            let mut row = key;
            for acc in accs {
                row.push(acc.finalize()?);
            }
            out.push(row);
        }
        // reproducible output order for a given plan
        let key_width = self.group_keys.len();
        out.sort_by(|a, b| {
            for i in 0..key_width {
                let ord = a[i]
                    .partial_cmp(&b[i])
                    .unwrap_or_else(|| a[i].to_string().cmp(&b[i].to_string()));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        self.output = Some(out);
        Ok(())
    }
}

impl Operator for AggregateExec {
    fn name(&self) -> String {
        "Aggregate".to_string()
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.output_schema)
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.input.open(ctx)
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<Batch>> {
        ctx.checkpoint()?;
        if self.output.is_none() {
            let started = Instant::now();
            self.compute(ctx)?;
            ctx.monitor.record_operator("Aggregate", |m| {
                m.wall_nanos += started.elapsed().as_nanos() as u64;
                m.rows_out += self.output.as_ref().map(|o| o.len()).unwrap_or(0) as u64;
            });
        }
        let rows = self.output.as_mut().expect("computed above");
        if self.cursor >= rows.len() {
            return Ok(None);
        }
        let end = (self.cursor + ctx.batch_size()).min(rows.len());
        let out = rows[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(Some(Batch::new(Arc::clone(&self.output_schema), out)))
    }

    fn close(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.input.close(ctx)?;
        ctx.memory.release(self.reserved_bytes);
        self.reserved_bytes = 0;
        self.output = None;
        self.cursor = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Column, ColumnType};
    use crate::execution::engine::test_support::test_context;
    use crate::execution::operators::InlineResultsExec;

    fn input(rows: Vec<Vec<Value>>) -> Box<dyn Operator> {
        Box::new(InlineResultsExec::new(
            "in",
            Arc::new(Schema::new(vec![
                Column::new("dept", ColumnType::Utf8, true),
                Column::new("salary", ColumnType::Int64, true),
            ])),
            Arc::new(rows),
        ))
    }

    fn out_schema(names: &[&str]) -> Arc<Schema> {
        Arc::new(Schema::new(
            names
                .iter()
                .map(|n| Column::new(*n, ColumnType::Int64, true))
                .collect(),
        ))
    }

    fn agg(func: AggFunc, arg: Option<Expr>, alias: &str) -> AggExpr {
        AggExpr {
            func,
            arg,
            second_arg: None,
            alias: alias.to_string(),
        }
    }

    fn run(mut op: AggregateExec, ctx: &ExecutionContext) -> Vec<Row> {
        op.open(ctx).unwrap();
        let mut rows = Vec::new();
        while let Some(batch) = op.next(ctx).unwrap() {
            rows.extend(batch.rows);
        }
        op.close(ctx).unwrap();
        rows
    }

    fn dept(d: &str, salary: Option<i64>) -> Vec<Value> {
        vec![
            Value::String(d.to_string()),
            salary.map(Value::Integer).unwrap_or(Value::Null),
        ]
    }

    #[test]
    fn test_group_by_with_null_group() {
        let ctx = test_context();
        let rows = vec![
            dept("a", Some(10)),
            dept("a", Some(20)),
            vec![Value::Null, Value::Integer(5)],
            vec![Value::Null, Value::Integer(7)],
        ];
        let exec = AggregateExec::new(
            input(rows),
            vec![Expr::column("dept")],
            vec![agg(AggFunc::Count, None, "count(*)")],
            out_schema(&["dept", "count(*)"]),
        );
        let out = run(exec, &ctx);
        // NULL forms its own group; NULL sorts first
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], vec![Value::Null, Value::Integer(2)]);
        assert_eq!(
            out[1],
            vec![Value::String("a".into()), Value::Integer(2)]
        );
    }

    #[test]
    fn test_count_star_on_empty_input_is_zero() {
        let ctx = test_context();
        let exec = AggregateExec::new(
            input(vec![]),
            vec![],
            vec![agg(AggFunc::Count, None, "count(*)")],
            out_schema(&["count(*)"]),
        );
        let out = run(exec, &ctx);
        assert_eq!(out, vec![vec![Value::Integer(0)]]);
    }

    #[test]
    fn test_nulls_skipped_in_aggregates() {
        let ctx = test_context();
        let rows = vec![dept("a", Some(10)), dept("a", None), dept("a", Some(20))];
        let exec = AggregateExec::new(
            input(rows),
            vec![],
            vec![
                agg(AggFunc::Count, Some(Expr::column("salary")), "count"),
                agg(AggFunc::Avg, Some(Expr::column("salary")), "avg"),
                agg(AggFunc::Sum, Some(Expr::column("salary")), "sum"),
            ],
            out_schema(&["count", "avg", "sum"]),
        );
        let out = run(exec, &ctx);
        assert_eq!(
            out,
            vec![vec![
                Value::Integer(2),
                Value::Float(15.0),
                Value::Integer(30)
            ]]
        );
    }

    #[test]
    fn test_statistical_aggregates() {
        let ctx = test_context();
        let rows = (1..=5)
            .map(|i| dept("a", Some(i)))
            .collect::<Vec<_>>();
        let exec = AggregateExec::new(
            input(rows),
            vec![],
            vec![
                agg(AggFunc::Median, Some(Expr::column("salary")), "median"),
                agg(
                    AggFunc::Percentile(0.8),
                    Some(Expr::column("salary")),
                    "p80",
                ),
                agg(AggFunc::Variance, Some(Expr::column("salary")), "var"),
                agg(AggFunc::Stddev, Some(Expr::column("salary")), "stddev"),
            ],
            out_schema(&["median", "p80", "var", "stddev"]),
        );
        let out = run(exec, &ctx);
        assert_eq!(out[0][0], Value::Float(3.0));
        assert_eq!(out[0][1], Value::Float(4.0));
        // sample variance of 1..5 is 2.5
        assert_eq!(out[0][2], Value::Float(2.5));
        match out[0][3] {
            Value::Float(s) => assert!((s - 2.5f64.sqrt()).abs() < 1e-9),
            ref other => panic!("expected float, got {:?}", other),
        }
    }

    #[test]
    fn test_mode_and_count_distinct() {
        let ctx = test_context();
        let rows = vec![
            dept("a", Some(1)),
            dept("a", Some(2)),
            dept("a", Some(2)),
            dept("a", Some(3)),
        ];
        let exec = AggregateExec::new(
            input(rows),
            vec![],
            vec![
                agg(AggFunc::Mode, Some(Expr::column("salary")), "mode"),
                agg(
                    AggFunc::CountDistinct,
                    Some(Expr::column("salary")),
                    "distinct",
                ),
            ],
            out_schema(&["mode", "distinct"]),
        );
        let out = run(exec, &ctx);
        assert_eq!(out, vec![vec![Value::Integer(2), Value::Integer(3)]]);
    }

    #[test]
    fn test_correlation() {
        let ctx = test_context();
        // perfectly correlated pairs
        let rows: Vec<Vec<Value>> = (1..=10)
            .map(|i| vec![Value::Integer(i), Value::Integer(2 * i)])
            .collect();
        let input = Box::new(InlineResultsExec::new(
            "in",
            Arc::new(Schema::new(vec![
                Column::new("x", ColumnType::Int64, true),
                Column::new("y", ColumnType::Int64, true),
            ])),
            Arc::new(rows),
        ));
        let exec = AggregateExec::new(
            input,
            vec![],
            vec![AggExpr {
                func: AggFunc::Correlation,
                arg: Some(Expr::column("x")),
                second_arg: Some(Expr::column("y")),
                alias: "corr".into(),
            }],
            out_schema(&["corr"]),
        );
        let out = run(exec, &ctx);
        match out[0][0] {
            Value::Float(c) => assert!((c - 1.0).abs() < 1e-9),
            ref other => panic!("expected float, got {:?}", other),
        }
    }

    #[test]
    fn test_moving_avg_over_trailing_window() {
        let ctx = test_context();
        let rows = (1..=10).map(|i| dept("a", Some(i))).collect::<Vec<_>>();
        let exec = AggregateExec::new(
            input(rows),
            vec![],
            vec![agg(
                AggFunc::MovingAvg(3),
                Some(Expr::column("salary")),
                "mavg",
            )],
            out_schema(&["mavg"]),
        );
        let out = run(exec, &ctx);
        // mean of the last 3 values (8, 9, 10)
        assert_eq!(out[0][0], Value::Float(9.0));
    }
}

// Window functions.
//
// Partitions are materialized, sorted by the order keys, and each function
// appends one column. RANK leaves gaps on ties, DENSE_RANK does not; LEAD and
// LAG take an offset and an optional default; NTILE spreads the remainder
// over the leading buckets.

use crate::common::{Batch, Row, Schema, Value};
use crate::error::{EngineError, Result};
use crate::execution::expressions::ExpressionEvaluator;
use crate::execution::{compare_key_values, evaluate_keys, ExecutionContext, Operator};
use crate::plan::{Expr, SortKey, WindowExpr, WindowFunc};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

pub struct WindowExec {
    input: Box<dyn Operator>,
    partition_keys: Vec<Expr>,
    order_keys: Vec<SortKey>,
    functions: Vec<WindowExpr>,
    output_schema: Arc<Schema>,
    output: Option<Vec<Row>>,
    cursor: usize,
    reserved_bytes: usize,
}

impl WindowExec {
    pub fn new(
        input: Box<dyn Operator>,
        partition_keys: Vec<Expr>,
        order_keys: Vec<SortKey>,
        functions: Vec<WindowExpr>,
        output_schema: Arc<Schema>,
    ) -> Self {
        Self {
            input,
            partition_keys,
            order_keys,
            functions,
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

        // partition
        let mut partitions: HashMap<Vec<Value>, Vec<Row>> = HashMap::new();
        for row in rows {
            let mut key = Vec::with_capacity(self.partition_keys.len());
            for expr in &self.partition_keys {
                key.push(evaluator.evaluate(expr, &row)?);
            }
            partitions.entry(key).or_default().push(row);
        }

        // deterministic partition order
        let mut keyed: Vec<(Vec<Value>, Vec<Row>)> = partitions.into_iter().collect();
        keyed.sort_by(|(a, _), (b, _)| {
            for (x, y) in a.iter().zip(b.iter()) {
                let ord = x
                    .partial_cmp(y)
                    .unwrap_or_else(|| x.to_string().cmp(&y.to_string()));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });

        let mut out = Vec::new();
        for (_, mut partition) in keyed {
            ctx.checkpoint()?;
            // order within the partition
            if !self.order_keys.is_empty() {
                let mut with_keys: Vec<(Vec<Value>, Row)> = partition
                    .drain(..)
                    .map(|row| {
                        evaluate_keys(&evaluator, &self.order_keys, &row).map(|k| (k, row))
                    })
                    .collect::<Result<_>>()?;
                with_keys
                    .sort_by(|(a, _), (b, _)| compare_key_values(a, b, &self.order_keys));
                self.emit_partition(with_keys, &evaluator, &mut out)?;
            } else {
                let with_keys = partition
                    .drain(..)
                    .map(|row| (Vec::new(), row))
                    .collect();
                self.emit_partition(with_keys, &evaluator, &mut out)?;
            }
        }
        self.output = Some(out);
        Ok(())
    }

    fn emit_partition(
        &self,
        rows: Vec<(Vec<Value>, Row)>,
        evaluator: &ExpressionEvaluator,
        out: &mut Vec<Row>,
    ) -> Result<()> {
        let count = rows.len();
        let mut computed: Vec<Vec<Value>> = vec![Vec::with_capacity(self.functions.len()); count];

        for func in &self.functions {
            match func.func {
                WindowFunc::RowNumber => {
                    for (i, values) in computed.iter_mut().enumerate() {
                        values.push(Value::Integer(i as i64 + 1));
                    }
                }
                WindowFunc::Rank | WindowFunc::DenseRank => {
                    let dense = func.func == WindowFunc::DenseRank;
                    let mut rank = 0i64;
                    let mut dense_rank = 0i64;
                    let mut prev_key: Option<&Vec<Value>> = None;
                    for (i, (key, _)) in rows.iter().enumerate() {
                        if prev_key != Some(key) {
                            rank = i as i64 + 1;
                            dense_rank += 1;
                            prev_key = Some(key);
                        }
                        computed[i].push(Value::Integer(if dense { dense_rank } else { rank }));
                    }
                }
                WindowFunc::Lead | WindowFunc::Lag => {
                    let value_expr = func.args.first().ok_or_else(|| {
                        EngineError::Validation(format!(
                            "{} requires a value argument",
                            func.func.name()
                        ))
                    })?;
                    let offset = match func.args.get(1) {
                        Some(expr) => match evaluator.evaluate(expr, &rows[0].1)? {
                            Value::Integer(n) if n >= 0 => n as usize,
                            other => {
                                return Err(EngineError::Validation(format!(
                                    "{} offset must be a non-negative integer, got {}",
                                    func.func.name(),
                                    other
                                )))
                            }
                        },
                        None => 1,
                    };
                    for i in 0..count {
                        let target = if func.func == WindowFunc::Lead {
                            i.checked_add(offset).filter(|t| *t < count)
                        } else {
                            i.checked_sub(offset)
                        };
                        let value = match target {
                            Some(t) => evaluator.evaluate(value_expr, &rows[t].1)?,
                            None => match func.args.get(2) {
                                Some(default) => evaluator.evaluate(default, &rows[i].1)?,
                                None => Value::Null,
                            },
                        };
                        computed[i].push(value);
                    }
                }
                WindowFunc::FirstValue | WindowFunc::LastValue => {
                    let value_expr = func.args.first().ok_or_else(|| {
                        EngineError::Validation(format!(
                            "{} requires a value argument",
                            func.func.name()
                        ))
                    })?;
                    if count == 0 {
                        continue;
                    }
                    let target = if func.func == WindowFunc::FirstValue {
                        0
                    } else {
                        count - 1
                    };
                    let value = evaluator.evaluate(value_expr, &rows[target].1)?;
                    for values in computed.iter_mut() {
                        values.push(value.clone());
                    }
                }
                WindowFunc::Ntile => {
                    let buckets = match func.args.first() {
                        Some(Expr::Literal(Value::Integer(n))) if *n > 0 => *n as usize,
                        _ => {
                            return Err(EngineError::Validation(
                                "NTILE requires a literal positive bucket count".into(),
                            ))
                        }
                    };
                    // remainder spreads over the leading buckets
                    let base = count / buckets;
                    let remainder = count % buckets;
                    let mut i = 0usize;
                    for bucket in 0..buckets {
                        let size = base + usize::from(bucket < remainder);
                        for _ in 0..size {
                            if i < count {
                                computed[i].push(Value::Integer(bucket as i64 + 1));
                                i += 1;
                            }
                        }
                    }
                }
            }
        }

        for ((_, row), values) in rows.into_iter().zip(computed) {
            let mut out_row = row;
            out_row.extend(values);
            out.push(out_row);
        }
        Ok(())
    }
}

impl Operator for WindowExec {
    fn name(&self) -> String {
        "Window".to_string()
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
            ctx.monitor.record_operator("Window", |m| {
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

    fn input(rows: Vec<(i64, i64)>) -> Box<dyn Operator> {
        Box::new(InlineResultsExec::new(
            "in",
            Arc::new(Schema::new(vec![
                Column::new("grp", ColumnType::Int64, true),
                Column::new("score", ColumnType::Int64, true),
            ])),
            Arc::new(
                rows.into_iter()
                    .map(|(g, s)| vec![Value::Integer(g), Value::Integer(s)])
                    .collect(),
            ),
        ))
    }

    fn out_schema(extra: &[&str]) -> Arc<Schema> {
        let mut cols = vec![
            Column::new("grp", ColumnType::Int64, true),
            Column::new("score", ColumnType::Int64, true),
        ];
        cols.extend(extra.iter().map(|n| Column::new(*n, ColumnType::Int64, true)));
        Arc::new(Schema::new(cols))
    }

    fn wexpr(func: WindowFunc, args: Vec<Expr>, alias: &str) -> WindowExpr {
        WindowExpr {
            func,
            args,
            alias: alias.to_string(),
        }
    }

    fn run(mut op: WindowExec, ctx: &ExecutionContext) -> Vec<Row> {
        op.open(ctx).unwrap();
        let mut rows = Vec::new();
        while let Some(batch) = op.next(ctx).unwrap() {
            rows.extend(batch.rows);
        }
        op.close(ctx).unwrap();
        rows
    }

    #[test]
    fn test_rank_and_dense_rank_tie_semantics() {
        let ctx = test_context();
        let exec = WindowExec::new(
            input(vec![(1, 10), (1, 20), (1, 20), (1, 30)]),
            vec![Expr::column("grp")],
            vec![SortKey::asc(Expr::column("score"))],
            vec![
                wexpr(WindowFunc::Rank, vec![], "rank"),
                wexpr(WindowFunc::DenseRank, vec![], "dense"),
                wexpr(WindowFunc::RowNumber, vec![], "rn"),
            ],
            out_schema(&["rank", "dense", "rn"]),
        );
        let rows = run(exec, &ctx);
        let ranks: Vec<i64> = rows
            .iter()
            .map(|r| match r[2] {
                Value::Integer(i) => i,
                _ => panic!("rank must be an integer"),
            })
            .collect();
        let dense: Vec<i64> = rows
            .iter()
            .map(|r| match r[3] {
                Value::Integer(i) => i,
                _ => panic!("dense rank must be an integer"),
            })
            .collect();
        // RANK has gaps after ties, DENSE_RANK does not
        assert_eq!(ranks, vec![1, 2, 2, 4]);
        assert_eq!(dense, vec![1, 2, 2, 3]);
    }

    #[test]
    fn test_lead_lag_defaults() {
        let ctx = test_context();
        let exec = WindowExec::new(
            input(vec![(1, 10), (1, 20), (1, 30)]),
            vec![],
            vec![SortKey::asc(Expr::column("score"))],
            vec![
                wexpr(
                    WindowFunc::Lead,
                    vec![Expr::column("score"), Expr::literal(Value::Integer(1))],
                    "next",
                ),
                wexpr(
                    WindowFunc::Lag,
                    vec![
                        Expr::column("score"),
                        Expr::literal(Value::Integer(1)),
                        Expr::literal(Value::Integer(-1)),
                    ],
                    "prev",
                ),
            ],
            out_schema(&["next", "prev"]),
        );
        let rows = run(exec, &ctx);
        assert_eq!(rows[0][2], Value::Integer(20));
        assert_eq!(rows[2][2], Value::Null); // no lead past the end
        assert_eq!(rows[0][3], Value::Integer(-1)); // lag default
        assert_eq!(rows[1][3], Value::Integer(10));
    }

    #[test]
    fn test_first_last_value() {
        let ctx = test_context();
        let exec = WindowExec::new(
            input(vec![(1, 30), (1, 10), (1, 20)]),
            vec![],
            vec![SortKey::asc(Expr::column("score"))],
            vec![
                wexpr(WindowFunc::FirstValue, vec![Expr::column("score")], "first"),
                wexpr(WindowFunc::LastValue, vec![Expr::column("score")], "last"),
            ],
            out_schema(&["first", "last"]),
        );
        let rows = run(exec, &ctx);
        for row in &rows {
            assert_eq!(row[2], Value::Integer(10));
            assert_eq!(row[3], Value::Integer(30));
        }
    }

    #[test]
    fn test_ntile_distributes_remainder_first() {
        let ctx = test_context();
        let exec = WindowExec::new(
            input((0..5).map(|i| (1, i)).collect()),
            vec![],
            vec![SortKey::asc(Expr::column("score"))],
            vec![wexpr(
                WindowFunc::Ntile,
                vec![Expr::literal(Value::Integer(2))],
                "bucket",
            )],
            out_schema(&["bucket"]),
        );
        let rows = run(exec, &ctx);
        let buckets: Vec<i64> = rows
            .iter()
            .map(|r| match r[2] {
                Value::Integer(i) => i,
                _ => panic!("bucket must be an integer"),
            })
            .collect();
        // 5 rows over 2 buckets: first bucket takes 3
        assert_eq!(buckets, vec![1, 1, 1, 2, 2]);
    }

    #[test]
    fn test_partitions_are_independent() {
        let ctx = test_context();
        let exec = WindowExec::new(
            input(vec![(1, 10), (2, 10), (1, 20), (2, 20)]),
            vec![Expr::column("grp")],
            vec![SortKey::asc(Expr::column("score"))],
            vec![wexpr(WindowFunc::RowNumber, vec![], "rn")],
            out_schema(&["rn"]),
        );
        let rows = run(exec, &ctx);
        assert_eq!(rows.len(), 4);
        // each partition restarts numbering at 1
        let max_rn = rows
            .iter()
            .map(|r| match r[2] {
                Value::Integer(i) => i,
                _ => 0,
            })
            .max();
        assert_eq!(max_rn, Some(2));
    }
}

// Index join: streams the outer side and resolves matches through a
// source-side index lookup. Chosen when cardinalities strongly favour point
// lookups against an indexed adapter.

use crate::adapter::SourceAdapter;
use crate::common::{Batch, Row, Schema};
use crate::error::Result;
use crate::execution::expressions::ExpressionEvaluator;
use crate::execution::{ExecutionContext, Operator};
use crate::plan::Expr;
use std::sync::Arc;
use std::time::Instant;

pub struct IndexJoinExec {
    outer: Box<dyn Operator>,
    adapter: Arc<dyn SourceAdapter>,
    inner_table: String,
    inner_column: String,
    outer_key: Expr,
    residual: Option<Expr>,
    output_schema: Arc<Schema>,
    evaluator: Option<ExpressionEvaluator>,
    residual_eval: Option<ExpressionEvaluator>,
}

impl IndexJoinExec {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        outer: Box<dyn Operator>,
        adapter: Arc<dyn SourceAdapter>,
        inner_table: impl Into<String>,
        inner_column: impl Into<String>,
        outer_key: Expr,
        residual: Option<Expr>,
        output_schema: Arc<Schema>,
    ) -> Self {
        Self {
            outer,
            adapter,
            inner_table: inner_table.into(),
            inner_column: inner_column.into(),
            outer_key,
            residual,
            output_schema,
            evaluator: None,
            residual_eval: None,
        }
    }
}

impl Operator for IndexJoinExec {
    fn name(&self) -> String {
        format!("IndexJoin({}.{})", self.inner_table, self.inner_column)
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.output_schema)
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.outer.open(ctx)?;
        self.evaluator = Some(ExpressionEvaluator::new(self.outer.schema()));
        self.residual_eval = Some(ExpressionEvaluator::new(Arc::clone(&self.output_schema)));
        Ok(())
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<Batch>> {
        let label = self.name();
        loop {
            ctx.checkpoint()?;
            let Some(batch) = self.outer.next(ctx)? else {
                return Ok(None);
            };
            let started = Instant::now();
            let evaluator = self.evaluator.as_ref().expect("opened");
            let residual_eval = self.residual_eval.as_ref().expect("opened");
            let mut out: Vec<Row> = Vec::new();
            for row in &batch.rows {
                let key = evaluator.evaluate(&self.outer_key, row)?;
                if key.is_null() {
                    continue;
                }
                let matches =
                    self.adapter
                        .index_lookup(&self.inner_table, &self.inner_column, &key)?;
                for inner_row in matches {
                    let mut combined = row.clone();
                    combined.extend(inner_row);
                    let passes = match &self.residual {
                        Some(residual) => residual_eval.evaluate_predicate(residual, &combined)?,
                        None => true,
                    };
                    if passes {
                        out.push(combined);
                    }
                }
            }
            ctx.monitor.record_operator(&label, |m| {
                m.rows_in += batch.num_rows() as u64;
                m.rows_out += out.len() as u64;
                m.wall_nanos += started.elapsed().as_nanos() as u64;
            });
            if !out.is_empty() {
                return Ok(Some(Batch::new(Arc::clone(&self.output_schema), out)));
            }
        }
    }

    fn close(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.outer.close(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{MemoryAdapter, SourceKind};
    use crate::common::{Column, ColumnType, Value};
    use crate::execution::engine::test_support::test_context;
    use crate::execution::operators::InlineResultsExec;

    #[test]
    fn test_index_join_point_lookups() {
        let ctx = test_context();
        let adapter = MemoryAdapter::new("pg", SourceKind::Relational);
        adapter.add_table(
            "orders",
            Schema::new(vec![
                Column::new("user_id", ColumnType::Int64, false),
                Column::new("total", ColumnType::Int64, false),
            ]),
            vec![
                vec![Value::Integer(1), Value::Integer(10)],
                vec![Value::Integer(1), Value::Integer(20)],
                vec![Value::Integer(2), Value::Integer(30)],
            ],
        );
        adapter.connect().unwrap();

        let outer_schema = Arc::new(Schema::new(vec![
            Column::new("id", ColumnType::Int64, false).with_relation("users")
        ]));
        let outer = Box::new(InlineResultsExec::new(
            "outer",
            Arc::clone(&outer_schema),
            Arc::new(vec![vec![Value::Integer(1)], vec![Value::Integer(3)]]),
        ));
        let output_schema = Arc::new(Schema::new(vec![
            Column::new("id", ColumnType::Int64, false).with_relation("users"),
            Column::new("user_id", ColumnType::Int64, false).with_relation("orders"),
            Column::new("total", ColumnType::Int64, false).with_relation("orders"),
        ]));

        let mut join = IndexJoinExec::new(
            outer,
            Arc::new(adapter),
            "orders",
            "user_id",
            Expr::qualified_column("users", "id"),
            None,
            output_schema,
        );
        join.open(&ctx).unwrap();
        let mut rows = Vec::new();
        while let Some(batch) = join.next(&ctx).unwrap() {
            rows.extend(batch.rows);
        }
        join.close(&ctx).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r[0] == Value::Integer(1)));
    }
}

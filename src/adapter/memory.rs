// In-memory reference adapter.
//
// Backs tests and local development. Executes the subset of plan shapes its
// capability set advertises (scan, filter, project, sort, limit), which is
// also exactly what capability pushdown will hand it. Supports fault
// injection so retry paths can be exercised.

use crate::adapter::{
    BatchStream, Capability, CapabilitySet, CostEstimate, CostFactors, MaterializedStream,
    SourceAdapter, SourceDescriptor, SourceKind,
};
use crate::common::{Batch, Row, Schema, TableRef, Value, DEFAULT_BATCH_ROWS};
use crate::error::{AdapterErrorKind, EngineError, Result};
use crate::execution::expressions::ExpressionEvaluator;
use crate::plan::LogicalPlan;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

struct MemoryTable {
    schema: Schema,
    rows: Vec<Row>,
}

pub struct MemoryAdapter {
    id: String,
    kind: SourceKind,
    capabilities: CapabilitySet,
    cost_factors: CostFactors,
    tables: RwLock<HashMap<String, MemoryTable>>,
    connected: AtomicBool,
    /// Remaining number of calls that fail with a transient connection error.
    inject_failures: AtomicUsize,
    /// Count of subplans executed, for assertions on pushdown behaviour.
    executed_subplans: AtomicUsize,
    /// When set, reported instead of actual table sizes. Lets tests model
    /// stale source statistics.
    row_estimate_override: RwLock<Option<u64>>,
}

impl MemoryAdapter {
    pub fn new(id: impl Into<String>, kind: SourceKind) -> Self {
        let capabilities = match kind {
            SourceKind::Vector => CapabilitySet::new([
                Capability::PredicatePushdown,
                Capability::ProjectionPushdown,
                Capability::Sort,
                Capability::Limit,
                Capability::VectorKnn,
            ]),
            SourceKind::TimeSeries => CapabilitySet::new([
                Capability::PredicatePushdown,
                Capability::ProjectionPushdown,
                Capability::Sort,
                Capability::Limit,
                Capability::TimeBucket,
            ]),
            _ => CapabilitySet::new([
                Capability::PredicatePushdown,
                Capability::ProjectionPushdown,
                Capability::Sort,
                Capability::Limit,
                Capability::IndexLookup,
                Capability::CostEstimation,
            ]),
        };
        Self {
            id: id.into(),
            kind,
            capabilities,
            cost_factors: CostFactors::default(),
            tables: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(false),
            inject_failures: AtomicUsize::new(0),
            executed_subplans: AtomicUsize::new(0),
            row_estimate_override: RwLock::new(None),
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn add_table(&self, name: impl Into<String>, schema: Schema, rows: Vec<Row>) {
        self.tables
            .write()
            .insert(name.into(), MemoryTable { schema, rows });
    }

    /// Make the next `n` execute/schema calls fail with a transient
    /// connection error.
    pub fn inject_failures(&self, n: usize) {
        self.inject_failures.store(n, AtomicOrdering::SeqCst);
    }

    pub fn executed_subplans(&self) -> usize {
        self.executed_subplans.load(AtomicOrdering::SeqCst)
    }

    /// Report a fixed row estimate regardless of actual table contents.
    pub fn override_row_estimate(&self, rows: u64) {
        *self.row_estimate_override.write() = Some(rows);
    }

    fn check_injected_failure(&self) -> Result<()> {
        let remaining = self.inject_failures.load(AtomicOrdering::SeqCst);
        if remaining > 0 {
            self.inject_failures
                .store(remaining - 1, AtomicOrdering::SeqCst);
            return Err(EngineError::adapter(
                self.id.clone(),
                AdapterErrorKind::Connection,
                "injected connection failure",
            ));
        }
        Ok(())
    }

    fn check_connected(&self) -> Result<()> {
        if !self.connected.load(AtomicOrdering::SeqCst) {
            return Err(EngineError::adapter(
                self.id.clone(),
                AdapterErrorKind::Connection,
                "adapter not connected",
            ));
        }
        Ok(())
    }

    fn run(&self, plan: &LogicalPlan) -> Result<(Arc<Schema>, Vec<Row>)> {
        match plan {
            LogicalPlan::Scan {
                table,
                projection,
                predicate,
                ..
            } => {
                let tables = self.tables.read();
                let mem = tables.get(table).ok_or_else(|| {
                    EngineError::adapter(
                        self.id.clone(),
                        AdapterErrorKind::Schema,
                        format!("unknown table '{}'", table),
                    )
                })?;
                let mut schema = mem.schema.clone();
                for col in &mut schema.columns {
                    col.relation = Some(table.clone());
                }
                let schema = Arc::new(schema);
                let mut rows = mem.rows.clone();
                if let Some(pred) = predicate {
                    let ev = ExpressionEvaluator::new(Arc::clone(&schema));
                    let mut kept = Vec::new();
                    for row in rows {
                        if ev.evaluate_predicate(pred, &row)? {
                            kept.push(row);
                        }
                    }
                    rows = kept;
                }
                match projection {
                    Some(names) => {
                        let mut indices = Vec::with_capacity(names.len());
                        for name in names {
                            indices.push(schema.index_of(name).ok_or_else(|| {
                                EngineError::adapter(
                                    self.id.clone(),
                                    AdapterErrorKind::Query,
                                    format!("unknown column '{}'", name),
                                )
                            })?);
                        }
                        let projected = Arc::new(schema.project(&indices));
                        let rows = rows
                            .into_iter()
                            .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
                            .collect();
                        Ok((projected, rows))
                    }
                    None => Ok((schema, rows)),
                }
            }
            LogicalPlan::Filter { input, predicate } => {
                let (schema, rows) = self.run(input)?;
                let ev = ExpressionEvaluator::new(Arc::clone(&schema));
                let mut kept = Vec::new();
                for row in rows {
                    if ev.evaluate_predicate(predicate, &row)? {
                        kept.push(row);
                    }
                }
                Ok((schema, kept))
            }
            LogicalPlan::Project { input, exprs } => {
                let (schema, rows) = self.run(input)?;
                let ev = ExpressionEvaluator::new(Arc::clone(&schema));
                let mut columns = Vec::with_capacity(exprs.len());
                for (expr, alias) in exprs {
                    let dt = expr.data_type(&schema)?;
                    columns.push(crate::common::Column::new(alias.clone(), dt, true));
                }
                let out_schema = Arc::new(Schema::new(columns));
                let mut out_rows = Vec::with_capacity(rows.len());
                for row in &rows {
                    let mut out = Vec::with_capacity(exprs.len());
                    for (expr, _) in exprs {
                        out.push(ev.evaluate(expr, row)?);
                    }
                    out_rows.push(out);
                }
                Ok((out_schema, out_rows))
            }
            LogicalPlan::Sort { input, keys } => {
                let (schema, mut rows) = self.run(input)?;
                let ev = ExpressionEvaluator::new(Arc::clone(&schema));
                let mut keyed: Vec<(Vec<Value>, Row)> = Vec::with_capacity(rows.len());
                for row in rows.drain(..) {
                    let mut k = Vec::with_capacity(keys.len());
                    for key in keys {
                        k.push(ev.evaluate(&key.expr, &row)?);
                    }
                    keyed.push((k, row));
                }
                keyed.sort_by(|(a, _), (b, _)| {
                    for (i, key) in keys.iter().enumerate() {
                        let ord = compare_sort_values(&a[i], &b[i], key.ascending, key.nulls_first);
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    Ordering::Equal
                });
                Ok((schema, keyed.into_iter().map(|(_, r)| r).collect()))
            }
            LogicalPlan::Limit {
                input,
                limit,
                offset,
            } => {
                let (schema, rows) = self.run(input)?;
                let rows = rows
                    .into_iter()
                    .skip(*offset)
                    .take(limit.unwrap_or(usize::MAX))
                    .collect();
                Ok((schema, rows))
            }
            other => Err(EngineError::adapter(
                self.id.clone(),
                AdapterErrorKind::Capability,
                format!("cannot execute {} natively", other.name()),
            )),
        }
    }
}

fn compare_sort_values(a: &Value, b: &Value, ascending: bool, nulls_first: bool) -> Ordering {
    let ord = match (a.is_null(), b.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return if nulls_first { Ordering::Less } else { Ordering::Greater },
        (false, true) => return if nulls_first { Ordering::Greater } else { Ordering::Less },
        (false, false) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
    };
    if ascending {
        ord
    } else {
        ord.reverse()
    }
}

impl SourceAdapter for MemoryAdapter {
    fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor {
            id: self.id.clone(),
            kind: self.kind,
            capabilities: self.capabilities.clone(),
            cost_factors: self.cost_factors.clone(),
        }
    }

    fn connect(&self) -> Result<()> {
        self.connected.store(true, AtomicOrdering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        self.connected.store(false, AtomicOrdering::SeqCst);
        Ok(())
    }

    fn list_tables(&self) -> Result<Vec<TableRef>> {
        let mut tables: Vec<TableRef> = self
            .tables
            .read()
            .keys()
            .map(|t| TableRef::new(self.id.clone(), t.clone()))
            .collect();
        tables.sort();
        Ok(tables)
    }

    fn schema(&self, table: &str) -> Result<Schema> {
        self.check_connected()?;
        self.check_injected_failure()?;
        self.tables
            .read()
            .get(table)
            .map(|t| t.schema.clone())
            .ok_or_else(|| {
                EngineError::adapter(
                    self.id.clone(),
                    AdapterErrorKind::Schema,
                    format!("unknown table '{}'", table),
                )
            })
    }

    fn estimated_rows(&self, table: &str) -> Option<u64> {
        if let Some(rows) = *self.row_estimate_override.read() {
            return Some(rows);
        }
        self.tables.read().get(table).map(|t| t.rows.len() as u64)
    }

    fn estimate_cost(&self, plan: &LogicalPlan) -> Option<CostEstimate> {
        if !self.capabilities.contains(Capability::CostEstimation) {
            return None;
        }
        let mut rows = 0u64;
        plan.traverse(&mut |node| {
            if let LogicalPlan::Scan { table, .. } = node {
                rows += self.estimated_rows(table).unwrap_or(0);
            }
        });
        Some(CostEstimate {
            io: self.cost_factors.startup_cost + rows as f64 * self.cost_factors.io_per_row,
            cpu: rows as f64 * self.cost_factors.cpu_per_row,
            rows_out: rows,
        })
    }

    fn execute(&self, plan: &LogicalPlan) -> Result<Box<dyn BatchStream>> {
        self.check_connected()?;
        self.check_injected_failure()?;
        self.executed_subplans.fetch_add(1, AtomicOrdering::SeqCst);
        let (schema, rows) = self.run(plan)?;
        let batches = rows
            .chunks(DEFAULT_BATCH_ROWS)
            .map(|chunk| Batch::new(Arc::clone(&schema), chunk.to_vec()))
            .collect::<Vec<_>>();
        // Preserve the schema even when there are no rows
        let batches = if batches.is_empty() {
            vec![Batch::empty(schema)]
        } else {
            batches
        };
        Ok(Box::new(MaterializedStream::new(batches)))
    }

    fn index_lookup(&self, table: &str, column: &str, key: &Value) -> Result<Vec<Row>> {
        if !self.capabilities.contains(Capability::IndexLookup) {
            return Err(EngineError::adapter(
                self.id.clone(),
                AdapterErrorKind::Capability,
                "index lookup not supported",
            ));
        }
        self.check_connected()?;
        let tables = self.tables.read();
        let mem = tables.get(table).ok_or_else(|| {
            EngineError::adapter(
                self.id.clone(),
                AdapterErrorKind::Schema,
                format!("unknown table '{}'", table),
            )
        })?;
        let idx = mem.schema.index_of(column).ok_or_else(|| {
            EngineError::adapter(
                self.id.clone(),
                AdapterErrorKind::Query,
                format!("unknown column '{}'", column),
            )
        })?;
        Ok(mem
            .rows
            .iter()
            .filter(|row| &row[idx] == key)
            .cloned()
            .collect())
    }
}

// Execution engine: turns a federation plan into a physical operator tree
// and drives it to exhaustion. Three modes coexist — standard (run what the
// planner chose), adaptive (re-select operators when sampled statistics
// deviate from estimates), and cached (substitute inline results for
// fingerprint hits and populate on completion).

use crate::adapter::SourceRegistry;
use crate::cache::ResultCache;
use crate::common::{Row, Schema};
use crate::error::{EngineError, Result};
use crate::execution::adaptive::AdaptiveJoinExec;
use crate::execution::aggregate::AggregateExec;
use crate::execution::hash_join::{
    split_join_condition, HashJoinExec, JoinCondition, PartitionedHashJoinExec,
};
use crate::execution::index_join::IndexJoinExec;
use crate::execution::operators::{
    CachingExec, FilterExec, InlineResultsExec, LimitExec, ProjectExec, ScanExec, UnionExec,
};
use crate::execution::sort_merge::{MergeJoinExec, SortExec};
use crate::execution::window::WindowExec;
use crate::execution::{ExecutionContext, Operator};
use crate::federation::{FedNode, FederationPlan, JoinAlgorithm};
use crate::optimizer::OptimizerContext;
use crate::plan::{fingerprint, Expr, JoinType, LogicalPlan};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ExecutionMode {
    #[default]
    Standard,
    Adaptive,
    Cached,
}

/// Query lifecycle. Only `Admitted → Running` releases execution; every
/// terminal transition releases resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryState {
    Queued,
    Admitted,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl QueryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryState::Completed | QueryState::Failed | QueryState::Cancelled
        )
    }
}

/// A fully drained query result.
#[derive(Debug, Clone)]
pub struct QueryOutput {
    pub schema: Arc<Schema>,
    pub rows: Vec<Row>,
}

pub struct ExecutionEngine {
    registry: Arc<SourceRegistry>,
    cache: Arc<ResultCache>,
    default_partitions: usize,
    default_row_estimate: u64,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<SourceRegistry>,
        cache: Arc<ResultCache>,
        default_partitions: usize,
        default_row_estimate: u64,
    ) -> Self {
        Self {
            registry,
            cache,
            default_partitions: default_partitions.max(2),
            default_row_estimate,
        }
    }

    /// Build the operator tree and pull it dry. Operators are closed on
    /// every exit path, including errors and cancellation, so resource
    /// counters return to their pre-admission values.
    pub fn execute(&self, plan: &FederationPlan, ctx: &ExecutionContext) -> Result<QueryOutput> {
        let started = Instant::now();
        let concurrent = plan.concurrent_dispatches.len() > 1;
        let mut root = self.build_node(&plan.root, ctx, concurrent)?;
        let schema = root.schema();

        root.open(ctx)?;
        let mut rows = Vec::new();
        let drained: Result<()> = loop {
            match root.next(ctx) {
                Ok(Some(batch)) => rows.extend(batch.rows),
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        let closed = root.close(ctx);
        ctx.monitor.record_stage("execute", started.elapsed());
        drained?;
        closed?;
        Ok(QueryOutput { schema, rows })
    }

    fn build_node(
        &self,
        node: &FedNode,
        ctx: &ExecutionContext,
        concurrent: bool,
    ) -> Result<Box<dyn Operator>> {
        match node {
            FedNode::Dispatch {
                source,
                plan,
                estimated,
                ..
            } => self.build_dispatch(source, plan, estimated.total(), ctx, concurrent),
            FedNode::Local {
                template,
                children,
                join_algorithm,
                ..
            } => self.build_local(template, children, *join_algorithm, ctx, concurrent),
        }
    }

    fn build_dispatch(
        &self,
        source: &str,
        plan: &Arc<LogicalPlan>,
        cost: f64,
        ctx: &ExecutionContext,
        concurrent: bool,
    ) -> Result<Box<dyn Operator>> {
        let adapter = self.registry.adapter(source)?;
        let schema = Arc::new(plan.output_schema(self.registry.as_ref())?);

        // cached mode consults the result cache per candidate subplan
        let cache_key = if ctx.mode == ExecutionMode::Cached {
            let key = fingerprint(plan)?;
            if let Some(hit) = self.cache.get(&key) {
                ctx.monitor.record_cache_hit();
                tracing::debug!(source, fingerprint = %key, "dispatch served from cache");
                return Ok(Box::new(InlineResultsExec::new(
                    format!("CachedScan({})", source),
                    hit.schema,
                    hit.rows,
                )));
            }
            ctx.monitor.record_cache_miss();
            Some(key)
        } else {
            None
        };

        let mut all_supported = true;
        plan.traverse(&mut |n| {
            if !adapter.supports(n) {
                all_supported = false;
            }
        });

        let scan: Box<dyn Operator> = if all_supported {
            Box::new(ScanExec::new(
                adapter,
                Arc::clone(plan),
                Arc::clone(&schema),
                None,
                None,
                concurrent,
            ))
        } else {
            // an unwrapped scan: dispatch the bare table and apply the
            // residual predicate/projection locally
            match plan.as_ref() {
                LogicalPlan::Scan {
                    source: scan_source,
                    table,
                    projection,
                    predicate,
                } => {
                    let bare = Arc::new(LogicalPlan::Scan {
                        source: scan_source.clone(),
                        table: table.clone(),
                        projection: None,
                        predicate: None,
                    });
                    Box::new(ScanExec::new(
                        adapter,
                        bare,
                        Arc::clone(&schema),
                        predicate.clone(),
                        projection.clone(),
                        concurrent,
                    ))
                }
                other => {
                    return Err(EngineError::Planning(format!(
                        "source '{}' cannot execute dispatched {} subplan",
                        source,
                        other.name()
                    )))
                }
            }
        };

        Ok(match cache_key {
            Some(key) => Box::new(CachingExec::new(
                scan,
                Arc::clone(&self.cache),
                key,
                plan.dependencies(),
                cost,
            )),
            None => scan,
        })
    }

    fn build_local(
        &self,
        template: &Arc<LogicalPlan>,
        children: &[FedNode],
        join_algorithm: Option<JoinAlgorithm>,
        ctx: &ExecutionContext,
        concurrent: bool,
    ) -> Result<Box<dyn Operator>> {
        let schema = Arc::new(template.output_schema(self.registry.as_ref())?);
        match template.as_ref() {
            LogicalPlan::Filter { predicate, .. } => {
                let input = self.build_node(&children[0], ctx, concurrent)?;
                Ok(Box::new(FilterExec::new(input, predicate.clone())))
            }
            LogicalPlan::Project { exprs, .. } => {
                let input = self.build_node(&children[0], ctx, concurrent)?;
                Ok(Box::new(ProjectExec::new(input, exprs.clone(), schema)))
            }
            LogicalPlan::Sort { keys, .. } => {
                let input = self.build_node(&children[0], ctx, concurrent)?;
                Ok(Box::new(SortExec::new(input, keys.clone())))
            }
            LogicalPlan::Limit { limit, offset, .. } => {
                // a sort directly below a limit becomes a top-K sort
                if let (
                    Some(n),
                    FedNode::Local {
                        template: child_template,
                        children: grandchildren,
                        ..
                    },
                ) = (limit, &children[0])
                {
                    if let LogicalPlan::Sort { keys, .. } = child_template.as_ref() {
                        let input = self.build_node(&grandchildren[0], ctx, concurrent)?;
                        let sort = SortExec::new(input, keys.clone()).with_top_k(n + offset);
                        return Ok(Box::new(LimitExec::new(
                            Box::new(sort),
                            *limit,
                            *offset,
                        )));
                    }
                }
                let input = self.build_node(&children[0], ctx, concurrent)?;
                Ok(Box::new(LimitExec::new(input, *limit, *offset)))
            }
            LogicalPlan::Union { all, .. } => {
                let mut inputs = Vec::with_capacity(children.len());
                for child in children {
                    inputs.push(self.build_node(child, ctx, concurrent)?);
                }
                Ok(Box::new(UnionExec::new(inputs, schema, *all)))
            }
            LogicalPlan::Aggregate {
                group_keys,
                aggregates,
                ..
            } => {
                let input = self.build_node(&children[0], ctx, concurrent)?;
                Ok(Box::new(AggregateExec::new(
                    input,
                    group_keys.clone(),
                    aggregates.clone(),
                    schema,
                )))
            }
            LogicalPlan::Window {
                partition_keys,
                order_keys,
                functions,
                ..
            } => {
                let input = self.build_node(&children[0], ctx, concurrent)?;
                Ok(Box::new(WindowExec::new(
                    input,
                    partition_keys.clone(),
                    order_keys.clone(),
                    functions.clone(),
                    schema,
                )))
            }
            LogicalPlan::Join {
                left,
                right,
                join_type,
                condition,
                ..
            } => self.build_join(
                template, left, right, *join_type, condition, children,
                join_algorithm.unwrap_or(JoinAlgorithm::BroadcastHash { build_left: true }),
                schema, ctx, concurrent,
            ),
            other => Err(EngineError::Internal(format!(
                "{} cannot appear as a local stage",
                other.name()
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_join(
        &self,
        _template: &Arc<LogicalPlan>,
        logical_left: &Arc<LogicalPlan>,
        _logical_right: &Arc<LogicalPlan>,
        join_type: JoinType,
        condition: &Expr,
        children: &[FedNode],
        algorithm: JoinAlgorithm,
        output_schema: Arc<Schema>,
        ctx: &ExecutionContext,
        concurrent: bool,
    ) -> Result<Box<dyn Operator>> {
        // index joins consume the inner side through the adapter, not an
        // operator; try that shape first
        if algorithm == JoinAlgorithm::IndexLookup {
            if let Some(op) = self.try_build_index_join(
                condition,
                children,
                Arc::clone(&output_schema),
                ctx,
                concurrent,
            )? {
                return Ok(op);
            }
        }

        let left = self.build_node(&children[0], ctx, concurrent)?;
        let right = self.build_node(&children[1], ctx, concurrent)?;
        let split = split_join_condition(condition, &left.schema(), &right.schema());

        match algorithm {
            JoinAlgorithm::SortMerge
                if join_type == JoinType::Inner && !split.left_keys.is_empty() =>
            {
                Ok(Box::new(MergeJoinExec::new(
                    left,
                    right,
                    split.left_keys.clone(),
                    split.right_keys.clone(),
                    split.residual.clone(),
                    output_schema,
                )))
            }
            JoinAlgorithm::PartitionedHash { partitions }
                if !(ctx.mode == ExecutionMode::Adaptive && ctx.adaptive.enabled) =>
            {
                Ok(Box::new(PartitionedHashJoinExec::new(
                    left,
                    right,
                    join_type,
                    split,
                    true,
                    output_schema,
                    partitions,
                )))
            }
            algorithm => {
                let build_left = match algorithm {
                    JoinAlgorithm::BroadcastHash { build_left } => build_left,
                    _ => true,
                };
                if ctx.mode == ExecutionMode::Adaptive && ctx.adaptive.enabled {
                    let estimator = OptimizerContext {
                        registry: &self.registry,
                        default_row_estimate: self.default_row_estimate,
                    };
                    let build_side = if build_left {
                        logical_left
                    } else {
                        _logical_right
                    };
                    let estimated_build_rows = estimator.estimate_rows(build_side).rows;
                    let planned = match algorithm {
                        JoinAlgorithm::PartitionedHash { .. } => algorithm,
                        _ => JoinAlgorithm::BroadcastHash { build_left },
                    };
                    Ok(Box::new(AdaptiveJoinExec::new(
                        left,
                        right,
                        join_type,
                        JoinCondition {
                            left_keys: split.left_keys,
                            right_keys: split.right_keys,
                            residual: split.residual,
                        },
                        planned,
                        estimated_build_rows,
                        output_schema,
                        self.default_partitions,
                    )))
                } else {
                    Ok(Box::new(HashJoinExec::new(
                        left,
                        right,
                        join_type,
                        split,
                        build_left,
                        output_schema,
                        self.default_partitions,
                    )))
                }
            }
        }
    }

    /// Index join applies only when the inner side is a bare single-table
    /// dispatch with a single equi key; anything else falls back to hash.
    fn try_build_index_join(
        &self,
        condition: &Expr,
        children: &[FedNode],
        output_schema: Arc<Schema>,
        ctx: &ExecutionContext,
        concurrent: bool,
    ) -> Result<Option<Box<dyn Operator>>> {
        let FedNode::Dispatch { source, plan, .. } = &children[1] else {
            return Ok(None);
        };
        let LogicalPlan::Scan {
            table,
            projection: None,
            predicate: None,
            ..
        } = plan.as_ref()
        else {
            return Ok(None);
        };
        let outer = self.build_node(&children[0], ctx, concurrent)?;
        let inner_schema = self.registry.schema_of(source, table)?;
        let split = split_join_condition(condition, &outer.schema(), &{
            let mut s = inner_schema.clone();
            for col in &mut s.columns {
                col.relation = Some(table.clone());
            }
            s
        });
        if split.left_keys.len() != 1 {
            return Ok(None);
        }
        let inner_column = match &split.right_keys[0] {
            Expr::Column { name, .. } => name.clone(),
            _ => return Ok(None),
        };
        let adapter = self.registry.adapter(source)?;
        Ok(Some(Box::new(IndexJoinExec::new(
            outer,
            adapter,
            table.clone(),
            inner_column,
            split.left_keys[0].clone(),
            split.residual,
            output_schema,
        ))))
    }
}

#[cfg(test)]
pub mod test_support {
    use crate::execution::adaptive::AdaptiveSettings;
    use crate::execution::{ExecutionContext, ExecutionMode};
    use crate::monitoring::{Monitor, SourceHealth};
    use crate::resource::{CancellationToken, MemoryTracker};
    use crate::security::{AccessLevel, Identity};
    use std::sync::Arc;

    pub fn test_context_with_memory(memory_bytes: usize) -> ExecutionContext {
        let spill_dir = std::env::temp_dir().join("lakefed-tests");
        let _ = std::fs::create_dir_all(&spill_dir);
        ExecutionContext {
            query_id: 0,
            identity: Identity::new("tests", AccessLevel::Admin),
            monitor: Arc::new(Monitor::new(0, Arc::new(SourceHealth::new()))),
            memory: Arc::new(MemoryTracker::new(memory_bytes)),
            cancel: CancellationToken::new(None),
            mode: ExecutionMode::Standard,
            adaptive: AdaptiveSettings::default(),
            batch_size: 1024,
            seed: 42,
            spill_dir,
            throttle: None,
        }
    }

    pub fn test_context() -> ExecutionContext {
        test_context_with_memory(256 * 1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{MemoryAdapter, SourceKind};
    use crate::cache::CacheConfig;
    use crate::common::{Column, ColumnType, Value};
    use crate::execution::engine::test_support::test_context;
    use crate::federation::{FederationConfig, FederationPlanner};
    use crate::optimizer::{Optimizer, OptimizerConfig};
    use crate::parser::QueryParser;

    fn registry() -> Arc<SourceRegistry> {
        let registry = Arc::new(SourceRegistry::new());
        let pg = MemoryAdapter::new("pg", SourceKind::Relational);
        pg.add_table(
            "users",
            crate::common::Schema::new(vec![
                Column::new("id", ColumnType::Int64, false),
                Column::new("name", ColumnType::Utf8, true),
                Column::new("age", ColumnType::Int64, true),
            ]),
            (0..1000)
                .map(|i| {
                    vec![
                        Value::Integer(i),
                        Value::String(format!("user{}", i)),
                        Value::Integer(18 + (i % 50)),
                    ]
                })
                .collect(),
        );
        registry.register(Arc::new(pg)).unwrap();
        registry
    }

    fn run_query(sql: &str) -> QueryOutput {
        let registry = registry();
        let parser = QueryParser::new(Arc::clone(&registry));
        let optimizer = Optimizer::new(Arc::clone(&registry), OptimizerConfig::default());
        let plan = optimizer.optimize(&parser.parse(sql).unwrap()).unwrap();
        let planner = FederationPlanner::new(Arc::clone(&registry), FederationConfig::default());
        let fed_plan = planner.plan(&plan).unwrap();
        let cache = crate::cache::ResultCache::new(CacheConfig::default()).unwrap();
        let engine = ExecutionEngine::new(registry, cache, 16, 1_000);
        engine.execute(&fed_plan, &test_context()).unwrap()
    }

    #[test]
    fn test_scan_filter_project() {
        let out = run_query("SELECT id, name FROM users WHERE age > 60");
        assert_eq!(out.schema.names(), vec!["id", "name"]);
        // ages cycle 18..68; 60 < age <= 67 leaves 7 of every 50
        assert_eq!(out.rows.len(), 140);
    }

    #[test]
    fn test_aggregate_query() {
        let out = run_query("SELECT COUNT(*) FROM users");
        assert_eq!(out.rows, vec![vec![Value::Integer(1000)]]);
    }

    #[test]
    fn test_order_limit_fuses_top_k() {
        let out = run_query("SELECT id FROM users ORDER BY id DESC LIMIT 3");
        assert_eq!(
            out.rows,
            vec![
                vec![Value::Integer(999)],
                vec![Value::Integer(998)],
                vec![Value::Integer(997)],
            ]
        );
    }

    #[test]
    fn test_empty_result() {
        let out = run_query("SELECT id FROM users WHERE age > 1000");
        assert!(out.rows.is_empty());
    }
}

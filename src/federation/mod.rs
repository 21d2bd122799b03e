// # Federation Planner
//
// Splits an optimized logical plan at `Federated` boundaries into an
// execution DAG: leaves are single-source subplans dispatched to adapters,
// interior stages are cross-source operators executed locally. Chooses the
// cross-source join algorithm from estimated cardinalities and computes the
// dependency set and cost estimate the cache layers on.

use crate::adapter::{Capability, CostEstimate, SourceRegistry};
use crate::common::TableRef;
use crate::error::{EngineError, Result};
use crate::optimizer::{Confidence, OptimizerContext, RowEstimate};
use crate::plan::{Expr, JoinHint, JoinType, LogicalPlan};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

pub type StageId = usize;

/// Cross-source join algorithm, selected by estimated cardinalities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinAlgorithm {
    /// Build a hash table from the small side, stream the other.
    BroadcastHash { build_left: bool },
    /// Hash-partition both sides into N partitions, join per partition.
    PartitionedHash { partitions: usize },
    /// Merge pre-ordered inputs.
    SortMerge,
    /// Point lookups against a source-side index.
    IndexLookup,
}

/// A node of the federated execution DAG.
#[derive(Debug, Clone)]
pub enum FedNode {
    /// A single-source subplan handed to one adapter.
    Dispatch {
        id: StageId,
        source: String,
        plan: Arc<LogicalPlan>,
        estimated: CostEstimate,
    },
    /// A locally executed operator. `template` carries the operator's own
    /// attributes; its logical children are replaced by `children`.
    Local {
        id: StageId,
        template: Arc<LogicalPlan>,
        children: Vec<FedNode>,
        /// Set on Join templates.
        join_algorithm: Option<JoinAlgorithm>,
    },
}

impl FedNode {
    pub fn id(&self) -> StageId {
        match self {
            FedNode::Dispatch { id, .. } | FedNode::Local { id, .. } => *id,
        }
    }

    pub fn children(&self) -> &[FedNode] {
        match self {
            FedNode::Dispatch { .. } => &[],
            FedNode::Local { children, .. } => children,
        }
    }

    fn collect_dispatches<'a>(&'a self, out: &mut Vec<&'a FedNode>) {
        match self {
            FedNode::Dispatch { .. } => out.push(self),
            FedNode::Local { children, .. } => {
                for child in children {
                    child.collect_dispatches(out);
                }
            }
        }
    }
}

/// The planner's output: the stage tree plus everything the engine and cache
/// need to run it.
#[derive(Debug, Clone)]
pub struct FederationPlan {
    pub root: FedNode,
    /// Base tables this plan reads; the cache invalidates on these.
    pub dependencies: Vec<TableRef>,
    pub estimated_cost: CostEstimate,
    /// Stage ids in execution (post-) order.
    pub topo_order: Vec<StageId>,
    /// Dispatch stages with no mutual dependency, eligible for concurrent
    /// dispatch. A tree-shaped DAG makes every dispatch leaf independent.
    pub concurrent_dispatches: Vec<StageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    /// A build side at or below this estimated row count broadcasts.
    pub broadcast_threshold_rows: u64,
    /// Partition count for partitioned hash joins.
    pub partitions: usize,
    /// Probe sides at or below this row count prefer index lookups when the
    /// other side exposes a source index.
    pub index_lookup_threshold_rows: u64,
    /// Ratio between sides that makes point lookups attractive.
    pub index_lookup_ratio: u64,
    pub default_row_estimate: u64,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            broadcast_threshold_rows: 10_000,
            partitions: 16,
            index_lookup_threshold_rows: 100,
            index_lookup_ratio: 100,
            default_row_estimate: 1_000,
        }
    }
}

pub struct FederationPlanner {
    registry: Arc<SourceRegistry>,
    config: FederationConfig,
}

impl FederationPlanner {
    pub fn new(registry: Arc<SourceRegistry>, config: FederationConfig) -> Self {
        Self { registry, config }
    }

    pub fn plan(&self, plan: &Arc<LogicalPlan>) -> Result<FederationPlan> {
        let ctx = OptimizerContext {
            registry: &self.registry,
            default_row_estimate: self.config.default_row_estimate,
        };
        let mut next_id = 0;
        let root = self.build(plan, &ctx, &mut next_id)?;

        let mut topo_order = Vec::new();
        post_order(&root, &mut topo_order);

        let mut dispatches = Vec::new();
        root.collect_dispatches(&mut dispatches);
        let concurrent_dispatches = dispatches.iter().map(|d| d.id()).collect();

        let mut estimated_cost = CostEstimate::default();
        for dispatch in &dispatches {
            if let FedNode::Dispatch { estimated, .. } = dispatch {
                estimated_cost = estimated_cost.combine(estimated);
            }
        }
        let est = ctx.estimate_rows(plan);
        estimated_cost.rows_out = est.rows;

        Ok(FederationPlan {
            root,
            dependencies: plan.dependencies(),
            estimated_cost,
            topo_order,
            concurrent_dispatches,
        })
    }

    fn build(
        &self,
        plan: &Arc<LogicalPlan>,
        ctx: &OptimizerContext<'_>,
        next_id: &mut StageId,
    ) -> Result<FedNode> {
        match plan.as_ref() {
            LogicalPlan::Federated {
                source,
                inner,
                dependencies,
            } => {
                // a federated subtree must touch exactly one source
                let mut sources: HashSet<String> =
                    dependencies.iter().map(|d| d.source.clone()).collect();
                sources.extend(inner.dependencies().into_iter().map(|d| d.source));
                if sources.iter().any(|s| s != source) {
                    return Err(EngineError::Planning(format!(
                        "federated subtree for '{}' references other sources",
                        source
                    )));
                }
                let adapter = self.registry.adapter(source)?;
                let estimated = adapter.estimate_cost(inner).unwrap_or_else(|| {
                    let est = ctx.estimate_rows(inner);
                    let factors = adapter.descriptor().cost_factors;
                    CostEstimate {
                        io: factors.startup_cost + est.rows as f64 * factors.io_per_row,
                        cpu: est.rows as f64 * factors.cpu_per_row,
                        rows_out: est.rows,
                    }
                });
                let id = *next_id;
                *next_id += 1;
                Ok(FedNode::Dispatch {
                    id,
                    source: source.clone(),
                    plan: Arc::clone(inner),
                    estimated,
                })
            }
            LogicalPlan::Scan { source, .. } => {
                // an unwrapped scan still dispatches; filtering and
                // projection happen locally above it
                let adapter = self.registry.adapter(source)?;
                let est = ctx.estimate_rows(plan);
                let factors = adapter.descriptor().cost_factors;
                let id = *next_id;
                *next_id += 1;
                Ok(FedNode::Dispatch {
                    id,
                    source: source.clone(),
                    plan: Arc::clone(plan),
                    estimated: CostEstimate {
                        io: factors.startup_cost + est.rows as f64 * factors.io_per_row,
                        cpu: est.rows as f64 * factors.cpu_per_row,
                        rows_out: est.rows,
                    },
                })
            }
            LogicalPlan::Unsupported { description } => Err(EngineError::Planning(format!(
                "unsupported plan shape: {}",
                description
            ))),
            _ => {
                let mut children = Vec::new();
                for child in plan.children() {
                    children.push(self.build(child, ctx, next_id)?);
                }
                let join_algorithm = match plan.as_ref() {
                    LogicalPlan::Join {
                        left,
                        right,
                        join_type,
                        condition,
                        hint,
                    } => Some(self.select_join_algorithm(
                        left, right, *join_type, condition, *hint, ctx,
                    )),
                    _ => None,
                };
                let id = *next_id;
                *next_id += 1;
                Ok(FedNode::Local {
                    id,
                    template: Arc::clone(plan),
                    children,
                    join_algorithm,
                })
            }
        }
    }

    /// Cardinality-driven join algorithm selection: index lookups when one
    /// side is tiny against an indexed source, broadcast hash when a side
    /// fits the budget, sort-merge when both inputs arrive ordered, and
    /// partitioned hash otherwise.
    fn select_join_algorithm(
        &self,
        left: &Arc<LogicalPlan>,
        right: &Arc<LogicalPlan>,
        join_type: JoinType,
        condition: &Expr,
        hint: Option<JoinHint>,
        ctx: &OptimizerContext<'_>,
    ) -> JoinAlgorithm {
        let left_est = ctx.estimate_rows(left);
        let right_est = ctx.estimate_rows(right);

        if let Some(hint) = hint {
            return match hint {
                JoinHint::Broadcast => JoinAlgorithm::BroadcastHash {
                    build_left: left_est.rows <= right_est.rows,
                },
                JoinHint::Partitioned => JoinAlgorithm::PartitionedHash {
                    partitions: self.config.partitions,
                },
                JoinHint::SortMerge => JoinAlgorithm::SortMerge,
                JoinHint::Index => JoinAlgorithm::IndexLookup,
            };
        }

        // point lookups: tiny probe side against a much larger indexed side
        if join_type == JoinType::Inner
            && crate::optimizer::is_equi_condition(condition)
            && left_est.rows <= self.config.index_lookup_threshold_rows
            && right_est.rows >= left_est.rows.saturating_mul(self.config.index_lookup_ratio)
            && self.side_has_index(right)
        {
            return JoinAlgorithm::IndexLookup;
        }

        let smaller = left_est.rows.min(right_est.rows);
        if smaller <= self.config.broadcast_threshold_rows {
            return JoinAlgorithm::BroadcastHash {
                build_left: build_side_allowed(join_type, left_est, right_est),
            };
        }

        if is_ordered_on(left, condition) && is_ordered_on(right, condition) {
            return JoinAlgorithm::SortMerge;
        }

        JoinAlgorithm::PartitionedHash {
            partitions: self.config.partitions,
        }
    }

    fn side_has_index(&self, side: &Arc<LogicalPlan>) -> bool {
        match side.single_source() {
            Some(source) => self
                .registry
                .capabilities(&source)
                .map(|caps| caps.contains(Capability::IndexLookup))
                .unwrap_or(false),
            None => false,
        }
    }
}

/// Which side builds the broadcast hash table. Semi/anti joins must build on
/// the right (the probed side drives output); otherwise build the smaller.
fn build_side_allowed(join_type: JoinType, left: RowEstimate, right: RowEstimate) -> bool {
    match join_type {
        JoinType::Semi | JoinType::Anti => false,
        _ => match left.rows.cmp(&right.rows) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            // tie: build the side whose estimate we trust more
            std::cmp::Ordering::Equal => {
                left.confidence == Confidence::High && right.confidence == Confidence::Low
            }
        },
    }
}

/// A side is pre-ordered when its subtree root (or dispatched plan root)
/// sorts on some key.
fn is_ordered_on(side: &Arc<LogicalPlan>, _condition: &Expr) -> bool {
    let root = match side.as_ref() {
        LogicalPlan::Federated { inner, .. } => inner.as_ref(),
        other => other,
    };
    matches!(root, LogicalPlan::Sort { .. })
}

fn post_order(node: &FedNode, out: &mut Vec<StageId>) {
    for child in node.children() {
        post_order(child, out);
    }
    out.push(node.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{MemoryAdapter, SourceKind};
    use crate::common::{Column, ColumnType, Schema, Value};
    use crate::optimizer::{Optimizer, OptimizerConfig};
    use crate::parser::QueryParser;

    fn two_source_registry() -> Arc<SourceRegistry> {
        let registry = Arc::new(SourceRegistry::new());

        let pg = MemoryAdapter::new("pg", SourceKind::Relational);
        pg.add_table(
            "users",
            Schema::new(vec![
                Column::new("id", ColumnType::Int64, false),
                Column::new("name", ColumnType::Utf8, true),
            ]),
            (0..100)
                .map(|i| vec![Value::Integer(i), Value::String(format!("u{}", i))])
                .collect(),
        );
        registry.register(Arc::new(pg)).unwrap();

        let vectors = MemoryAdapter::new("vec", SourceKind::Vector);
        vectors.add_table(
            "embeddings",
            Schema::new(vec![
                Column::new("user_id", ColumnType::Int64, false),
                Column::new("embedding", ColumnType::Vector { dim: 2 }, false),
            ]),
            (0..10_000)
                .map(|i| {
                    vec![
                        Value::Integer(i % 100),
                        Value::Vector(vec![i as f32, (i * 2) as f32]),
                    ]
                })
                .collect(),
        );
        registry.register(Arc::new(vectors)).unwrap();

        registry
    }

    fn plan_query(sql: &str) -> (FederationPlan, Arc<SourceRegistry>) {
        let registry = two_source_registry();
        let parser = QueryParser::new(Arc::clone(&registry));
        let optimizer = Optimizer::new(Arc::clone(&registry), OptimizerConfig::default());
        let plan = optimizer.optimize(&parser.parse(sql).unwrap()).unwrap();
        let planner = FederationPlanner::new(Arc::clone(&registry), FederationConfig::default());
        (planner.plan(&plan).unwrap(), registry)
    }

    #[test]
    fn test_cross_source_join_broadcasts_small_side() {
        let (fed_plan, _) = plan_query(
            "SELECT name FROM pg.users JOIN vec.embeddings ON users.id = embeddings.user_id",
        );
        let mut dispatches = Vec::new();
        fed_plan.root.collect_dispatches(&mut dispatches);
        assert_eq!(dispatches.len(), 2);
        assert_eq!(fed_plan.concurrent_dispatches.len(), 2);

        let mut found = None;
        find_join(&fed_plan.root, &mut found);
        match found {
            Some(JoinAlgorithm::BroadcastHash { build_left }) => {
                // pg.users (100 rows) is the left input and the build side
                assert!(build_left);
            }
            other => panic!("expected broadcast hash, got {:?}", other),
        }
    }

    fn find_join(node: &FedNode, out: &mut Option<JoinAlgorithm>) {
        if let FedNode::Local {
            join_algorithm: Some(algo),
            ..
        } = node
        {
            *out = Some(*algo);
        }
        for child in node.children() {
            find_join(child, out);
        }
    }

    #[test]
    fn test_dependencies_cover_both_sources() {
        let (fed_plan, _) = plan_query(
            "SELECT name FROM pg.users JOIN vec.embeddings ON users.id = embeddings.user_id",
        );
        assert!(fed_plan
            .dependencies
            .contains(&TableRef::new("pg", "users")));
        assert!(fed_plan
            .dependencies
            .contains(&TableRef::new("vec", "embeddings")));
    }

    #[test]
    fn test_topo_order_ends_at_root() {
        let (fed_plan, _) = plan_query("SELECT name FROM pg.users");
        assert_eq!(*fed_plan.topo_order.last().unwrap(), fed_plan.root.id());
    }

    #[test]
    fn test_single_source_query_is_one_dispatch() {
        let (fed_plan, _) = plan_query("SELECT name FROM pg.users");
        let mut dispatches = Vec::new();
        fed_plan.root.collect_dispatches(&mut dispatches);
        assert_eq!(dispatches.len(), 1);
        match &fed_plan.root {
            FedNode::Dispatch { source, .. } => assert_eq!(source, "pg"),
            FedNode::Local { .. } => panic!("single-source query should be a pure dispatch"),
        }
    }
}

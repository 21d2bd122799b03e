// # Optimizer
//
// Rule-based and deterministic. Rules are pure plan-to-plan functions applied
// in a fixed order until the plan stops changing. Rewrites must preserve the
// output schema and row multiset; a rule that cannot prove equivalence for a
// shape leaves that shape alone.

pub mod rules;

pub use rules::{
    CapabilityPushdown, ConstantFolding, JoinReordering, PredicatePushdown, ProjectionPruning,
    SubqueryFlattening,
};

use crate::adapter::SourceRegistry;
use crate::error::Result;
use crate::plan::{BinaryOp, Expr, LogicalPlan};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How much to trust a row estimate. Estimates built on the default magic
/// constant are explicitly low-confidence; adaptive execution reacts faster
/// to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    High,
    Low,
}

#[derive(Debug, Clone, Copy)]
pub struct RowEstimate {
    pub rows: u64,
    pub confidence: Confidence,
}

impl RowEstimate {
    fn scaled(self, factor: f64) -> RowEstimate {
        RowEstimate {
            rows: ((self.rows as f64 * factor).ceil() as u64).max(1),
            confidence: self.confidence,
        }
    }

    fn degrade(mut self) -> RowEstimate {
        self.confidence = Confidence::Low;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Names of rules to run, in the canonical order. Empty means all.
    pub rule_set: Vec<String>,
    /// Row estimate for tables without statistics.
    pub default_row_estimate: u64,
    /// Fixpoint iteration bound.
    pub max_passes: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            rule_set: Vec::new(),
            default_row_estimate: 1_000,
            max_passes: 10,
        }
    }
}

/// Shared state the rules read: source statistics and defaults.
pub struct OptimizerContext<'a> {
    pub registry: &'a SourceRegistry,
    pub default_row_estimate: u64,
}

impl OptimizerContext<'_> {
    /// Estimate the output cardinality of a plan. Selectivity factors are
    /// fixed constants; what matters for planning is that they are
    /// deterministic and monotone, not that they are right.
    pub fn estimate_rows(&self, plan: &LogicalPlan) -> RowEstimate {
        match plan {
            LogicalPlan::Scan {
                source,
                table,
                predicate,
                ..
            } => {
                let base = match self.registry.estimated_rows(source, table) {
                    Some(rows) => RowEstimate {
                        rows: rows.max(1),
                        confidence: Confidence::High,
                    },
                    None => RowEstimate {
                        rows: self.default_row_estimate,
                        confidence: Confidence::Low,
                    },
                };
                if predicate.is_some() {
                    base.scaled(predicate_selectivity(predicate.as_ref().unwrap()))
                } else {
                    base
                }
            }
            LogicalPlan::Filter { input, predicate } => self
                .estimate_rows(input)
                .scaled(predicate_selectivity(predicate)),
            LogicalPlan::Project { input, .. }
            | LogicalPlan::Sort { input, .. }
            | LogicalPlan::Window { input, .. } => self.estimate_rows(input),
            LogicalPlan::Limit { input, limit, .. } => {
                let inner = self.estimate_rows(input);
                match limit {
                    Some(n) => RowEstimate {
                        rows: inner.rows.min(*n as u64),
                        confidence: inner.confidence,
                    },
                    None => inner,
                }
            }
            LogicalPlan::Join {
                left,
                right,
                join_type,
                condition,
                ..
            } => {
                let l = self.estimate_rows(left);
                let r = self.estimate_rows(right);
                let confidence = worst(l.confidence, r.confidence);
                let rows = if is_equi_condition(condition) {
                    // one-to-many assumption for equi joins
                    l.rows.max(r.rows)
                } else {
                    // cross-ish join with a residual predicate
                    (l.rows.saturating_mul(r.rows) / 10).max(1)
                };
                let rows = match join_type {
                    crate::plan::JoinType::Semi | crate::plan::JoinType::Anti => l.rows,
                    _ => rows,
                };
                RowEstimate { rows, confidence }
            }
            LogicalPlan::Aggregate {
                input, group_keys, ..
            } => {
                let inner = self.estimate_rows(input);
                if group_keys.is_empty() {
                    RowEstimate {
                        rows: 1,
                        confidence: inner.confidence,
                    }
                } else {
                    inner.scaled(0.1).degrade()
                }
            }
            LogicalPlan::Union { inputs, .. } => {
                let mut rows = 0u64;
                let mut confidence = Confidence::High;
                for input in inputs {
                    let e = self.estimate_rows(input);
                    rows = rows.saturating_add(e.rows);
                    confidence = worst(confidence, e.confidence);
                }
                RowEstimate { rows, confidence }
            }
            LogicalPlan::Federated { inner, .. } => self.estimate_rows(inner),
            LogicalPlan::Unsupported { .. } => RowEstimate {
                rows: self.default_row_estimate,
                confidence: Confidence::Low,
            },
        }
    }
}

fn worst(a: Confidence, b: Confidence) -> Confidence {
    if a == Confidence::Low || b == Confidence::Low {
        Confidence::Low
    } else {
        Confidence::High
    }
}

/// Fixed selectivity constants per predicate shape.
fn predicate_selectivity(predicate: &Expr) -> f64 {
    predicate
        .split_conjunction()
        .iter()
        .map(|conjunct| match conjunct {
            Expr::BinaryOp { op: BinaryOp::Eq, .. } => 0.1,
            Expr::BinaryOp { op, .. } if op.is_comparison() => 0.3,
            Expr::BinaryOp { op: BinaryOp::Like, .. } => 0.25,
            Expr::Literal(crate::common::Value::Boolean(true)) => 1.0,
            _ => 0.5,
        })
        .product()
}

pub(crate) fn is_equi_condition(condition: &Expr) -> bool {
    condition.split_conjunction().iter().any(|c| {
        matches!(
            c,
            Expr::BinaryOp {
                op: BinaryOp::Eq,
                left,
                right,
            } if matches!(left.as_ref(), Expr::Column { .. })
                && matches!(right.as_ref(), Expr::Column { .. })
        )
    })
}

/// A rewrite rule: a pure function from plan to plan.
pub trait RewriteRule {
    fn name(&self) -> &'static str;
    fn apply(&self, plan: &Arc<LogicalPlan>, ctx: &OptimizerContext<'_>)
        -> Result<Arc<LogicalPlan>>;
}

pub struct Optimizer {
    registry: Arc<SourceRegistry>,
    config: OptimizerConfig,
}

impl Optimizer {
    pub fn new(registry: Arc<SourceRegistry>, config: OptimizerConfig) -> Self {
        Self { registry, config }
    }

    fn rules(&self) -> Vec<Box<dyn RewriteRule>> {
        let all: Vec<Box<dyn RewriteRule>> = vec![
            Box::new(ConstantFolding),
            Box::new(PredicatePushdown),
            Box::new(ProjectionPruning),
            Box::new(JoinReordering),
            Box::new(SubqueryFlattening),
        ];
        if self.config.rule_set.is_empty() {
            return all;
        }
        all.into_iter()
            .filter(|r| self.config.rule_set.iter().any(|n| n == r.name()))
            .collect()
    }

    /// Optimize to fixpoint. `optimize(optimize(p)) == optimize(p)`.
    pub fn optimize(&self, plan: &Arc<LogicalPlan>) -> Result<Arc<LogicalPlan>> {
        let ctx = OptimizerContext {
            registry: &self.registry,
            default_row_estimate: self.config.default_row_estimate,
        };
        let mut current = Arc::clone(plan);
        for _pass in 0..self.config.max_passes {
            let mut next = Arc::clone(&current);
            for rule in self.rules() {
                let rewritten = rule.apply(&next, &ctx)?;
                if rewritten.as_ref() != next.as_ref() {
                    tracing::debug!(rule = rule.name(), "optimizer rule fired");
                }
                next = rewritten;
            }
            if next.as_ref() == current.as_ref() {
                break;
            }
            current = next;
        }
        // Capability pushdown runs once the plan is stable: it draws the
        // federation boundaries the planner splits on.
        let enabled = self.config.rule_set.is_empty()
            || self.config.rule_set.iter().any(|n| n == "capability_pushdown");
        if enabled {
            current = CapabilityPushdown.apply(&current, &ctx)?;
        }
        Ok(current)
    }
}

// Rewrite rules, in their canonical application order:
// constant folding, predicate pushdown, projection pruning, join reordering,
// subquery flattening, and (after fixpoint) source-capability pushdown.

use crate::common::{Schema, Value};
use crate::error::Result;
use crate::execution::expressions::ExpressionEvaluator;
use crate::optimizer::{is_equi_condition, OptimizerContext, RewriteRule};
use crate::plan::{node_id, BinaryOp, Expr, JoinType, LogicalPlan};
use std::collections::HashSet;
use std::sync::Arc;

// ============================================================================
// 1. Constant folding
// ============================================================================

pub struct ConstantFolding;

impl RewriteRule for ConstantFolding {
    fn name(&self) -> &'static str {
        "constant_folding"
    }

    fn apply(
        &self,
        plan: &Arc<LogicalPlan>,
        _ctx: &OptimizerContext<'_>,
    ) -> Result<Arc<LogicalPlan>> {
        plan.transform_up(&|node: Arc<LogicalPlan>| {
            let folded = match node.as_ref() {
                LogicalPlan::Filter { input, predicate } => {
                    let predicate = fold_expr(predicate);
                    // Filter(true) is a no-op
                    if predicate == Expr::Literal(Value::Boolean(true)) {
                        return Ok(Arc::clone(input));
                    }
                    LogicalPlan::Filter {
                        input: Arc::clone(input),
                        predicate,
                    }
                }
                LogicalPlan::Project { input, exprs } => LogicalPlan::Project {
                    input: Arc::clone(input),
                    exprs: exprs
                        .iter()
                        .map(|(e, a)| (fold_expr(e), a.clone()))
                        .collect(),
                },
                LogicalPlan::Scan {
                    source,
                    table,
                    projection,
                    predicate: Some(predicate),
                } => LogicalPlan::Scan {
                    source: source.clone(),
                    table: table.clone(),
                    projection: projection.clone(),
                    predicate: Some(fold_expr(predicate)),
                },
                LogicalPlan::Join {
                    left,
                    right,
                    join_type,
                    condition,
                    hint,
                } => LogicalPlan::Join {
                    left: Arc::clone(left),
                    right: Arc::clone(right),
                    join_type: *join_type,
                    condition: fold_expr(condition),
                    hint: *hint,
                },
                _ => return Ok(node),
            };
            if folded == *node {
                Ok(node)
            } else {
                Ok(Arc::new(folded))
            }
        })
    }
}

/// Fold literal subtrees and simplify boolean identities. Expressions whose
/// evaluation fails (overflow, division by zero) are left alone so the error
/// surfaces at execution time, per the error propagation policy.
pub(crate) fn fold_expr(expr: &Expr) -> Expr {
    let folded = match expr {
        Expr::BinaryOp { left, op, right } => {
            let l = fold_expr(left);
            let r = fold_expr(right);
            match (op, &l, &r) {
                (BinaryOp::And, Expr::Literal(Value::Boolean(true)), other)
                | (BinaryOp::And, other, Expr::Literal(Value::Boolean(true))) => {
                    return other.clone()
                }
                (BinaryOp::And, Expr::Literal(Value::Boolean(false)), _)
                | (BinaryOp::And, _, Expr::Literal(Value::Boolean(false))) => {
                    return Expr::Literal(Value::Boolean(false))
                }
                (BinaryOp::Or, Expr::Literal(Value::Boolean(false)), other)
                | (BinaryOp::Or, other, Expr::Literal(Value::Boolean(false))) => {
                    return other.clone()
                }
                (BinaryOp::Or, Expr::Literal(Value::Boolean(true)), _)
                | (BinaryOp::Or, _, Expr::Literal(Value::Boolean(true))) => {
                    return Expr::Literal(Value::Boolean(true))
                }
                _ => Expr::binary(l, *op, r),
            }
        }
        Expr::UnaryOp { op, expr } => Expr::UnaryOp {
            op: *op,
            expr: Box::new(fold_expr(expr)),
        },
        Expr::Call { func, args } => Expr::Call {
            func: func.clone(),
            args: args.iter().map(fold_expr).collect(),
        },
        Expr::Case {
            operand,
            branches,
            else_expr,
        } => Expr::Case {
            operand: operand.as_ref().map(|e| Box::new(fold_expr(e))),
            branches: branches
                .iter()
                .map(|(w, t)| (fold_expr(w), fold_expr(t)))
                .collect(),
            else_expr: else_expr.as_ref().map(|e| Box::new(fold_expr(e))),
        },
        Expr::Cast { expr, to } => Expr::Cast {
            expr: Box::new(fold_expr(expr)),
            to: to.clone(),
        },
        Expr::Literal(_) | Expr::Column { .. } => return expr.clone(),
    };
    if matches!(folded, Expr::Literal(_)) {
        return folded;
    }
    let mut refs = Vec::new();
    folded.referenced_columns(&mut refs);
    if refs.is_empty() {
        let evaluator = ExpressionEvaluator::new(Arc::new(Schema::empty()));
        if let Ok(value) = evaluator.evaluate(&folded, &Vec::new()) {
            return Expr::Literal(value);
        }
    }
    folded
}

// ============================================================================
// 2. Predicate pushdown
// ============================================================================

pub struct PredicatePushdown;

impl RewriteRule for PredicatePushdown {
    fn name(&self) -> &'static str {
        "predicate_pushdown"
    }

    fn apply(
        &self,
        plan: &Arc<LogicalPlan>,
        ctx: &OptimizerContext<'_>,
    ) -> Result<Arc<LogicalPlan>> {
        push_down(plan, ctx)
    }
}

fn push_down(plan: &Arc<LogicalPlan>, ctx: &OptimizerContext<'_>) -> Result<Arc<LogicalPlan>> {
    if let LogicalPlan::Filter { input, predicate } = plan.as_ref() {
        match input.as_ref() {
            LogicalPlan::Scan {
                source,
                table,
                projection,
                predicate: existing,
            } => {
                let merged = match existing {
                    Some(e) => Expr::and(e.clone(), predicate.clone()),
                    None => predicate.clone(),
                };
                return Ok(Arc::new(LogicalPlan::Scan {
                    source: source.clone(),
                    table: table.clone(),
                    projection: projection.clone(),
                    predicate: Some(merged),
                }));
            }
            LogicalPlan::Filter {
                input: inner_input,
                predicate: inner_pred,
            } => {
                let merged = Arc::new(LogicalPlan::Filter {
                    input: Arc::clone(inner_input),
                    predicate: Expr::and(inner_pred.clone(), predicate.clone()),
                });
                return push_down(&merged, ctx);
            }
            LogicalPlan::Project { input: proj_input, exprs } => {
                if let Some(substituted) = substitute_project(predicate, exprs) {
                    let pushed = push_down(
                        &Arc::new(LogicalPlan::Filter {
                            input: Arc::clone(proj_input),
                            predicate: substituted,
                        }),
                        ctx,
                    )?;
                    return Ok(Arc::new(LogicalPlan::Project {
                        input: pushed,
                        exprs: exprs.clone(),
                    }));
                }
            }
            LogicalPlan::Sort { input: sort_input, keys } => {
                let pushed = push_down(
                    &Arc::new(LogicalPlan::Filter {
                        input: Arc::clone(sort_input),
                        predicate: predicate.clone(),
                    }),
                    ctx,
                )?;
                return Ok(Arc::new(LogicalPlan::Sort {
                    input: pushed,
                    keys: keys.clone(),
                }));
            }
            LogicalPlan::Union { inputs, all } => {
                // only sound when the predicate resolves in every arm
                let resolves_everywhere = inputs.iter().all(|arm| {
                    arm.output_schema(ctx.registry)
                        .map(|schema| resolvable(predicate, &schema))
                        .unwrap_or(false)
                });
                if resolves_everywhere {
                    let mut new_inputs = Vec::with_capacity(inputs.len());
                    for arm in inputs {
                        new_inputs.push(push_down(
                            &Arc::new(LogicalPlan::Filter {
                                input: Arc::clone(arm),
                                predicate: predicate.clone(),
                            }),
                            ctx,
                        )?);
                    }
                    return Ok(Arc::new(LogicalPlan::Union {
                        inputs: new_inputs,
                        all: *all,
                    }));
                }
            }
            LogicalPlan::Join {
                left,
                right,
                join_type,
                condition,
                hint,
            } => {
                if let Some(rewritten) = push_into_join(
                    predicate, left, right, *join_type, condition, *hint, ctx,
                )? {
                    return Ok(rewritten);
                }
            }
            _ => {}
        }
    }

    // recurse into children
    let old_children = plan.children();
    let mut new_children = Vec::with_capacity(old_children.len());
    let mut changed = false;
    for child in &old_children {
        // Federated subtrees are already finalized source dispatches
        let rewritten = if matches!(child.as_ref(), LogicalPlan::Federated { .. }) {
            Arc::clone(child)
        } else {
            push_down(child, ctx)?
        };
        if !Arc::ptr_eq(child, &rewritten) {
            changed = true;
        }
        new_children.push(rewritten);
    }
    if changed {
        Ok(Arc::new(plan.with_children(new_children)?))
    } else {
        Ok(Arc::clone(plan))
    }
}

/// Try to push the conjuncts of `predicate` below a join. Returns `None` when
/// nothing moves. A conjunct may move to a side only when that side's rows
/// are not null-padded by the join (otherwise the rewrite would change outer
/// join results).
fn push_into_join(
    predicate: &Expr,
    left: &Arc<LogicalPlan>,
    right: &Arc<LogicalPlan>,
    join_type: JoinType,
    condition: &Expr,
    hint: Option<crate::plan::JoinHint>,
    ctx: &OptimizerContext<'_>,
) -> Result<Option<Arc<LogicalPlan>>> {
    let left_schema = match left.output_schema(ctx.registry) {
        Ok(s) => s,
        Err(_) => return Ok(None),
    };
    let right_schema = match right.output_schema(ctx.registry) {
        Ok(s) => s,
        Err(_) => return Ok(None),
    };

    let may_push_left = matches!(
        join_type,
        JoinType::Inner | JoinType::Left | JoinType::Semi | JoinType::Anti
    );
    let may_push_right = matches!(join_type, JoinType::Inner | JoinType::Right);

    let mut to_left = Vec::new();
    let mut to_right = Vec::new();
    let mut remaining = Vec::new();
    for conjunct in predicate.split_conjunction() {
        match conjunct_side(conjunct, &left_schema, &right_schema) {
            Some(Side::Left) if may_push_left => to_left.push(conjunct.clone()),
            Some(Side::Right) if may_push_right => to_right.push(conjunct.clone()),
            _ => remaining.push(conjunct.clone()),
        }
    }
    if to_left.is_empty() && to_right.is_empty() {
        return Ok(None);
    }

    let mut new_left = Arc::clone(left);
    if let Some(pred) = Expr::conjunction(to_left) {
        new_left = push_down(
            &Arc::new(LogicalPlan::Filter {
                input: new_left,
                predicate: pred,
            }),
            ctx,
        )?;
    }
    let mut new_right = Arc::clone(right);
    if let Some(pred) = Expr::conjunction(to_right) {
        new_right = push_down(
            &Arc::new(LogicalPlan::Filter {
                input: new_right,
                predicate: pred,
            }),
            ctx,
        )?;
    }
    let join = Arc::new(LogicalPlan::Join {
        left: new_left,
        right: new_right,
        join_type,
        condition: condition.clone(),
        hint,
    });
    Ok(Some(match Expr::conjunction(remaining) {
        Some(pred) => Arc::new(LogicalPlan::Filter {
            input: join,
            predicate: pred,
        }),
        None => join,
    }))
}

enum Side {
    Left,
    Right,
}

/// Which join side a conjunct's column references all live on, if exactly one.
fn conjunct_side(conjunct: &Expr, left: &Schema, right: &Schema) -> Option<Side> {
    let mut refs = Vec::new();
    conjunct.referenced_columns(&mut refs);
    if refs.is_empty() {
        return None;
    }
    let mut any_left = false;
    let mut any_right = false;
    for (relation, name) in &refs {
        let in_left = !left.resolve(relation.as_deref(), name).is_empty();
        let in_right = !right.resolve(relation.as_deref(), name).is_empty();
        match (in_left, in_right) {
            (true, false) => any_left = true,
            (false, true) => any_right = true,
            // unresolvable or ambiguous: stay above the join
            _ => return None,
        }
    }
    match (any_left, any_right) {
        (true, false) => Some(Side::Left),
        (false, true) => Some(Side::Right),
        _ => None,
    }
}

/// Rewrite a predicate over a projection's output into one over its input by
/// substituting each referenced alias with its defining expression.
fn substitute_project(predicate: &Expr, exprs: &[(Expr, String)]) -> Option<Expr> {
    match predicate {
        Expr::Column { name, .. } => {
            for (expr, alias) in exprs {
                if alias == name {
                    return Some(expr.clone());
                }
            }
            // not produced by the projection: cannot push through
            None
        }
        Expr::Literal(_) => Some(predicate.clone()),
        Expr::BinaryOp { left, op, right } => Some(Expr::binary(
            substitute_project(left, exprs)?,
            *op,
            substitute_project(right, exprs)?,
        )),
        Expr::UnaryOp { op, expr } => Some(Expr::UnaryOp {
            op: *op,
            expr: Box::new(substitute_project(expr, exprs)?),
        }),
        Expr::Call { func, args } => {
            let args = args
                .iter()
                .map(|a| substitute_project(a, exprs))
                .collect::<Option<Vec<_>>>()?;
            Some(Expr::Call {
                func: func.clone(),
                args,
            })
        }
        Expr::Cast { expr, to } => Some(Expr::Cast {
            expr: Box::new(substitute_project(expr, exprs)?),
            to: to.clone(),
        }),
        Expr::Case { .. } => None,
    }
}

// ============================================================================
// 3. Projection pruning
// ============================================================================

pub struct ProjectionPruning;

impl RewriteRule for ProjectionPruning {
    fn name(&self) -> &'static str {
        "projection_pruning"
    }

    fn apply(
        &self,
        plan: &Arc<LogicalPlan>,
        ctx: &OptimizerContext<'_>,
    ) -> Result<Arc<LogicalPlan>> {
        prune(plan, None, ctx)
    }
}

type Required = Option<HashSet<(Option<String>, String)>>;

fn require_all() -> Required {
    None
}

fn union_refs(required: &Required, exprs: &[&Expr]) -> Required {
    let mut set = required.clone()?;
    for expr in exprs {
        let mut refs = Vec::new();
        expr.referenced_columns(&mut refs);
        set.extend(refs);
    }
    Some(set)
}

fn prune(
    plan: &Arc<LogicalPlan>,
    required: Required,
    ctx: &OptimizerContext<'_>,
) -> Result<Arc<LogicalPlan>> {
    match plan.as_ref() {
        LogicalPlan::Scan {
            source,
            table,
            projection,
            predicate,
        } => {
            let Some(req) = required else {
                return Ok(Arc::clone(plan));
            };
            // predicate columns must survive the pushdown projection
            let req = {
                let mut req = req;
                if let Some(pred) = predicate {
                    let mut refs = Vec::new();
                    pred.referenced_columns(&mut refs);
                    req.extend(refs);
                }
                req
            };
            let schema = match ctx.registry.schema_of(source, table) {
                Ok(s) => s,
                Err(_) => return Ok(Arc::clone(plan)),
            };
            let mut keep: Vec<String> = Vec::new();
            for col in &schema.columns {
                let wanted = req.iter().any(|(rel, name)| {
                    name == &col.name
                        && match rel {
                            Some(r) => r == table,
                            None => true,
                        }
                });
                let already = match projection {
                    Some(p) => p.contains(&col.name),
                    None => true,
                };
                if wanted && already {
                    keep.push(col.name.clone());
                }
            }
            if keep.is_empty() {
                // a scan must produce at least one column (COUNT(*) reads none)
                if let Some(first) = schema.columns.first() {
                    keep.push(first.name.clone());
                }
            }
            let new_projection = if keep.len() == schema.len() {
                None
            } else {
                Some(keep)
            };
            if new_projection == *projection {
                return Ok(Arc::clone(plan));
            }
            Ok(Arc::new(LogicalPlan::Scan {
                source: source.clone(),
                table: table.clone(),
                projection: new_projection,
                predicate: predicate.clone(),
            }))
        }
        LogicalPlan::Filter { input, predicate } => {
            let child_req = union_refs(&required, &[predicate]);
            let new_input = prune(input, child_req, ctx)?;
            rebuild_if_changed(plan, vec![new_input])
        }
        LogicalPlan::Project { input, exprs } => {
            let child_req = {
                let mut set = HashSet::new();
                for (expr, _) in exprs {
                    let mut refs = Vec::new();
                    expr.referenced_columns(&mut refs);
                    set.extend(refs);
                }
                Some(set)
            };
            let new_input = prune(input, child_req, ctx)?;
            rebuild_if_changed(plan, vec![new_input])
        }
        LogicalPlan::Sort { input, keys } => {
            let key_exprs: Vec<&Expr> = keys.iter().map(|k| &k.expr).collect();
            let child_req = union_refs(&required, &key_exprs);
            let new_input = prune(input, child_req, ctx)?;
            rebuild_if_changed(plan, vec![new_input])
        }
        LogicalPlan::Limit { input, .. } => {
            let new_input = prune(input, required, ctx)?;
            rebuild_if_changed(plan, vec![new_input])
        }
        LogicalPlan::Aggregate {
            input,
            group_keys,
            aggregates,
        } => {
            let mut exprs: Vec<&Expr> = group_keys.iter().collect();
            for agg in aggregates {
                if let Some(a) = &agg.arg {
                    exprs.push(a);
                }
                if let Some(a) = &agg.second_arg {
                    exprs.push(a);
                }
            }
            let child_req = union_refs(&Some(HashSet::new()), &exprs);
            let new_input = prune(input, child_req, ctx)?;
            rebuild_if_changed(plan, vec![new_input])
        }
        LogicalPlan::Join {
            left,
            right,
            condition,
            ..
        } => {
            let child_req = union_refs(&required, &[condition]);
            // each side keeps the columns it can resolve
            let split = |side: &Arc<LogicalPlan>| -> Required {
                let req = child_req.clone()?;
                let schema = side.output_schema(ctx.registry).ok()?;
                Some(
                    req.into_iter()
                        .filter(|(rel, name)| !schema.resolve(rel.as_deref(), name).is_empty())
                        .collect(),
                )
            };
            let new_left = prune(left, split(left), ctx)?;
            let new_right = prune(right, split(right), ctx)?;
            rebuild_if_changed(plan, vec![new_left, new_right])
        }
        // window, union and federated subtrees keep their full input width
        _ => {
            let old_children = plan.children();
            let mut new_children = Vec::with_capacity(old_children.len());
            for child in &old_children {
                new_children.push(prune(child, require_all(), ctx)?);
            }
            rebuild_if_changed(plan, new_children)
        }
    }
}

fn rebuild_if_changed(
    plan: &Arc<LogicalPlan>,
    new_children: Vec<Arc<LogicalPlan>>,
) -> Result<Arc<LogicalPlan>> {
    let changed = plan
        .children()
        .iter()
        .zip(&new_children)
        .any(|(old, new)| !Arc::ptr_eq(old, new));
    if changed {
        Ok(Arc::new(plan.with_children(new_children)?))
    } else {
        Ok(Arc::clone(plan))
    }
}

// ============================================================================
// 4. Join reordering
// ============================================================================

pub struct JoinReordering;

impl RewriteRule for JoinReordering {
    fn name(&self) -> &'static str {
        "join_reordering"
    }

    fn apply(
        &self,
        plan: &Arc<LogicalPlan>,
        ctx: &OptimizerContext<'_>,
    ) -> Result<Arc<LogicalPlan>> {
        reorder(plan, ctx)
    }
}

fn reorder(plan: &Arc<LogicalPlan>, ctx: &OptimizerContext<'_>) -> Result<Arc<LogicalPlan>> {
    if let LogicalPlan::Join {
        join_type: JoinType::Inner,
        ..
    } = plan.as_ref()
    {
        let mut relations = Vec::new();
        let mut conjuncts = Vec::new();
        collect_inner_join(plan, &mut relations, &mut conjuncts);
        if relations.len() >= 3 {
            // reorder leaves first
            let mut reordered_rels = Vec::with_capacity(relations.len());
            for rel in &relations {
                reordered_rels.push(reorder(rel, ctx)?);
            }
            return rebuild_left_deep(plan, reordered_rels, conjuncts, ctx);
        }
    }
    let old_children = plan.children();
    let mut new_children = Vec::with_capacity(old_children.len());
    for child in &old_children {
        new_children.push(reorder(child, ctx)?);
    }
    rebuild_if_changed(plan, new_children)
}

/// Flatten a chain of inner joins into base relations plus a conjunct pool.
fn collect_inner_join<'a>(
    plan: &'a Arc<LogicalPlan>,
    relations: &mut Vec<Arc<LogicalPlan>>,
    conjuncts: &mut Vec<Expr>,
) {
    match plan.as_ref() {
        LogicalPlan::Join {
            left,
            right,
            join_type: JoinType::Inner,
            condition,
            ..
        } => {
            collect_inner_join(left, relations, conjuncts);
            collect_inner_join(right, relations, conjuncts);
            conjuncts.extend(condition.split_conjunction().into_iter().cloned());
        }
        _ => relations.push(Arc::clone(plan)),
    }
}

/// Greedy left-deep rebuild: start from the smallest relation, repeatedly
/// join the relation that minimizes the estimated intermediate size; ties
/// break on the stable node id for determinism. The original output column
/// order is restored with a projection when the order changed.
fn rebuild_left_deep(
    original: &Arc<LogicalPlan>,
    mut relations: Vec<Arc<LogicalPlan>>,
    mut conjuncts: Vec<Expr>,
    ctx: &OptimizerContext<'_>,
) -> Result<Arc<LogicalPlan>> {
    let original_schema = original.output_schema(ctx.registry)?;

    let start = relations
        .iter()
        .enumerate()
        .min_by_key(|(_, rel)| (ctx.estimate_rows(rel).rows, node_id(rel)))
        .map(|(i, _)| i)
        .unwrap_or(0);
    let mut current = relations.remove(start);
    let mut current_schema = current.output_schema(ctx.registry)?;
    let mut current_rows = ctx.estimate_rows(&current).rows;

    while !relations.is_empty() {
        let mut best: Option<(usize, u64, u64)> = None;
        for (i, candidate) in relations.iter().enumerate() {
            let cand_schema = candidate.output_schema(ctx.registry)?;
            let cand_rows = ctx.estimate_rows(candidate).rows;
            let connected = conjuncts
                .iter()
                .any(|c| connects(c, &current_schema, &cand_schema));
            let size = if connected {
                current_rows.max(cand_rows)
            } else {
                current_rows.saturating_mul(cand_rows)
            };
            let id = node_id(candidate);
            match best {
                Some((_, best_size, best_id))
                    if (size, id) >= (best_size, best_id) => {}
                _ => best = Some((i, size, id)),
            }
        }
        let (idx, size, _) = best.expect("relations non-empty");
        let next = relations.remove(idx);
        let next_schema = next.output_schema(ctx.registry)?;
        let joined_schema = current_schema.join(&next_schema);

        // pull in every conjunct now fully resolvable
        let mut used = Vec::new();
        conjuncts.retain(|c| {
            if resolvable(c, &joined_schema) {
                used.push(c.clone());
                false
            } else {
                true
            }
        });
        let condition =
            Expr::conjunction(used).unwrap_or_else(|| Expr::literal(Value::Boolean(true)));
        current = Arc::new(LogicalPlan::Join {
            left: current,
            right: next,
            join_type: JoinType::Inner,
            condition,
            hint: None,
        });
        current_schema = joined_schema;
        current_rows = size;
    }

    // conjuncts that never became resolvable stay as a filter
    if let Some(rest) = Expr::conjunction(conjuncts) {
        current = Arc::new(LogicalPlan::Filter {
            input: current,
            predicate: rest,
        });
    }

    // restore the original column order if the greedy order changed it
    let new_schema = current.output_schema(ctx.registry)?;
    if new_schema != original_schema {
        let exprs = original_schema
            .columns
            .iter()
            .map(|c| {
                (
                    Expr::Column {
                        relation: c.relation.clone(),
                        name: c.name.clone(),
                    },
                    c.name.clone(),
                )
            })
            .collect();
        current = Arc::new(LogicalPlan::Project {
            input: current,
            exprs,
        });
    }
    Ok(current)
}

fn connects(conjunct: &Expr, left: &Schema, right: &Schema) -> bool {
    let mut refs = Vec::new();
    conjunct.referenced_columns(&mut refs);
    let mut any_left = false;
    let mut any_right = false;
    for (rel, name) in &refs {
        if !left.resolve(rel.as_deref(), name).is_empty() {
            any_left = true;
        }
        if !right.resolve(rel.as_deref(), name).is_empty() {
            any_right = true;
        }
    }
    any_left && any_right
}

fn resolvable(conjunct: &Expr, schema: &Schema) -> bool {
    let mut refs = Vec::new();
    conjunct.referenced_columns(&mut refs);
    refs.iter()
        .all(|(rel, name)| !schema.resolve(rel.as_deref(), name).is_empty())
}

// ============================================================================
// 5. Subquery flattening
// ============================================================================

pub struct SubqueryFlattening;

impl RewriteRule for SubqueryFlattening {
    fn name(&self) -> &'static str {
        "subquery_flattening"
    }

    fn apply(
        &self,
        plan: &Arc<LogicalPlan>,
        ctx: &OptimizerContext<'_>,
    ) -> Result<Arc<LogicalPlan>> {
        plan.transform_up(&|node: Arc<LogicalPlan>| {
            match node.as_ref() {
                // Project over Project: inline the inner expressions
                LogicalPlan::Project { input, exprs } => {
                    if let LogicalPlan::Project {
                        input: inner_input,
                        exprs: inner_exprs,
                    } = input.as_ref()
                    {
                        let mut merged = Vec::with_capacity(exprs.len());
                        for (expr, alias) in exprs {
                            match substitute_project(expr, inner_exprs) {
                                Some(e) => merged.push((e, alias.clone())),
                                None => return Ok(node),
                            }
                        }
                        return Ok(Arc::new(LogicalPlan::Project {
                            input: Arc::clone(inner_input),
                            exprs: merged,
                        }));
                    }
                    // identity projection over its input schema disappears
                    if let Ok(input_schema) = input.output_schema(ctx.registry) {
                        if exprs.len() == input_schema.len() {
                            let identity = exprs.iter().zip(&input_schema.columns).all(
                                |((expr, alias), col)| match expr {
                                    Expr::Column { relation, name } => {
                                        alias == &col.name
                                            && name == &col.name
                                            && (relation.is_none()
                                                || relation == &col.relation)
                                    }
                                    _ => false,
                                },
                            );
                            if identity {
                                return Ok(Arc::clone(input));
                            }
                        }
                    }
                    Ok(node)
                }
                // Limit over Limit combines
                LogicalPlan::Limit {
                    input,
                    limit,
                    offset,
                } => {
                    if let LogicalPlan::Limit {
                        input: inner_input,
                        limit: inner_limit,
                        offset: inner_offset,
                    } = input.as_ref()
                    {
                        let inner_remaining =
                            inner_limit.map(|n| n.saturating_sub(*offset));
                        let combined = match (limit, inner_remaining) {
                            (Some(a), Some(b)) => Some((*a).min(b)),
                            (Some(a), None) => Some(*a),
                            (None, b) => b,
                        };
                        return Ok(Arc::new(LogicalPlan::Limit {
                            input: Arc::clone(inner_input),
                            limit: combined,
                            offset: inner_offset + offset,
                        }));
                    }
                    Ok(node)
                }
                _ => Ok(node),
            }
        })
    }
}

// ============================================================================
// 6. Source-capability pushdown
// ============================================================================

pub struct CapabilityPushdown;

impl RewriteRule for CapabilityPushdown {
    fn name(&self) -> &'static str {
        "capability_pushdown"
    }

    fn apply(
        &self,
        plan: &Arc<LogicalPlan>,
        ctx: &OptimizerContext<'_>,
    ) -> Result<Arc<LogicalPlan>> {
        wrap_federated(plan, ctx)
    }
}

/// Top-down: wrap each maximal single-source, fully-supported subtree in a
/// `Federated` node. Nothing inside an existing `Federated` node is touched.
fn wrap_federated(
    plan: &Arc<LogicalPlan>,
    ctx: &OptimizerContext<'_>,
) -> Result<Arc<LogicalPlan>> {
    if matches!(plan.as_ref(), LogicalPlan::Federated { .. }) {
        return Ok(Arc::clone(plan));
    }
    if let Some(source) = pushdown_target(plan, ctx) {
        let dependencies = plan.dependencies();
        tracing::debug!(source = %source, node = plan.name(), "capability pushdown");
        return Ok(Arc::new(LogicalPlan::Federated {
            source,
            inner: Arc::clone(plan),
            dependencies,
        }));
    }
    let old_children = plan.children();
    let mut new_children = Vec::with_capacity(old_children.len());
    for child in &old_children {
        new_children.push(wrap_federated(child, ctx)?);
    }
    rebuild_if_changed(plan, new_children)
}

/// The source a subtree can be dispatched to wholesale, if any: a single
/// source whose adapter supports every node in the subtree.
fn pushdown_target(plan: &Arc<LogicalPlan>, ctx: &OptimizerContext<'_>) -> Option<String> {
    let source = plan.single_source()?;
    let adapter = ctx.registry.adapter(&source).ok()?;
    let mut all_supported = true;
    plan.traverse(&mut |node| {
        match node {
            LogicalPlan::Federated { .. } | LogicalPlan::Unsupported { .. } => {
                all_supported = false
            }
            _ => {
                if !adapter.supports(node) {
                    all_supported = false;
                }
            }
        }
    });
    if all_supported {
        Some(source)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{MemoryAdapter, SourceKind, SourceRegistry};
    use crate::common::{Column, ColumnType, Schema};
    use crate::optimizer::{Optimizer, OptimizerConfig};
    use crate::parser::QueryParser;

    fn registry() -> Arc<SourceRegistry> {
        let registry = Arc::new(SourceRegistry::new());
        let pg = MemoryAdapter::new("pg", SourceKind::Relational);
        pg.add_table(
            "users",
            Schema::new(vec![
                Column::new("id", ColumnType::Int64, false),
                Column::new("name", ColumnType::Utf8, true),
                Column::new("age", ColumnType::Int64, true),
            ]),
            (0..100)
                .map(|i| {
                    vec![
                        Value::Integer(i),
                        Value::String(format!("u{}", i)),
                        Value::Integer(20 + (i % 40)),
                    ]
                })
                .collect(),
        );
        pg.add_table(
            "orders",
            Schema::new(vec![
                Column::new("order_id", ColumnType::Int64, false),
                Column::new("user_id", ColumnType::Int64, false),
                Column::new("total", ColumnType::Float64, true),
            ]),
            (0..500)
                .map(|i| {
                    vec![
                        Value::Integer(i),
                        Value::Integer(i % 100),
                        Value::Float(i as f64),
                    ]
                })
                .collect(),
        );
        pg.add_table(
            "items",
            Schema::new(vec![
                Column::new("item_id", ColumnType::Int64, false),
                Column::new("order_id", ColumnType::Int64, false),
            ]),
            (0..10)
                .map(|i| vec![Value::Integer(i), Value::Integer(i % 5)])
                .collect(),
        );
        registry.register(Arc::new(pg)).unwrap();
        registry
    }

    fn optimize(sql: &str) -> (Arc<LogicalPlan>, Arc<LogicalPlan>, Arc<SourceRegistry>) {
        let registry = registry();
        let parser = QueryParser::new(Arc::clone(&registry));
        let plan = parser.parse(sql).unwrap();
        let optimizer = Optimizer::new(Arc::clone(&registry), OptimizerConfig::default());
        let optimized = optimizer.optimize(&plan).unwrap();
        (plan, optimized, registry)
    }

    #[test]
    fn test_constant_folding_folds_literal_math() {
        let folded = fold_expr(&Expr::binary(
            Expr::literal(Value::Integer(2)),
            BinaryOp::Plus,
            Expr::literal(Value::Integer(3)),
        ));
        assert_eq!(folded, Expr::literal(Value::Integer(5)));
    }

    #[test]
    fn test_constant_folding_leaves_division_by_zero() {
        let expr = Expr::binary(
            Expr::literal(Value::Integer(1)),
            BinaryOp::Divide,
            Expr::literal(Value::Integer(0)),
        );
        assert_eq!(fold_expr(&expr), expr);
    }

    #[test]
    fn test_predicate_reaches_scan() {
        let (_, optimized, _) = optimize("SELECT id, name FROM users WHERE age > 30");
        let mut pushed = false;
        optimized.traverse(&mut |node| {
            if let LogicalPlan::Scan {
                predicate: Some(_), ..
            } = node
            {
                pushed = true;
            }
        });
        assert!(pushed, "filter should merge into the scan:\n{}", optimized.explain());
    }

    #[test]
    fn test_projection_pruned_to_used_columns() {
        let (_, optimized, _) = optimize("SELECT id FROM users");
        let mut projection = None;
        optimized.traverse(&mut |node| {
            if let LogicalPlan::Scan { projection: p, .. } = node {
                projection = p.clone();
            }
        });
        assert_eq!(projection, Some(vec!["id".to_string()]));
    }

    #[test]
    fn test_schema_preserved_by_optimization() {
        let (plan, optimized, registry) =
            optimize("SELECT name, total FROM users JOIN orders ON users.id = orders.user_id WHERE age > 30");
        assert_eq!(
            plan.output_schema(registry.as_ref()).unwrap(),
            optimized.output_schema(registry.as_ref()).unwrap()
        );
    }

    #[test]
    fn test_optimize_is_fixpoint() {
        let registry = registry();
        let parser = QueryParser::new(Arc::clone(&registry));
        let plan = parser
            .parse(
                "SELECT name FROM users JOIN orders ON users.id = orders.user_id \
                 JOIN items ON orders.order_id = items.order_id WHERE age > 30",
            )
            .unwrap();
        let optimizer = Optimizer::new(Arc::clone(&registry), OptimizerConfig::default());
        let once = optimizer.optimize(&plan).unwrap();
        let twice = optimizer.optimize(&once).unwrap();
        assert_eq!(once.as_ref(), twice.as_ref());
    }

    #[test]
    fn test_capability_pushdown_wraps_single_source() {
        let (_, optimized, _) = optimize("SELECT id, name FROM users WHERE age > 30");
        match optimized.as_ref() {
            LogicalPlan::Federated { source, .. } => assert_eq!(source, "pg"),
            other => panic!(
                "expected federated root, got {}:\n{}",
                other.name(),
                other.explain()
            ),
        }
    }

    #[test]
    fn test_join_reordering_starts_from_smallest() {
        let (_, optimized, registry) = optimize(
            "SELECT name FROM users JOIN orders ON users.id = orders.user_id \
             JOIN items ON orders.order_id = items.order_id",
        );
        // leftmost leaf of the join chain should be the smallest table (items)
        let mut leftmost = None;
        fn find_leftmost(plan: &LogicalPlan, out: &mut Option<String>) {
            match plan {
                LogicalPlan::Join { left, .. } => find_leftmost(left, out),
                LogicalPlan::Scan { table, .. } => *out = Some(table.clone()),
                other => {
                    for child in other.children() {
                        find_leftmost(child, out);
                        break;
                    }
                }
            }
        }
        find_leftmost(&optimized, &mut leftmost);
        assert_eq!(leftmost.as_deref(), Some("items"));
        // and the multiset-preserving schema holds
        let parser = QueryParser::new(Arc::clone(&registry));
        let original = parser
            .parse(
                "SELECT name FROM users JOIN orders ON users.id = orders.user_id \
                 JOIN items ON orders.order_id = items.order_id",
            )
            .unwrap();
        assert_eq!(
            original.output_schema(registry.as_ref()).unwrap(),
            optimized.output_schema(registry.as_ref()).unwrap()
        );
    }

    use crate::common::Value;
}

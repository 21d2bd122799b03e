// Plan canonicalization and fingerprinting.
//
// Equivalent plans must share a fingerprint: AND/OR operand order, commutative
// binary-op operand order and the child order of commutative joins are all
// normalized before hashing. Fingerprints are SHA-256 over the canonical
// serialized form, so they are stable across processes.

use crate::error::Result;
use crate::plan::expr::{BinaryOp, Expr};
use crate::plan::node::LogicalPlan;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Deterministic hash of a canonicalised plan. The cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Fingerprint {
    /// Short form used for operator labels and tie-breaking.
    pub fn short(&self) -> u64 {
        u64::from_be_bytes(self.0[..8].try_into().unwrap_or_default())
    }
}

/// Canonicalize an expression: flatten AND/OR chains and sort their operands,
/// order commutative binary operands, recurse everywhere else. Idempotent.
pub fn canonicalize_expr(expr: &Expr) -> Expr {
    match expr {
        Expr::BinaryOp { op, .. } if matches!(op, BinaryOp::And | BinaryOp::Or) => {
            let mut operands = Vec::new();
            flatten_chain(expr, *op, &mut operands);
            let mut canon: Vec<Expr> = operands.iter().map(|e| canonicalize_expr(e)).collect();
            canon.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
            let mut iter = canon.into_iter();
            let first = iter.next().expect("chain has at least one operand");
            iter.fold(first, |acc, e| Expr::binary(acc, *op, e))
        }
        Expr::BinaryOp { left, op, right } => {
            let mut l = canonicalize_expr(left);
            let mut r = canonicalize_expr(right);
            if op.is_commutative() && l.to_string() > r.to_string() {
                std::mem::swap(&mut l, &mut r);
            }
            Expr::binary(l, *op, r)
        }
        Expr::UnaryOp { op, expr } => Expr::UnaryOp {
            op: *op,
            expr: Box::new(canonicalize_expr(expr)),
        },
        Expr::Call { func, args } => Expr::Call {
            func: func.clone(),
            args: args.iter().map(canonicalize_expr).collect(),
        },
        Expr::Case {
            operand,
            branches,
            else_expr,
        } => Expr::Case {
            operand: operand.as_ref().map(|e| Box::new(canonicalize_expr(e))),
            branches: branches
                .iter()
                .map(|(w, t)| (canonicalize_expr(w), canonicalize_expr(t)))
                .collect(),
            else_expr: else_expr.as_ref().map(|e| Box::new(canonicalize_expr(e))),
        },
        Expr::Cast { expr, to } => Expr::Cast {
            expr: Box::new(canonicalize_expr(expr)),
            to: to.clone(),
        },
        Expr::Literal(_) | Expr::Column { .. } => expr.clone(),
    }
}

fn flatten_chain<'a>(expr: &'a Expr, chain_op: BinaryOp, out: &mut Vec<&'a Expr>) {
    match expr {
        Expr::BinaryOp { left, op, right } if *op == chain_op => {
            flatten_chain(left, chain_op, out);
            flatten_chain(right, chain_op, out);
        }
        other => out.push(other),
    }
}

/// Canonicalize a plan tree. Expressions are canonicalized in place; the
/// children of commutative joins and unions are put in fingerprint order.
/// `canonicalize(canonicalize(p)) == canonicalize(p)`.
pub fn canonicalize(plan: &Arc<LogicalPlan>) -> Result<Arc<LogicalPlan>> {
    plan.transform_up(&|node: Arc<LogicalPlan>| {
        let rewritten = match node.as_ref() {
            LogicalPlan::Scan {
                source,
                table,
                projection,
                predicate,
            } => LogicalPlan::Scan {
                source: source.clone(),
                table: table.clone(),
                projection: projection.clone(),
                predicate: predicate.as_ref().map(canonicalize_expr),
            },
            LogicalPlan::Filter { input, predicate } => LogicalPlan::Filter {
                input: Arc::clone(input),
                predicate: canonicalize_expr(predicate),
            },
            LogicalPlan::Project { input, exprs } => LogicalPlan::Project {
                input: Arc::clone(input),
                exprs: exprs
                    .iter()
                    .map(|(e, a)| (canonicalize_expr(e), a.clone()))
                    .collect(),
            },
            LogicalPlan::Join {
                left,
                right,
                join_type,
                condition,
                hint,
            } => {
                let condition = canonicalize_expr(condition);
                let (mut l, mut r) = (Arc::clone(left), Arc::clone(right));
                if join_type.is_commutative() && raw_digest(&l) > raw_digest(&r) {
                    std::mem::swap(&mut l, &mut r);
                }
                LogicalPlan::Join {
                    left: l,
                    right: r,
                    join_type: *join_type,
                    condition,
                    hint: *hint,
                }
            }
            LogicalPlan::Union { inputs, all } => {
                let mut sorted: Vec<Arc<LogicalPlan>> = inputs.to_vec();
                sorted.sort_by_key(raw_digest);
                LogicalPlan::Union {
                    inputs: sorted,
                    all: *all,
                }
            }
            _ => return Ok(node),
        };
        // Avoid allocating a fresh node when nothing changed, so repeated
        // canonicalization keeps sharing.
        if rewritten == *node {
            Ok(node)
        } else {
            Ok(Arc::new(rewritten))
        }
    })
}

/// Digest of a node as-is (no canonicalization). Used to order the children
/// of commutative operators, where operands were already canonicalized
/// bottom-up by `transform_up`.
fn raw_digest(plan: &Arc<LogicalPlan>) -> [u8; 32] {
    let serialized = serde_json::to_vec(plan.as_ref()).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&serialized);
    hasher.finalize().into()
}

/// Fingerprint of a plan: SHA-256 over its canonicalised serialized form.
pub fn fingerprint(plan: &Arc<LogicalPlan>) -> Result<Fingerprint> {
    let canonical = canonicalize(plan)?;
    Ok(Fingerprint(raw_digest(&canonical)))
}

/// Stable per-node identifier used for deterministic tie-breaking.
pub fn node_id(plan: &Arc<LogicalPlan>) -> u64 {
    u64::from_be_bytes(raw_digest(plan)[..8].try_into().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Value;
    use crate::plan::expr::BinaryOp;
    use crate::plan::node::JoinType;

    fn scan(source: &str, table: &str) -> Arc<LogicalPlan> {
        Arc::new(LogicalPlan::Scan {
            source: source.into(),
            table: table.into(),
            projection: None,
            predicate: None,
        })
    }

    fn filter(input: Arc<LogicalPlan>, predicate: Expr) -> Arc<LogicalPlan> {
        Arc::new(LogicalPlan::Filter { input, predicate })
    }

    #[test]
    fn test_and_commutes() {
        let a = Expr::binary(
            Expr::column("x"),
            BinaryOp::Gt,
            Expr::literal(Value::Integer(1)),
        );
        let b = Expr::binary(
            Expr::column("y"),
            BinaryOp::Lt,
            Expr::literal(Value::Integer(2)),
        );

        let p1 = filter(scan("pg", "t"), Expr::and(a.clone(), b.clone()));
        let p2 = filter(scan("pg", "t"), Expr::and(b, a));
        assert_eq!(fingerprint(&p1).unwrap(), fingerprint(&p2).unwrap());
    }

    #[test]
    fn test_inner_join_child_order_normalized() {
        let cond = Expr::binary(
            Expr::qualified_column("a", "id"),
            BinaryOp::Eq,
            Expr::qualified_column("b", "id"),
        );
        let j1 = Arc::new(LogicalPlan::Join {
            left: scan("pg", "a"),
            right: scan("pg", "b"),
            join_type: JoinType::Inner,
            condition: cond.clone(),
            hint: None,
        });
        let j2 = Arc::new(LogicalPlan::Join {
            left: scan("pg", "b"),
            right: scan("pg", "a"),
            join_type: JoinType::Inner,
            condition: cond,
            hint: None,
        });
        assert_eq!(fingerprint(&j1).unwrap(), fingerprint(&j2).unwrap());
    }

    #[test]
    fn test_left_join_child_order_preserved() {
        let cond = Expr::literal(Value::Boolean(true));
        let j1 = Arc::new(LogicalPlan::Join {
            left: scan("pg", "a"),
            right: scan("pg", "b"),
            join_type: JoinType::Left,
            condition: cond.clone(),
            hint: None,
        });
        let j2 = Arc::new(LogicalPlan::Join {
            left: scan("pg", "b"),
            right: scan("pg", "a"),
            join_type: JoinType::Left,
            condition: cond,
            hint: None,
        });
        assert_ne!(fingerprint(&j1).unwrap(), fingerprint(&j2).unwrap());
    }

    #[test]
    fn test_canonicalize_idempotent() {
        let pred = Expr::and(
            Expr::binary(
                Expr::column("b"),
                BinaryOp::Eq,
                Expr::literal(Value::Integer(2)),
            ),
            Expr::binary(
                Expr::column("a"),
                BinaryOp::Eq,
                Expr::literal(Value::Integer(1)),
            ),
        );
        let plan = filter(scan("pg", "t"), pred);
        let once = canonicalize(&plan).unwrap();
        let twice = canonicalize(&once).unwrap();
        assert_eq!(once, twice);
        assert_eq!(fingerprint(&once).unwrap(), fingerprint(&twice).unwrap());
    }

    #[test]
    fn test_different_plans_differ() {
        let p1 = scan("pg", "a");
        let p2 = scan("pg", "b");
        assert_ne!(fingerprint(&p1).unwrap(), fingerprint(&p2).unwrap());
    }
}

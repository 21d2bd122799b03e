// Logical plan nodes.
//
// Plan trees are immutable after construction. Children are held behind `Arc`
// so rewrites share unchanged subtrees instead of cloning them.

use crate::common::{Column, ColumnType, Schema, TableRef};
use crate::error::{EngineError, Result};
use crate::plan::expr::{AggExpr, Expr, SortKey, WindowExpr, WindowFrame};
use serde::{Deserialize, Serialize};
use std::fmt::Write as FmtWrite;
use std::sync::Arc;

/// Join variants. Semi and anti joins emit left-side rows only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Semi,
    Anti,
}

impl JoinType {
    pub fn preserves_left(&self) -> bool {
        matches!(self, JoinType::Left | JoinType::Full)
    }

    pub fn preserves_right(&self) -> bool {
        matches!(self, JoinType::Right | JoinType::Full)
    }

    /// Swapping inputs yields the same multiset (modulo column order).
    pub fn is_commutative(&self) -> bool {
        matches!(self, JoinType::Inner | JoinType::Full)
    }
}

/// Planner hint for the physical join algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinHint {
    Broadcast,
    Partitioned,
    SortMerge,
    Index,
}

/// Source schemas consulted when computing plan output schemas.
pub trait TableSchemas {
    fn table_schema(&self, source: &str, table: &str) -> Result<Schema>;
}

/// A logical plan node. Construction happens in the parser and rewrites;
/// nothing mutates a node afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogicalPlan {
    Scan {
        source: String,
        table: String,
        projection: Option<Vec<String>>,
        predicate: Option<Expr>,
    },
    Filter {
        input: Arc<LogicalPlan>,
        predicate: Expr,
    },
    Project {
        input: Arc<LogicalPlan>,
        exprs: Vec<(Expr, String)>,
    },
    Join {
        left: Arc<LogicalPlan>,
        right: Arc<LogicalPlan>,
        join_type: JoinType,
        condition: Expr,
        hint: Option<JoinHint>,
    },
    Aggregate {
        input: Arc<LogicalPlan>,
        group_keys: Vec<Expr>,
        aggregates: Vec<AggExpr>,
    },
    Window {
        input: Arc<LogicalPlan>,
        partition_keys: Vec<Expr>,
        order_keys: Vec<SortKey>,
        frame: WindowFrame,
        functions: Vec<WindowExpr>,
    },
    Sort {
        input: Arc<LogicalPlan>,
        keys: Vec<SortKey>,
    },
    Limit {
        input: Arc<LogicalPlan>,
        limit: Option<usize>,
        offset: usize,
    },
    Union {
        inputs: Vec<Arc<LogicalPlan>>,
        all: bool,
    },
    /// A subtree dispatched wholesale to one source adapter.
    Federated {
        source: String,
        inner: Arc<LogicalPlan>,
        dependencies: Vec<TableRef>,
    },
    /// Forward-compatibility catch-all. Planning rejects it with a clear
    /// error instead of panicking on an unknown shape.
    Unsupported { description: String },
}

impl LogicalPlan {
    pub fn name(&self) -> &'static str {
        match self {
            LogicalPlan::Scan { .. } => "Scan",
            LogicalPlan::Filter { .. } => "Filter",
            LogicalPlan::Project { .. } => "Project",
            LogicalPlan::Join { .. } => "Join",
            LogicalPlan::Aggregate { .. } => "Aggregate",
            LogicalPlan::Window { .. } => "Window",
            LogicalPlan::Sort { .. } => "Sort",
            LogicalPlan::Limit { .. } => "Limit",
            LogicalPlan::Union { .. } => "Union",
            LogicalPlan::Federated { .. } => "Federated",
            LogicalPlan::Unsupported { .. } => "Unsupported",
        }
    }

    pub fn children(&self) -> Vec<&Arc<LogicalPlan>> {
        match self {
            LogicalPlan::Scan { .. } | LogicalPlan::Unsupported { .. } => vec![],
            LogicalPlan::Filter { input, .. }
            | LogicalPlan::Project { input, .. }
            | LogicalPlan::Aggregate { input, .. }
            | LogicalPlan::Window { input, .. }
            | LogicalPlan::Sort { input, .. }
            | LogicalPlan::Limit { input, .. } => vec![input],
            LogicalPlan::Join { left, right, .. } => vec![left, right],
            LogicalPlan::Union { inputs, .. } => inputs.iter().collect(),
            LogicalPlan::Federated { inner, .. } => vec![inner],
        }
    }

    /// Rebuild this node with new children, preserving all other attributes.
    pub fn with_children(&self, mut children: Vec<Arc<LogicalPlan>>) -> Result<LogicalPlan> {
        let expected = self.children().len();
        if children.len() != expected {
            return Err(EngineError::Internal(format!(
                "{} expects {} children, got {}",
                self.name(),
                expected,
                children.len()
            )));
        }
        Ok(match self {
            LogicalPlan::Scan { .. } | LogicalPlan::Unsupported { .. } => self.clone(),
            LogicalPlan::Filter { predicate, .. } => LogicalPlan::Filter {
                input: children.remove(0),
                predicate: predicate.clone(),
            },
            LogicalPlan::Project { exprs, .. } => LogicalPlan::Project {
                input: children.remove(0),
                exprs: exprs.clone(),
            },
            LogicalPlan::Join {
                join_type,
                condition,
                hint,
                ..
            } => LogicalPlan::Join {
                left: children.remove(0),
                right: children.remove(0),
                join_type: *join_type,
                condition: condition.clone(),
                hint: *hint,
            },
            LogicalPlan::Aggregate {
                group_keys,
                aggregates,
                ..
            } => LogicalPlan::Aggregate {
                input: children.remove(0),
                group_keys: group_keys.clone(),
                aggregates: aggregates.clone(),
            },
            LogicalPlan::Window {
                partition_keys,
                order_keys,
                frame,
                functions,
                ..
            } => LogicalPlan::Window {
                input: children.remove(0),
                partition_keys: partition_keys.clone(),
                order_keys: order_keys.clone(),
                frame: *frame,
                functions: functions.clone(),
            },
            LogicalPlan::Sort { keys, .. } => LogicalPlan::Sort {
                input: children.remove(0),
                keys: keys.clone(),
            },
            LogicalPlan::Limit { limit, offset, .. } => LogicalPlan::Limit {
                input: children.remove(0),
                limit: *limit,
                offset: *offset,
            },
            LogicalPlan::Union { all, .. } => LogicalPlan::Union {
                inputs: std::mem::take(&mut children),
                all: *all,
            },
            LogicalPlan::Federated {
                source,
                dependencies,
                ..
            } => LogicalPlan::Federated {
                source: source.clone(),
                inner: children.remove(0),
                dependencies: dependencies.clone(),
            },
        })
    }

    /// Pre-order visit of every node.
    pub fn traverse(&self, visitor: &mut dyn FnMut(&LogicalPlan)) {
        visitor(self);
        for child in self.children() {
            child.traverse(visitor);
        }
    }

    /// Bottom-up rewrite. Unchanged subtrees are shared (`Arc::ptr_eq`), not
    /// copied; the rewriter sees each node after its children were rewritten.
    pub fn transform_up(
        self: &Arc<Self>,
        rewriter: &dyn Fn(Arc<LogicalPlan>) -> Result<Arc<LogicalPlan>>,
    ) -> Result<Arc<LogicalPlan>> {
        let old_children = self.children();
        let mut new_children = Vec::with_capacity(old_children.len());
        let mut changed = false;
        for child in &old_children {
            let rewritten = child.transform_up(rewriter)?;
            if !Arc::ptr_eq(child, &rewritten) {
                changed = true;
            }
            new_children.push(rewritten);
        }
        let node = if changed {
            Arc::new(self.with_children(new_children)?)
        } else {
            Arc::clone(self)
        };
        rewriter(node)
    }

    /// Every base table this plan reads.
    pub fn dependencies(&self) -> Vec<TableRef> {
        let mut out = Vec::new();
        self.traverse(&mut |node| {
            if let LogicalPlan::Scan { source, table, .. } = node {
                let t = TableRef::new(source.clone(), table.clone());
                if !out.contains(&t) {
                    out.push(t);
                }
            }
        });
        out
    }

    /// The single source this subtree touches, if exactly one.
    pub fn single_source(&self) -> Option<String> {
        let deps = self.dependencies();
        let mut sources: Vec<&str> = deps.iter().map(|d| d.source.as_str()).collect();
        sources.dedup();
        match sources.as_slice() {
            [one] => Some(one.to_string()),
            _ => None,
        }
    }

    /// Output schema of this plan. Fails on unresolved columns, which keeps
    /// invariant (iii): every reference resolves to exactly one input column.
    pub fn output_schema(&self, catalog: &dyn TableSchemas) -> Result<Schema> {
        match self {
            LogicalPlan::Scan {
                source,
                table,
                projection,
                ..
            } => {
                let mut schema = catalog.table_schema(source, table)?;
                for col in &mut schema.columns {
                    col.relation = Some(table.clone());
                }
                match projection {
                    Some(names) => {
                        let mut cols = Vec::with_capacity(names.len());
                        for name in names {
                            let idx = schema.index_of(name).ok_or_else(|| {
                                EngineError::Resolution {
                                    name: name.clone(),
                                    candidates: schema.names(),
                                }
                            })?;
                            cols.push(schema.columns[idx].clone());
                        }
                        Ok(Schema::new(cols))
                    }
                    None => Ok(schema),
                }
            }
            LogicalPlan::Filter { input, .. }
            | LogicalPlan::Sort { input, .. }
            | LogicalPlan::Limit { input, .. } => input.output_schema(catalog),
            LogicalPlan::Project { input, exprs } => {
                let input_schema = input.output_schema(catalog)?;
                let mut columns = Vec::with_capacity(exprs.len());
                for (expr, alias) in exprs {
                    // bare column references keep their input column identity
                    if let Expr::Column { relation, name } = expr {
                        let matches = input_schema.resolve(relation.as_deref(), name);
                        if matches.len() == 1 {
                            let mut col = input_schema.columns[matches[0]].clone();
                            col.name = alias.clone();
                            columns.push(col);
                            continue;
                        }
                    }
                    let dt = expr.data_type(&input_schema)?;
                    columns.push(Column::new(alias.clone(), dt, true));
                }
                Ok(Schema::new(columns))
            }
            LogicalPlan::Join {
                left,
                right,
                join_type,
                ..
            } => {
                let ls = left.output_schema(catalog)?;
                match join_type {
                    JoinType::Semi | JoinType::Anti => Ok(ls),
                    _ => {
                        let rs = right.output_schema(catalog)?;
                        Ok(ls.join(&rs))
                    }
                }
            }
            LogicalPlan::Aggregate {
                input,
                group_keys,
                aggregates,
            } => {
                let input_schema = input.output_schema(catalog)?;
                let mut columns = Vec::new();
                for key in group_keys {
                    let dt = key.data_type(&input_schema)?;
                    columns.push(Column::new(key.output_name(), dt, true));
                }
                for agg in aggregates {
                    let dt = agg.output_type(&input_schema)?;
                    columns.push(Column::new(agg.alias.clone(), dt, true));
                }
                Ok(Schema::new(columns))
            }
            LogicalPlan::Window {
                input, functions, ..
            } => {
                let mut schema = input.output_schema(catalog)?;
                for func in functions {
                    // navigation functions carry their argument's type;
                    // ranking functions produce integers
                    let dt = match func.func {
                        crate::plan::expr::WindowFunc::Lead
                        | crate::plan::expr::WindowFunc::Lag
                        | crate::plan::expr::WindowFunc::FirstValue
                        | crate::plan::expr::WindowFunc::LastValue => func
                            .args
                            .first()
                            .map(|a| a.data_type(&schema))
                            .transpose()?
                            .unwrap_or(ColumnType::Int64),
                        _ => ColumnType::Int64,
                    };
                    schema
                        .columns
                        .push(Column::new(func.alias.clone(), dt, true));
                }
                Ok(schema)
            }
            LogicalPlan::Union { inputs, .. } => {
                let first = inputs
                    .first()
                    .ok_or_else(|| EngineError::Internal("empty union".into()))?;
                first.output_schema(catalog)
            }
            LogicalPlan::Federated { inner, .. } => inner.output_schema(catalog),
            LogicalPlan::Unsupported { description } => Err(EngineError::Planning(format!(
                "unsupported plan shape: {}",
                description
            ))),
        }
    }

    /// Indented operator-tree rendering for logs and tests.
    pub fn explain(&self) -> String {
        let mut out = String::new();
        self.explain_into(&mut out, 0);
        out
    }

    fn explain_into(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        let line = match self {
            LogicalPlan::Scan {
                source,
                table,
                projection,
                predicate,
            } => {
                let mut s = format!("Scan: {}.{}", source, table);
                if let Some(p) = projection {
                    let _ = write!(s, " cols=[{}]", p.join(", "));
                }
                if let Some(p) = predicate {
                    let _ = write!(s, " pushed={}", p);
                }
                s
            }
            LogicalPlan::Filter { predicate, .. } => format!("Filter: {}", predicate),
            LogicalPlan::Project { exprs, .. } => format!(
                "Project: {}",
                exprs
                    .iter()
                    .map(|(e, a)| format!("{} AS {}", e, a))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            LogicalPlan::Join {
                join_type,
                condition,
                hint,
                ..
            } => {
                let mut s = format!("Join({:?}): {}", join_type, condition);
                if let Some(h) = hint {
                    let _ = write!(s, " hint={:?}", h);
                }
                s
            }
            LogicalPlan::Aggregate {
                group_keys,
                aggregates,
                ..
            } => format!(
                "Aggregate: keys=[{}] aggs=[{}]",
                group_keys
                    .iter()
                    .map(|k| k.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
                aggregates
                    .iter()
                    .map(|a| a.alias.clone())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            LogicalPlan::Window { functions, .. } => format!(
                "Window: [{}]",
                functions
                    .iter()
                    .map(|w| w.alias.clone())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            LogicalPlan::Sort { keys, .. } => format!(
                "Sort: [{}]",
                keys.iter()
                    .map(|k| k.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            LogicalPlan::Limit { limit, offset, .. } => {
                format!("Limit: {:?} offset={}", limit, offset)
            }
            LogicalPlan::Union { all, .. } => {
                format!("Union{}", if *all { " All" } else { "" })
            }
            LogicalPlan::Federated { source, .. } => format!("Federated: source={}", source),
            LogicalPlan::Unsupported { description } => {
                format!("Unsupported: {}", description)
            }
        };
        out.push_str(&indent);
        out.push_str(&line);
        out.push('\n');
        for child in self.children() {
            child.explain_into(out, depth + 1);
        }
    }
}

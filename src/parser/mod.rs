// # Query Parser
//
// Translates the SQL-like DSL (via sqlparser's GenericDialect) or a JSON AST
// into a logical plan. Performs name resolution against the registered source
// namespaces; type checking beyond arity and operator applicability is a
// separate pass (`LogicalPlan::output_schema`).

use crate::adapter::SourceRegistry;
use crate::common::{Schema, TableRef, Value};
use crate::error::{EngineError, Result};
use crate::plan::{
    AggExpr, AggFunc, BinaryOp, Expr, JoinType, LogicalPlan, SortKey, UnaryOp, WindowExpr,
    WindowFrame, WindowFunc,
};
use sqlparser::ast as sql;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::HashMap;
use std::sync::Arc;

/// Aggregate function names recognised in SELECT/HAVING.
const AGGREGATE_FUNCTIONS: &[&str] = &[
    "sum",
    "avg",
    "min",
    "max",
    "count",
    "stddev",
    "variance",
    "median",
    "percentile",
    "mode",
    "corr",
    "moving_avg",
];

const WINDOW_FUNCTIONS: &[&str] = &[
    "row_number",
    "rank",
    "dense_rank",
    "lead",
    "lag",
    "first_value",
    "last_value",
    "ntile",
];

pub struct QueryParser {
    registry: Arc<SourceRegistry>,
}

/// One visible FROM relation: the name it is referenced by, the relation tag
/// its columns carry at runtime, and its schema.
struct ScopeRelation {
    visible_name: String,
    runtime_tag: Option<String>,
    schema: Schema,
}

/// Name-resolution scope for one query level.
struct Scope {
    relations: Vec<ScopeRelation>,
}

impl Scope {
    fn new() -> Self {
        Self {
            relations: Vec::new(),
        }
    }

    fn combined_schema(&self) -> Schema {
        let mut columns = Vec::new();
        for rel in &self.relations {
            for col in &rel.schema.columns {
                let mut c = col.clone();
                c.relation = rel.runtime_tag.clone();
                columns.push(c);
            }
        }
        Schema::new(columns)
    }

    fn relation(&self, visible: &str) -> Option<&ScopeRelation> {
        self.relations.iter().find(|r| r.visible_name == visible)
    }
}

impl QueryParser {
    pub fn new(registry: Arc<SourceRegistry>) -> Self {
        Self { registry }
    }

    /// Parse SQL text into a logical plan.
    pub fn parse(&self, query: &str) -> Result<Arc<LogicalPlan>> {
        let statements = Parser::parse_sql(&GenericDialect {}, query)
            .map_err(|e| parse_error(&e.to_string()))?;
        let statement = match statements.as_slice() {
            [one] => one,
            [] => {
                return Err(parse_error("empty statement"));
            }
            _ => {
                return Err(EngineError::Validation(
                    "exactly one statement per submission".into(),
                ))
            }
        };
        match statement {
            sql::Statement::Query(q) => {
                let mut ctes = HashMap::new();
                self.plan_query(q, &mut ctes)
            }
            other => Err(EngineError::Validation(format!(
                "only queries are accepted, got {}",
                statement_kind(other)
            ))),
        }
    }

    /// Parse the JSON AST form: the serde representation of `LogicalPlan`.
    /// The plan is validated (schema computed) before being returned.
    pub fn parse_json(&self, ast: &serde_json::Value) -> Result<Arc<LogicalPlan>> {
        let plan: LogicalPlan = serde_json::from_value(ast.clone())?;
        let plan = Arc::new(plan);
        plan.output_schema(self.registry.as_ref())?;
        Ok(plan)
    }

    /// Render a plan into the JSON AST form. `parse_json(print(p)) == p`.
    pub fn print(&self, plan: &LogicalPlan) -> Result<serde_json::Value> {
        serde_json::to_value(plan).map_err(EngineError::from)
    }

    // ------------------------------------------------------------------
    // Query / set-expression planning
    // ------------------------------------------------------------------

    fn plan_query(
        &self,
        query: &sql::Query,
        ctes: &mut HashMap<String, (Arc<LogicalPlan>, Schema)>,
    ) -> Result<Arc<LogicalPlan>> {
        if let Some(with) = &query.with {
            if with.recursive {
                return Err(EngineError::Validation(
                    "recursive CTEs are not supported".into(),
                ));
            }
            for cte in &with.cte_tables {
                let plan = self.plan_query(&cte.query, ctes)?;
                let schema = plan.output_schema(self.registry.as_ref())?;
                ctes.insert(cte.alias.name.value.clone(), (plan, schema));
            }
        }

        let mut plan = self.plan_set_expr(&query.body, ctes)?;

        if let Some(order_by) = &query.order_by {
            match self.plan_order_by(order_by, &plan) {
                Ok(keys) => {
                    if !keys.is_empty() {
                        plan = Arc::new(LogicalPlan::Sort { input: plan, keys });
                    }
                }
                // ORDER BY may reference columns the projection dropped; in
                // that case the sort goes below the projection
                Err(EngineError::Resolution { .. }) => {
                    let LogicalPlan::Project { input, exprs } = plan.as_ref() else {
                        return self.plan_order_by(order_by, &plan).map(|_| plan);
                    };
                    let keys = self.plan_order_by(order_by, input)?;
                    plan = Arc::new(LogicalPlan::Project {
                        input: Arc::new(LogicalPlan::Sort {
                            input: Arc::clone(input),
                            keys,
                        }),
                        exprs: exprs.clone(),
                    });
                }
                Err(other) => return Err(other),
            }
        }

        if let Some(limit_clause) = &query.limit_clause {
            plan = self.plan_limit(limit_clause, plan)?;
        }

        Ok(plan)
    }

    fn plan_set_expr(
        &self,
        body: &sql::SetExpr,
        ctes: &mut HashMap<String, (Arc<LogicalPlan>, Schema)>,
    ) -> Result<Arc<LogicalPlan>> {
        match body {
            sql::SetExpr::Select(select) => self.plan_select(select, ctes),
            sql::SetExpr::Query(q) => self.plan_query(q, ctes),
            sql::SetExpr::SetOperation {
                op: sql::SetOperator::Union,
                set_quantifier,
                left,
                right,
            } => {
                let l = self.plan_set_expr(left, ctes)?;
                let r = self.plan_set_expr(right, ctes)?;
                let ls = l.output_schema(self.registry.as_ref())?;
                let rs = r.output_schema(self.registry.as_ref())?;
                if ls.len() != rs.len() {
                    return Err(EngineError::Validation(format!(
                        "UNION arms have {} and {} columns",
                        ls.len(),
                        rs.len()
                    )));
                }
                let all = matches!(set_quantifier, sql::SetQuantifier::All);
                Ok(Arc::new(LogicalPlan::Union {
                    inputs: vec![l, r],
                    all,
                }))
            }
            sql::SetExpr::SetOperation { op, .. } => Err(EngineError::Validation(format!(
                "{:?} is not supported",
                op
            ))),
            other => Err(EngineError::Validation(format!(
                "unsupported query body: {}",
                other
            ))),
        }
    }

    fn plan_select(
        &self,
        select: &sql::Select,
        ctes: &mut HashMap<String, (Arc<LogicalPlan>, Schema)>,
    ) -> Result<Arc<LogicalPlan>> {
        if select.from.is_empty() {
            return Err(EngineError::Validation(
                "queries without FROM are not supported".into(),
            ));
        }

        // FROM and JOINs
        let mut scope = Scope::new();
        let mut plan: Option<Arc<LogicalPlan>> = None;
        for table_with_joins in &select.from {
            let base = self.plan_table_factor(&table_with_joins.relation, &mut scope, ctes)?;
            let mut current = base;
            for join in &table_with_joins.joins {
                let right = self.plan_table_factor(&join.relation, &mut scope, ctes)?;
                let (join_type, constraint) = translate_join_operator(&join.join_operator)?;
                let condition = match constraint {
                    Some(sql::JoinConstraint::On(expr)) => {
                        self.translate_expr(&expr, &scope)?
                    }
                    Some(sql::JoinConstraint::Using(cols)) => {
                        // qualify both sides so the references stay unambiguous
                        let n = scope.relations.len();
                        let (left_rel, right_rel) = (&scope.relations[n - 2], &scope.relations[n - 1]);
                        let mut preds = Vec::new();
                        for col in cols {
                            let name = col.to_string();
                            preds.push(Expr::binary(
                                Expr::Column {
                                    relation: left_rel.runtime_tag.clone(),
                                    name: name.clone(),
                                },
                                BinaryOp::Eq,
                                Expr::Column {
                                    relation: right_rel.runtime_tag.clone(),
                                    name,
                                },
                            ));
                        }
                        Expr::conjunction(preds)
                            .ok_or_else(|| parse_error("USING with no columns"))?
                    }
                    Some(sql::JoinConstraint::None) | None => Expr::literal(Value::Boolean(true)),
                    Some(other) => {
                        return Err(EngineError::Validation(format!(
                            "unsupported join constraint: {:?}",
                            other
                        )))
                    }
                };
                current = Arc::new(LogicalPlan::Join {
                    left: current,
                    right,
                    join_type,
                    condition,
                    hint: None,
                });
            }
            plan = Some(match plan {
                None => current,
                // comma-separated FROM items are a cross join
                Some(left) => Arc::new(LogicalPlan::Join {
                    left,
                    right: current,
                    join_type: JoinType::Inner,
                    condition: Expr::literal(Value::Boolean(true)),
                    hint: None,
                }),
            });
        }
        let mut plan = plan.expect("FROM checked non-empty");

        // WHERE
        if let Some(selection) = &select.selection {
            let predicate = self.translate_expr(selection, &scope)?;
            plan = Arc::new(LogicalPlan::Filter {
                input: plan,
                predicate,
            });
        }

        // SELECT items and aggregate extraction
        let scope_schema = scope.combined_schema();
        let mut select_exprs: Vec<(Expr, String)> = Vec::new();
        for item in &select.projection {
            match item {
                sql::SelectItem::UnnamedExpr(e) => {
                    let expr = self.translate_expr(e, &scope)?;
                    let name = expr.output_name();
                    select_exprs.push((expr, name));
                }
                sql::SelectItem::ExprWithAlias { expr, alias } => {
                    let expr = self.translate_expr(expr, &scope)?;
                    select_exprs.push((expr, alias.value.clone()));
                }
                sql::SelectItem::Wildcard(_) => {
                    for col in &scope_schema.columns {
                        select_exprs.push((
                            Expr::Column {
                                relation: col.relation.clone(),
                                name: col.name.clone(),
                            },
                            col.name.clone(),
                        ));
                    }
                }
                sql::SelectItem::QualifiedWildcard(kind, _) => {
                    let qualifier = kind.to_string();
                    let rel = scope.relation(&qualifier).ok_or_else(|| {
                        EngineError::Resolution {
                            name: qualifier.clone(),
                            candidates: scope
                                .relations
                                .iter()
                                .map(|r| r.visible_name.clone())
                                .collect(),
                        }
                    })?;
                    let tag = rel.runtime_tag.clone();
                    for col in &rel.schema.columns {
                        select_exprs.push((
                            Expr::Column {
                                relation: tag.clone(),
                                name: col.name.clone(),
                            },
                            col.name.clone(),
                        ));
                    }
                }
            }
        }

        // GROUP BY keys
        let group_keys: Vec<Expr> = match &select.group_by {
            sql::GroupByExpr::Expressions(exprs, _) => exprs
                .iter()
                .map(|e| self.translate_expr(e, &scope))
                .collect::<Result<_>>()?,
            other => {
                return Err(EngineError::Validation(format!(
                    "unsupported GROUP BY form: {:?}",
                    other
                )))
            }
        };

        // Pull aggregate calls out of SELECT and HAVING
        let mut aggregates: Vec<AggExpr> = Vec::new();
        let mut rewritten_select = Vec::with_capacity(select_exprs.len());
        for (expr, alias) in select_exprs {
            let rewritten = extract_aggregates(&expr, &mut aggregates)?;
            rewritten_select.push((rewritten, alias));
        }
        let having = match &select.having {
            Some(h) => {
                let translated = self.translate_expr(h, &scope)?;
                Some(extract_aggregates(&translated, &mut aggregates)?)
            }
            None => None,
        };

        if !aggregates.is_empty() || !group_keys.is_empty() {
            // Replace select expressions that repeat a grouping key with a
            // reference to the aggregate output column (invariant: only group
            // keys and aggregate outputs are visible above an aggregation).
            let key_names: Vec<String> = group_keys.iter().map(|k| k.output_name()).collect();
            rewritten_select = rewritten_select
                .into_iter()
                .map(|(expr, alias)| {
                    for (key, key_name) in group_keys.iter().zip(&key_names) {
                        if expr == *key {
                            return (Expr::column(key_name.clone()), alias);
                        }
                    }
                    (expr, alias)
                })
                .collect();
            plan = Arc::new(LogicalPlan::Aggregate {
                input: plan,
                group_keys,
                aggregates,
            });
            if let Some(h) = having {
                plan = Arc::new(LogicalPlan::Filter {
                    input: plan,
                    predicate: h,
                });
            }
        } else if select.having.is_some() {
            return Err(EngineError::Validation(
                "HAVING requires GROUP BY or aggregates".into(),
            ));
        }

        // Window functions
        let (rewritten_select, window_nodes) = self.extract_windows(rewritten_select, &scope)?;
        for (partition_keys, order_keys, functions) in window_nodes {
            plan = Arc::new(LogicalPlan::Window {
                input: plan,
                partition_keys,
                order_keys,
                frame: WindowFrame::default(),
                functions,
            });
        }

        // Final projection
        plan = Arc::new(LogicalPlan::Project {
            input: plan,
            exprs: rewritten_select,
        });

        // SELECT DISTINCT folds into a grouped aggregation over the output
        if select.distinct.is_some() {
            let schema = plan.output_schema(self.registry.as_ref())?;
            let group_keys = schema
                .columns
                .iter()
                .map(|c| Expr::column(c.name.clone()))
                .collect();
            plan = Arc::new(LogicalPlan::Aggregate {
                input: plan,
                group_keys,
                aggregates: Vec::new(),
            });
        }

        // Validate: every reference must resolve against the final tree
        plan.output_schema(self.registry.as_ref())?;
        Ok(plan)
    }

    fn plan_table_factor(
        &self,
        factor: &sql::TableFactor,
        scope: &mut Scope,
        ctes: &mut HashMap<String, (Arc<LogicalPlan>, Schema)>,
    ) -> Result<Arc<LogicalPlan>> {
        match factor {
            sql::TableFactor::Table { name, alias, .. } => {
                let full = name.to_string();
                // CTE reference?
                if let Some((plan, schema)) = ctes.get(&full) {
                    let visible = alias
                        .as_ref()
                        .map(|a| a.name.value.clone())
                        .unwrap_or_else(|| full.clone());
                    scope.relations.push(ScopeRelation {
                        visible_name: visible,
                        runtime_tag: None,
                        schema: schema.clone(),
                    });
                    return Ok(Arc::clone(plan));
                }
                let table_ref = self.resolve_table(&full)?;
                let schema = self.registry.schema_of(&table_ref.source, &table_ref.table)?;
                let visible = alias
                    .as_ref()
                    .map(|a| a.name.value.clone())
                    .unwrap_or_else(|| table_ref.table.clone());
                scope.relations.push(ScopeRelation {
                    visible_name: visible,
                    runtime_tag: Some(table_ref.table.clone()),
                    schema,
                });
                Ok(Arc::new(LogicalPlan::Scan {
                    source: table_ref.source,
                    table: table_ref.table,
                    projection: None,
                    predicate: None,
                }))
            }
            sql::TableFactor::Derived {
                subquery, alias, ..
            } => {
                let alias = alias.as_ref().ok_or_else(|| {
                    EngineError::Validation("derived tables require an alias".into())
                })?;
                let plan = self.plan_query(subquery, ctes)?;
                let schema = plan.output_schema(self.registry.as_ref())?;
                scope.relations.push(ScopeRelation {
                    visible_name: alias.name.value.clone(),
                    runtime_tag: None,
                    schema,
                });
                Ok(plan)
            }
            other => Err(EngineError::Validation(format!(
                "unsupported FROM item: {}",
                other
            ))),
        }
    }

    /// Resolve a possibly-qualified table name against registered sources.
    fn resolve_table(&self, name: &str) -> Result<TableRef> {
        let parsed = TableRef::parse(name);
        if !parsed.source.is_empty() {
            // qualified: the source must exist
            if !self.registry.sources().contains(&parsed.source) {
                return Err(EngineError::Resolution {
                    name: name.to_string(),
                    candidates: self.registry.sources(),
                });
            }
            return Ok(parsed);
        }
        // bare table name: search every source namespace
        let matches: Vec<TableRef> = self
            .registry
            .all_tables()
            .into_iter()
            .filter(|t| t.table == parsed.table)
            .collect();
        match matches.as_slice() {
            [one] => Ok(one.clone()),
            [] => Err(EngineError::Resolution {
                name: name.to_string(),
                candidates: self
                    .registry
                    .all_tables()
                    .iter()
                    .map(|t| t.to_string())
                    .collect(),
            }),
            many => Err(EngineError::Resolution {
                name: name.to_string(),
                candidates: many.iter().map(|t| t.to_string()).collect(),
            }),
        }
    }

    fn plan_order_by(
        &self,
        order_by: &sql::OrderBy,
        plan: &Arc<LogicalPlan>,
    ) -> Result<Vec<SortKey>> {
        let exprs = match &order_by.kind {
            sql::OrderByKind::Expressions(exprs) => exprs,
            other => {
                return Err(EngineError::Validation(format!(
                    "unsupported ORDER BY form: {:?}",
                    other
                )))
            }
        };
        let schema = plan.output_schema(self.registry.as_ref())?;
        let scope = Scope {
            relations: vec![ScopeRelation {
                visible_name: String::new(),
                runtime_tag: None,
                schema,
            }],
        };
        let mut keys = Vec::with_capacity(exprs.len());
        for item in exprs {
            let expr = self.translate_expr(&item.expr, &scope)?;
            let ascending = item.options.asc.unwrap_or(true);
            let nulls_first = item.options.nulls_first.unwrap_or(ascending);
            keys.push(SortKey {
                expr,
                ascending,
                nulls_first,
            });
        }
        Ok(keys)
    }

    fn plan_limit(
        &self,
        clause: &sql::LimitClause,
        input: Arc<LogicalPlan>,
    ) -> Result<Arc<LogicalPlan>> {
        match clause {
            sql::LimitClause::LimitOffset { limit, offset, .. } => {
                let n = match limit {
                    Some(e) => Some(literal_usize(e, "LIMIT")?),
                    None => None,
                };
                let offset = match offset {
                    Some(o) => literal_usize(&o.value, "OFFSET")?,
                    None => 0,
                };
                Ok(Arc::new(LogicalPlan::Limit {
                    input,
                    limit: n,
                    offset,
                }))
            }
            other => Err(EngineError::Validation(format!(
                "unsupported LIMIT form: {:?}",
                other
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Window extraction
    // ------------------------------------------------------------------

    /// Pull `func() OVER (...)` calls out of select expressions. Returns the
    /// rewritten select list plus one Window node spec per distinct
    /// (partition, order) pair.
    #[allow(clippy::type_complexity)]
    fn extract_windows(
        &self,
        select_exprs: Vec<(Expr, String)>,
        _scope: &Scope,
    ) -> Result<(
        Vec<(Expr, String)>,
        Vec<(Vec<Expr>, Vec<SortKey>, Vec<WindowExpr>)>,
    )> {
        // Window calls were already translated into Expr::Call with a
        // reserved "<name> over <spec-json>" encoding by translate_expr; see
        // WindowCallPlaceholder below.
        let mut specs: Vec<(Vec<Expr>, Vec<SortKey>, Vec<WindowExpr>)> = Vec::new();
        let mut rewritten = Vec::with_capacity(select_exprs.len());
        for (expr, alias) in select_exprs {
            match take_window_placeholder(&expr) {
                Some((func, args, partition, order)) => {
                    let wexpr = WindowExpr {
                        func,
                        args,
                        alias: alias.clone(),
                    };
                    match specs
                        .iter_mut()
                        .find(|(p, o, _)| *p == partition && *o == order)
                    {
                        Some((_, _, funcs)) => funcs.push(wexpr),
                        None => specs.push((partition, order, vec![wexpr])),
                    }
                    rewritten.push((Expr::column(alias.clone()), alias));
                }
                None => rewritten.push((expr, alias)),
            }
        }
        Ok((rewritten, specs))
    }

    // ------------------------------------------------------------------
    // Expression translation
    // ------------------------------------------------------------------

    fn translate_expr(&self, expr: &sql::Expr, scope: &Scope) -> Result<Expr> {
        let schema = scope.combined_schema();
        let translated = self.translate_expr_inner(expr, scope)?;
        resolve_columns(&translated, &schema)?;
        Ok(translated)
    }

    fn translate_expr_inner(&self, expr: &sql::Expr, scope: &Scope) -> Result<Expr> {
        match expr {
            sql::Expr::Identifier(ident) => Ok(Expr::column(ident.value.clone())),
            sql::Expr::CompoundIdentifier(parts) => {
                let names: Vec<String> = parts.iter().map(|i| i.value.clone()).collect();
                match names.as_slice() {
                    [qualifier, column] => {
                        let rel = scope.relation(qualifier).ok_or_else(|| {
                            EngineError::Resolution {
                                name: format!("{}.{}", qualifier, column),
                                candidates: scope
                                    .relations
                                    .iter()
                                    .map(|r| r.visible_name.clone())
                                    .collect(),
                            }
                        })?;
                        Ok(Expr::Column {
                            relation: rel.runtime_tag.clone(),
                            name: column.clone(),
                        })
                    }
                    _ => Err(EngineError::Validation(format!(
                        "unsupported identifier: {}",
                        names.join(".")
                    ))),
                }
            }
            sql::Expr::Value(v) => translate_value(&v.value),
            sql::Expr::BinaryOp { left, op, right } => {
                let l = self.translate_expr_inner(left, scope)?;
                let r = self.translate_expr_inner(right, scope)?;
                let op = translate_binary_op(op)?;
                Ok(Expr::binary(l, op, r))
            }
            sql::Expr::UnaryOp { op, expr } => {
                let inner = self.translate_expr_inner(expr, scope)?;
                match op {
                    sql::UnaryOperator::Plus => Ok(inner),
                    sql::UnaryOperator::Minus => Ok(Expr::UnaryOp {
                        op: UnaryOp::Negate,
                        expr: Box::new(inner),
                    }),
                    sql::UnaryOperator::Not => Ok(Expr::UnaryOp {
                        op: UnaryOp::Not,
                        expr: Box::new(inner),
                    }),
                    other => Err(EngineError::Validation(format!(
                        "unsupported unary operator: {}",
                        other
                    ))),
                }
            }
            sql::Expr::Nested(inner) => self.translate_expr_inner(inner, scope),
            sql::Expr::IsNull(inner) => Ok(Expr::UnaryOp {
                op: UnaryOp::IsNull,
                expr: Box::new(self.translate_expr_inner(inner, scope)?),
            }),
            sql::Expr::IsNotNull(inner) => Ok(Expr::UnaryOp {
                op: UnaryOp::IsNotNull,
                expr: Box::new(self.translate_expr_inner(inner, scope)?),
            }),
            sql::Expr::Between {
                expr,
                negated,
                low,
                high,
            } => {
                let e = self.translate_expr_inner(expr, scope)?;
                let low = self.translate_expr_inner(low, scope)?;
                let high = self.translate_expr_inner(high, scope)?;
                let range = Expr::and(
                    Expr::binary(e.clone(), BinaryOp::GtEq, low),
                    Expr::binary(e, BinaryOp::LtEq, high),
                );
                Ok(if *negated {
                    Expr::UnaryOp {
                        op: UnaryOp::Not,
                        expr: Box::new(range),
                    }
                } else {
                    range
                })
            }
            sql::Expr::InList {
                expr,
                list,
                negated,
            } => {
                let e = self.translate_expr_inner(expr, scope)?;
                let mut disjuncts = Vec::with_capacity(list.len());
                for item in list {
                    let v = self.translate_expr_inner(item, scope)?;
                    disjuncts.push(Expr::binary(e.clone(), BinaryOp::Eq, v));
                }
                let mut iter = disjuncts.into_iter();
                let first = iter
                    .next()
                    .ok_or_else(|| parse_error("IN list must not be empty"))?;
                let combined = iter.fold(first, |acc, d| Expr::binary(acc, BinaryOp::Or, d));
                Ok(if *negated {
                    Expr::UnaryOp {
                        op: UnaryOp::Not,
                        expr: Box::new(combined),
                    }
                } else {
                    combined
                })
            }
            sql::Expr::Like {
                negated,
                expr,
                pattern,
                ..
            } => {
                let e = self.translate_expr_inner(expr, scope)?;
                let p = self.translate_expr_inner(pattern, scope)?;
                let like = Expr::binary(e, BinaryOp::Like, p);
                Ok(if *negated {
                    Expr::UnaryOp {
                        op: UnaryOp::Not,
                        expr: Box::new(like),
                    }
                } else {
                    like
                })
            }
            sql::Expr::Case {
                operand,
                conditions,
                else_result,
                ..
            } => {
                let operand = match operand {
                    Some(op) => Some(Box::new(self.translate_expr_inner(op, scope)?)),
                    None => None,
                };
                let mut branches = Vec::with_capacity(conditions.len());
                for case_when in conditions {
                    branches.push((
                        self.translate_expr_inner(&case_when.condition, scope)?,
                        self.translate_expr_inner(&case_when.result, scope)?,
                    ));
                }
                let else_expr = match else_result {
                    Some(e) => Some(Box::new(self.translate_expr_inner(e, scope)?)),
                    None => None,
                };
                Ok(Expr::Case {
                    operand,
                    branches,
                    else_expr,
                })
            }
            sql::Expr::Cast {
                expr, data_type, ..
            } => Ok(Expr::Cast {
                expr: Box::new(self.translate_expr_inner(expr, scope)?),
                to: crate::adapter::normalize_native_type(&data_type.to_string()),
            }),
            sql::Expr::Function(func) => self.translate_function(func, scope),
            sql::Expr::Array(array) => {
                let mut floats = Vec::with_capacity(array.elem.len());
                for e in &array.elem {
                    match self.translate_expr_inner(e, scope)? {
                        Expr::Literal(Value::Float(f)) => floats.push(f as f32),
                        Expr::Literal(Value::Integer(i)) => floats.push(i as f32),
                        other => {
                            return Err(EngineError::Validation(format!(
                                "array literals must be numeric, got {}",
                                other
                            )))
                        }
                    }
                }
                Ok(Expr::literal(Value::Vector(floats)))
            }
            other => Err(EngineError::Validation(format!(
                "unsupported expression: {}",
                other
            ))),
        }
    }

    fn translate_function(&self, func: &sql::Function, scope: &Scope) -> Result<Expr> {
        let name = func.name.to_string().to_lowercase();
        let (args, distinct, saw_wildcard) = self.translate_function_args(func, scope)?;

        if let Some(over) = &func.over {
            let wfunc = match name.as_str() {
                "row_number" => WindowFunc::RowNumber,
                "rank" => WindowFunc::Rank,
                "dense_rank" => WindowFunc::DenseRank,
                "lead" => WindowFunc::Lead,
                "lag" => WindowFunc::Lag,
                "first_value" => WindowFunc::FirstValue,
                "last_value" => WindowFunc::LastValue,
                "ntile" => WindowFunc::Ntile,
                other => {
                    return Err(EngineError::Validation(format!(
                        "unknown window function '{}'",
                        other
                    )))
                }
            };
            let spec = match over {
                sql::WindowType::WindowSpec(spec) => spec,
                sql::WindowType::NamedWindow(n) => {
                    return Err(EngineError::Validation(format!(
                        "named windows are not supported: {}",
                        n
                    )))
                }
            };
            let partition = spec
                .partition_by
                .iter()
                .map(|e| self.translate_expr_inner(e, scope))
                .collect::<Result<Vec<_>>>()?;
            let mut order = Vec::with_capacity(spec.order_by.len());
            for item in &spec.order_by {
                let expr = self.translate_expr_inner(&item.expr, scope)?;
                let ascending = item.options.asc.unwrap_or(true);
                order.push(SortKey {
                    expr,
                    ascending,
                    nulls_first: item.options.nulls_first.unwrap_or(ascending),
                });
            }
            return Ok(make_window_placeholder(wfunc, args, partition, order));
        }

        if AGGREGATE_FUNCTIONS.contains(&name.as_str()) {
            return make_aggregate_call(&name, args, distinct, saw_wildcard);
        }
        if WINDOW_FUNCTIONS.contains(&name.as_str()) {
            return Err(EngineError::Validation(format!(
                "{} requires an OVER clause",
                name
            )));
        }
        crate::plan::expr::check_call_arity(&name, args.len())?;
        Ok(Expr::Call { func: name, args })
    }

    fn translate_function_args(
        &self,
        func: &sql::Function,
        scope: &Scope,
    ) -> Result<(Vec<Expr>, bool, bool)> {
        match &func.args {
            sql::FunctionArguments::None => Ok((Vec::new(), false, false)),
            sql::FunctionArguments::List(list) => {
                let distinct = matches!(
                    list.duplicate_treatment,
                    Some(sql::DuplicateTreatment::Distinct)
                );
                let mut args = Vec::with_capacity(list.args.len());
                let mut saw_wildcard = false;
                for arg in &list.args {
                    match arg {
                        sql::FunctionArg::Unnamed(sql::FunctionArgExpr::Expr(e)) => {
                            args.push(self.translate_expr_inner(e, scope)?);
                        }
                        sql::FunctionArg::Unnamed(sql::FunctionArgExpr::Wildcard) => {
                            saw_wildcard = true;
                        }
                        other => {
                            return Err(EngineError::Validation(format!(
                                "unsupported function argument: {}",
                                other
                            )))
                        }
                    }
                }
                Ok((args, distinct, saw_wildcard))
            }
            sql::FunctionArguments::Subquery(_) => Err(EngineError::Validation(
                "subquery function arguments are not supported".into(),
            )),
        }
    }
}

// ----------------------------------------------------------------------
// Window-call placeholder
//
// Window calls need their OVER spec carried from expression translation up to
// select-list processing. They travel as a reserved Call whose first argument
// is the serialized spec; `take_window_placeholder` unpacks them. The
// reserved name cannot collide with user functions (arity checking rejects
// it everywhere else).
// ----------------------------------------------------------------------

const WINDOW_PLACEHOLDER: &str = "__window__";

#[derive(serde::Serialize, serde::Deserialize)]
struct WindowSpecPayload {
    func: WindowFunc,
    partition: Vec<Expr>,
    order: Vec<SortKey>,
}

fn make_window_placeholder(
    func: WindowFunc,
    args: Vec<Expr>,
    partition: Vec<Expr>,
    order: Vec<SortKey>,
) -> Expr {
    let payload = WindowSpecPayload {
        func,
        partition,
        order,
    };
    let spec = serde_json::to_string(&payload).expect("window spec serializes");
    let mut all_args = vec![Expr::literal(Value::String(spec))];
    all_args.extend(args);
    Expr::Call {
        func: WINDOW_PLACEHOLDER.to_string(),
        args: all_args,
    }
}

#[allow(clippy::type_complexity)]
fn take_window_placeholder(expr: &Expr) -> Option<(WindowFunc, Vec<Expr>, Vec<Expr>, Vec<SortKey>)> {
    if let Expr::Call { func, args } = expr {
        if func == WINDOW_PLACEHOLDER {
            if let Some(Expr::Literal(Value::String(spec))) = args.first() {
                if let Ok(payload) = serde_json::from_str::<WindowSpecPayload>(spec) {
                    return Some((
                        payload.func,
                        args[1..].to_vec(),
                        payload.partition,
                        payload.order,
                    ));
                }
            }
        }
    }
    None
}

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

fn statement_kind(stmt: &sql::Statement) -> &'static str {
    match stmt {
        sql::Statement::Insert(_) => "INSERT",
        sql::Statement::Update { .. } => "UPDATE",
        sql::Statement::Delete(_) => "DELETE",
        sql::Statement::CreateTable(_) => "CREATE TABLE",
        sql::Statement::Drop { .. } => "DROP",
        _ => "a non-query statement",
    }
}

/// Best-effort extraction of position/expected/found from sqlparser's error
/// text ("Expected: X, found: Y at Line n, Column m").
fn parse_error(message: &str) -> EngineError {
    let mut expected = String::new();
    let mut found = message.to_string();
    if let Some(rest) = message.split("Expected:").nth(1) {
        if let Some((exp, fnd)) = rest.split_once(", found:") {
            expected = exp.trim().to_string();
            found = fnd.trim().to_string();
        }
    }
    let position = message
        .rsplit("Column ")
        .next()
        .and_then(|c| c.trim().parse::<usize>().ok())
        .unwrap_or(0);
    EngineError::Parse {
        position,
        expected,
        found,
    }
}

fn translate_value(value: &sql::Value) -> Result<Expr> {
    match value {
        sql::Value::Number(n, _) => {
            if n.contains('.') || n.contains('e') || n.contains('E') {
                n.parse::<f64>()
                    .map(|f| Expr::literal(Value::Float(f)))
                    .map_err(|_| parse_error(&format!("invalid number: {}", n)))
            } else {
                n.parse::<i64>()
                    .map(|i| Expr::literal(Value::Integer(i)))
                    .map_err(|_| parse_error(&format!("invalid number: {}", n)))
            }
        }
        sql::Value::SingleQuotedString(s) | sql::Value::DoubleQuotedString(s) => {
            Ok(Expr::literal(Value::String(s.clone())))
        }
        sql::Value::Boolean(b) => Ok(Expr::literal(Value::Boolean(*b))),
        sql::Value::Null => Ok(Expr::literal(Value::Null)),
        other => Err(EngineError::Validation(format!(
            "unsupported literal: {}",
            other
        ))),
    }
}

fn translate_binary_op(op: &sql::BinaryOperator) -> Result<BinaryOp> {
    Ok(match op {
        sql::BinaryOperator::And => BinaryOp::And,
        sql::BinaryOperator::Or => BinaryOp::Or,
        sql::BinaryOperator::Eq => BinaryOp::Eq,
        sql::BinaryOperator::NotEq => BinaryOp::NotEq,
        sql::BinaryOperator::Lt => BinaryOp::Lt,
        sql::BinaryOperator::LtEq => BinaryOp::LtEq,
        sql::BinaryOperator::Gt => BinaryOp::Gt,
        sql::BinaryOperator::GtEq => BinaryOp::GtEq,
        sql::BinaryOperator::Plus => BinaryOp::Plus,
        sql::BinaryOperator::Minus => BinaryOp::Minus,
        sql::BinaryOperator::Multiply => BinaryOp::Multiply,
        sql::BinaryOperator::Divide => BinaryOp::Divide,
        sql::BinaryOperator::Modulo => BinaryOp::Modulo,
        sql::BinaryOperator::StringConcat => BinaryOp::Plus,
        other => {
            return Err(EngineError::Validation(format!(
                "unsupported operator: {}",
                other
            )))
        }
    })
}

fn translate_join_operator(
    op: &sql::JoinOperator,
) -> Result<(JoinType, Option<sql::JoinConstraint>)> {
    use sql::JoinOperator::*;
    Ok(match op {
        Join(c) | Inner(c) => (JoinType::Inner, Some(c.clone())),
        Left(c) | LeftOuter(c) => (JoinType::Left, Some(c.clone())),
        Right(c) | RightOuter(c) => (JoinType::Right, Some(c.clone())),
        FullOuter(c) => (JoinType::Full, Some(c.clone())),
        Semi(c) | LeftSemi(c) => (JoinType::Semi, Some(c.clone())),
        Anti(c) | LeftAnti(c) => (JoinType::Anti, Some(c.clone())),
        CrossJoin(_) => (JoinType::Inner, None),
        other => {
            return Err(EngineError::Validation(format!(
                "unsupported join type: {:?}",
                other
            )))
        }
    })
}

fn literal_usize(expr: &sql::Expr, clause: &str) -> Result<usize> {
    if let sql::Expr::Value(v) = expr {
        if let sql::Value::Number(n, _) = &v.value {
            return n
                .parse::<usize>()
                .map_err(|_| parse_error(&format!("invalid {} value: {}", clause, n)));
        }
    }
    Err(EngineError::Validation(format!(
        "{} must be a literal non-negative integer",
        clause
    )))
}

fn make_aggregate_call(
    name: &str,
    mut args: Vec<Expr>,
    distinct: bool,
    saw_wildcard: bool,
) -> Result<Expr> {
    let func = match (name, distinct) {
        ("count", true) => AggFunc::CountDistinct,
        ("count", false) => AggFunc::Count,
        ("sum", _) => AggFunc::Sum,
        ("avg", _) => AggFunc::Avg,
        ("min", _) => AggFunc::Min,
        ("max", _) => AggFunc::Max,
        ("stddev", _) => AggFunc::Stddev,
        ("variance", _) => AggFunc::Variance,
        ("median", _) => AggFunc::Median,
        ("mode", _) => AggFunc::Mode,
        ("corr", _) => AggFunc::Correlation,
        ("percentile", _) => {
            let p = match args.pop() {
                Some(Expr::Literal(Value::Float(p))) => p,
                Some(Expr::Literal(Value::Integer(p))) => p as f64 / 100.0,
                _ => {
                    return Err(EngineError::Validation(
                        "percentile requires a literal fraction".into(),
                    ))
                }
            };
            if !(0.0..=1.0).contains(&p) {
                return Err(EngineError::Validation(format!(
                    "percentile fraction {} out of [0, 1]",
                    p
                )));
            }
            AggFunc::Percentile(p)
        }
        ("moving_avg", _) => {
            let w = match args.pop() {
                Some(Expr::Literal(Value::Integer(w))) if w > 0 => w as usize,
                _ => {
                    return Err(EngineError::Validation(
                        "moving_avg requires a literal positive window".into(),
                    ))
                }
            };
            AggFunc::MovingAvg(w)
        }
        _ => {
            return Err(EngineError::Validation(format!(
                "unknown aggregate '{}'",
                name
            )))
        }
    };
    // COUNT(*) carries no argument
    if saw_wildcard && !args.is_empty() {
        return Err(EngineError::Validation(
            "mixed wildcard and expression arguments".into(),
        ));
    }
    if !saw_wildcard && args.is_empty() {
        return Err(EngineError::Validation(format!(
            "{} requires an argument",
            name
        )));
    }
    let second_arg = if matches!(func, AggFunc::Correlation) {
        if args.len() != 2 {
            return Err(EngineError::Validation(
                "corr requires exactly two arguments".into(),
            ));
        }
        Some(args.remove(1))
    } else {
        if args.len() > 1 {
            return Err(EngineError::Validation(format!(
                "{} takes one argument",
                name
            )));
        }
        None
    };
    // Encode as a reserved call; extract_aggregates unpacks it into AggExpr.
    let payload = AggPayload {
        func,
        arg: args.pop(),
        second_arg,
    };
    Ok(Expr::Call {
        func: AGG_PLACEHOLDER.to_string(),
        args: vec![Expr::literal(Value::String(
            serde_json::to_string(&payload).expect("agg payload serializes"),
        ))],
    })
}

const AGG_PLACEHOLDER: &str = "__aggregate__";

#[derive(serde::Serialize, serde::Deserialize)]
struct AggPayload {
    func: AggFunc,
    arg: Option<Expr>,
    second_arg: Option<Expr>,
}

/// Replace aggregate placeholders in `expr` with column references to the
/// aggregate's output, appending the aggregate definitions to `aggs`.
fn extract_aggregates(expr: &Expr, aggs: &mut Vec<AggExpr>) -> Result<Expr> {
    match expr {
        Expr::Call { func, args } if func == AGG_PLACEHOLDER => {
            let payload: AggPayload = match args.first() {
                Some(Expr::Literal(Value::String(spec))) => serde_json::from_str(spec)
                    .map_err(|e| EngineError::Internal(format!("bad aggregate payload: {}", e)))?,
                _ => return Err(EngineError::Internal("bad aggregate placeholder".into())),
            };
            let alias = format!(
                "{}({})",
                payload.func.name().to_lowercase(),
                payload
                    .arg
                    .as_ref()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "*".to_string())
            );
            // Reuse an identical aggregate instead of computing it twice
            if !aggs
                .iter()
                .any(|a| a.alias == alias)
            {
                aggs.push(AggExpr {
                    func: payload.func,
                    arg: payload.arg,
                    second_arg: payload.second_arg,
                    alias: alias.clone(),
                });
            }
            Ok(Expr::column(alias))
        }
        Expr::BinaryOp { left, op, right } => Ok(Expr::binary(
            extract_aggregates(left, aggs)?,
            *op,
            extract_aggregates(right, aggs)?,
        )),
        Expr::UnaryOp { op, expr } => Ok(Expr::UnaryOp {
            op: *op,
            expr: Box::new(extract_aggregates(expr, aggs)?),
        }),
        Expr::Call { func, args } => {
            let args = args
                .iter()
                .map(|a| extract_aggregates(a, aggs))
                .collect::<Result<_>>()?;
            Ok(Expr::Call {
                func: func.clone(),
                args,
            })
        }
        Expr::Case {
            operand,
            branches,
            else_expr,
        } => Ok(Expr::Case {
            operand: match operand {
                Some(op) => Some(Box::new(extract_aggregates(op, aggs)?)),
                None => None,
            },
            branches: branches
                .iter()
                .map(|(w, t)| Ok((extract_aggregates(w, aggs)?, extract_aggregates(t, aggs)?)))
                .collect::<Result<_>>()?,
            else_expr: match else_expr {
                Some(e) => Some(Box::new(extract_aggregates(e, aggs)?)),
                None => None,
            },
        }),
        Expr::Cast { expr, to } => Ok(Expr::Cast {
            expr: Box::new(extract_aggregates(expr, aggs)?),
            to: to.clone(),
        }),
        other => Ok(other.clone()),
    }
}

/// Verify every column reference in `expr` resolves to exactly one column of
/// `schema`. Placeholder calls are skipped; their inner expressions were
/// translated from the same scope.
fn resolve_columns(expr: &Expr, schema: &Schema) -> Result<()> {
    match expr {
        Expr::Column { relation, name } => {
            let matches = schema.resolve(relation.as_deref(), name);
            match matches.len() {
                1 => Ok(()),
                0 => Err(EngineError::Resolution {
                    name: match relation {
                        Some(r) => format!("{}.{}", r, name),
                        None => name.clone(),
                    },
                    candidates: closest_names(name, schema),
                }),
                _ => Err(EngineError::Validation(format!(
                    "ambiguous column reference '{}'",
                    name
                ))),
            }
        }
        Expr::Call { func, .. }
            if func == AGG_PLACEHOLDER || func == WINDOW_PLACEHOLDER =>
        {
            Ok(())
        }
        _ => {
            for child in expr_children(expr) {
                resolve_columns(child, schema)?;
            }
            Ok(())
        }
    }
}

fn expr_children(expr: &Expr) -> Vec<&Expr> {
    match expr {
        Expr::Literal(_) | Expr::Column { .. } => vec![],
        Expr::BinaryOp { left, right, .. } => vec![left, right],
        Expr::UnaryOp { expr, .. } => vec![expr],
        Expr::Call { args, .. } => args.iter().collect(),
        Expr::Case {
            operand,
            branches,
            else_expr,
        } => {
            let mut out: Vec<&Expr> = Vec::new();
            if let Some(op) = operand {
                out.push(op);
            }
            for (w, t) in branches {
                out.push(w);
                out.push(t);
            }
            if let Some(e) = else_expr {
                out.push(e);
            }
            out
        }
        Expr::Cast { expr, .. } => vec![expr],
    }
}

/// Candidate suggestions for an unresolved name: same prefix or short edit
/// distance, falling back to the full column list.
fn closest_names(name: &str, schema: &Schema) -> Vec<String> {
    let lowered = name.to_lowercase();
    let mut close: Vec<String> = schema
        .names()
        .into_iter()
        .filter(|c| {
            let cl = c.to_lowercase();
            cl.starts_with(&lowered) || lowered.starts_with(&cl)
        })
        .collect();
    if close.is_empty() {
        close = schema.names();
    }
    close
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{MemoryAdapter, SourceKind};
    use crate::common::{Column, ColumnType};

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
            vec![],
        );
        pg.add_table(
            "orders",
            Schema::new(vec![
                Column::new("order_id", ColumnType::Int64, false),
                Column::new("user_id", ColumnType::Int64, false),
                Column::new("total", ColumnType::Float64, true),
            ]),
            vec![],
        );
        registry.register(Arc::new(pg)).unwrap();
        registry
    }

    fn parser() -> QueryParser {
        QueryParser::new(registry())
    }

    #[test]
    fn test_simple_select() {
        let plan = parser()
            .parse("SELECT id, name FROM users WHERE age > 30")
            .unwrap();
        let explained = plan.explain();
        assert!(explained.contains("Project"));
        assert!(explained.contains("Filter"));
        assert!(explained.contains("Scan: pg.users"));
    }

    #[test]
    fn test_unknown_table_lists_candidates() {
        match parser().parse("SELECT x FROM ghosts") {
            Err(EngineError::Resolution { name, candidates }) => {
                assert_eq!(name, "ghosts");
                assert!(candidates.iter().any(|c| c.contains("users")));
            }
            other => panic!("expected resolution error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_unknown_column_lists_candidates() {
        match parser().parse("SELECT nam FROM users") {
            Err(EngineError::Resolution { name, candidates }) => {
                assert_eq!(name, "nam");
                assert!(candidates.contains(&"name".to_string()));
            }
            other => panic!("expected resolution error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_malformed_sql_is_parse_error() {
        assert!(matches!(
            parser().parse("SELEKT * FROM users"),
            Err(EngineError::Parse { .. })
        ));
    }

    #[test]
    fn test_dml_rejected() {
        assert!(matches!(
            parser().parse("DELETE FROM users"),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_join_on() {
        let plan = parser()
            .parse("SELECT name, total FROM users JOIN orders ON users.id = orders.user_id")
            .unwrap();
        let mut joins = 0;
        plan.traverse(&mut |n| {
            if matches!(n, LogicalPlan::Join { .. }) {
                joins += 1;
            }
        });
        assert_eq!(joins, 1);
    }

    #[test]
    fn test_group_by_aggregates() {
        let plan = parser()
            .parse("SELECT age, COUNT(*), AVG(age) FROM users GROUP BY age HAVING COUNT(*) > 1")
            .unwrap();
        let mut saw_aggregate = false;
        plan.traverse(&mut |n| {
            if let LogicalPlan::Aggregate { aggregates, .. } = n {
                saw_aggregate = true;
                assert_eq!(aggregates.len(), 2);
            }
        });
        assert!(saw_aggregate);
    }

    #[test]
    fn test_window_function() {
        let plan = parser()
            .parse("SELECT name, RANK() OVER (PARTITION BY age ORDER BY id) AS r FROM users")
            .unwrap();
        let mut saw_window = false;
        plan.traverse(&mut |n| {
            if let LogicalPlan::Window { functions, .. } = n {
                saw_window = true;
                assert_eq!(functions[0].func, WindowFunc::Rank);
                assert_eq!(functions[0].alias, "r");
            }
        });
        assert!(saw_window);
    }

    #[test]
    fn test_order_by_limit() {
        let plan = parser()
            .parse("SELECT id FROM users ORDER BY id DESC LIMIT 10 OFFSET 5")
            .unwrap();
        match plan.as_ref() {
            LogicalPlan::Limit { limit, offset, input } => {
                assert_eq!(*limit, Some(10));
                assert_eq!(*offset, 5);
                assert!(matches!(input.as_ref(), LogicalPlan::Sort { .. }));
            }
            other => panic!("expected Limit at root, got {}", other.name()),
        }
    }

    #[test]
    fn test_cte_inlined() {
        let plan = parser()
            .parse("WITH adults AS (SELECT id, age FROM users WHERE age >= 18) SELECT id FROM adults")
            .unwrap();
        // CTE body is inlined: the scan below everything is pg.users
        let mut saw_scan = false;
        plan.traverse(&mut |n| {
            if let LogicalPlan::Scan { table, .. } = n {
                saw_scan = true;
                assert_eq!(table, "users");
            }
        });
        assert!(saw_scan);
    }

    #[test]
    fn test_union() {
        let plan = parser()
            .parse("SELECT id FROM users UNION ALL SELECT order_id FROM orders")
            .unwrap();
        match plan.as_ref() {
            LogicalPlan::Union { inputs, all } => {
                assert_eq!(inputs.len(), 2);
                assert!(*all);
            }
            other => panic!("expected Union at root, got {}", other.name()),
        }
    }

    #[test]
    fn test_json_ast_round_trip() {
        let p = parser();
        let plan = p
            .parse("SELECT id, name FROM users WHERE age > 30")
            .unwrap();
        let printed = p.print(&plan).unwrap();
        let reparsed = p.parse_json(&printed).unwrap();
        assert_eq!(plan.as_ref(), reparsed.as_ref());
    }

    #[test]
    fn test_count_distinct() {
        let plan = parser()
            .parse("SELECT COUNT(DISTINCT age) FROM users")
            .unwrap();
        let mut found = false;
        plan.traverse(&mut |n| {
            if let LogicalPlan::Aggregate { aggregates, .. } = n {
                found = matches!(aggregates[0].func, AggFunc::CountDistinct);
            }
        });
        assert!(found);
    }
}

// Expression tree for logical plans.
//
// Expressions are immutable; rewrites build new trees. Every expression can
// report its inferred type against an input schema, and renders to a stable
// textual form used both for projection naming and canonical ordering.

use crate::common::{ColumnType, Schema, Value};
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    Like,
}

impl BinaryOp {
    /// Operand order does not change the result.
    pub fn is_commutative(&self) -> bool {
        matches!(
            self,
            BinaryOp::And | BinaryOp::Or | BinaryOp::Eq | BinaryOp::Plus | BinaryOp::Multiply
        )
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
        )
    }

    /// The mirrored comparison (for `a < b` ⇔ `b > a` rewrites).
    pub fn flip(&self) -> Option<BinaryOp> {
        match self {
            BinaryOp::Lt => Some(BinaryOp::Gt),
            BinaryOp::LtEq => Some(BinaryOp::GtEq),
            BinaryOp::Gt => Some(BinaryOp::Lt),
            BinaryOp::GtEq => Some(BinaryOp::LtEq),
            BinaryOp::Eq => Some(BinaryOp::Eq),
            BinaryOp::NotEq => Some(BinaryOp::NotEq),
            _ => None,
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Like => "LIKE",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Negate,
    IsNull,
    IsNotNull,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOp::Not => write!(f, "NOT"),
            UnaryOp::Negate => write!(f, "-"),
            UnaryOp::IsNull => write!(f, "IS NULL"),
            UnaryOp::IsNotNull => write!(f, "IS NOT NULL"),
        }
    }
}

/// Scalar expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Value),
    Column {
        relation: Option<String>,
        name: String,
    },
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    UnaryOp {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Call {
        func: String,
        args: Vec<Expr>,
    },
    Case {
        operand: Option<Box<Expr>>,
        branches: Vec<(Expr, Expr)>,
        else_expr: Option<Box<Expr>>,
    },
    Cast {
        expr: Box<Expr>,
        to: ColumnType,
    },
}

impl Expr {
    pub fn column(name: impl Into<String>) -> Expr {
        Expr::Column {
            relation: None,
            name: name.into(),
        }
    }

    pub fn qualified_column(relation: impl Into<String>, name: impl Into<String>) -> Expr {
        Expr::Column {
            relation: Some(relation.into()),
            name: name.into(),
        }
    }

    pub fn literal(v: Value) -> Expr {
        Expr::Literal(v)
    }

    pub fn binary(left: Expr, op: BinaryOp, right: Expr) -> Expr {
        Expr::BinaryOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn and(left: Expr, right: Expr) -> Expr {
        Expr::binary(left, BinaryOp::And, right)
    }

    /// Conjoin a list of predicates; `None` for an empty list.
    pub fn conjunction(mut preds: Vec<Expr>) -> Option<Expr> {
        let first = if preds.is_empty() {
            return None;
        } else {
            preds.remove(0)
        };
        Some(preds.into_iter().fold(first, Expr::and))
    }

    /// Split a predicate on AND into its conjuncts.
    pub fn split_conjunction(&self) -> Vec<&Expr> {
        match self {
            Expr::BinaryOp {
                left,
                op: BinaryOp::And,
                right,
            } => {
                let mut out = left.split_conjunction();
                out.extend(right.split_conjunction());
                out
            }
            other => vec![other],
        }
    }

    /// Collect every column reference in the tree.
    pub fn referenced_columns(&self, out: &mut Vec<(Option<String>, String)>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Column { relation, name } => out.push((relation.clone(), name.clone())),
            Expr::BinaryOp { left, right, .. } => {
                left.referenced_columns(out);
                right.referenced_columns(out);
            }
            Expr::UnaryOp { expr, .. } => expr.referenced_columns(out),
            Expr::Call { args, .. } => {
                for a in args {
                    a.referenced_columns(out);
                }
            }
            Expr::Case {
                operand,
                branches,
                else_expr,
            } => {
                if let Some(op) = operand {
                    op.referenced_columns(out);
                }
                for (w, t) in branches {
                    w.referenced_columns(out);
                    t.referenced_columns(out);
                }
                if let Some(e) = else_expr {
                    e.referenced_columns(out);
                }
            }
            Expr::Cast { expr, .. } => expr.referenced_columns(out),
        }
    }

    /// Name this expression contributes to an output schema.
    pub fn output_name(&self) -> String {
        match self {
            Expr::Column { name, .. } => name.clone(),
            other => other.to_string(),
        }
    }

    /// Infer the type of this expression against `schema`. Column references
    /// must resolve to exactly one input column.
    pub fn data_type(&self, schema: &Schema) -> Result<ColumnType> {
        match self {
            Expr::Literal(v) => Ok(literal_type(v)),
            Expr::Column { relation, name } => {
                let matches = schema.resolve(relation.as_deref(), name);
                match matches.len() {
                    1 => Ok(schema.columns[matches[0]].data_type.clone()),
                    0 => Err(EngineError::Resolution {
                        name: name.clone(),
                        candidates: schema.names(),
                    }),
                    _ => Err(EngineError::Validation(format!(
                        "ambiguous column reference '{}'",
                        name
                    ))),
                }
            }
            Expr::BinaryOp { left, op, right } => {
                let lt = left.data_type(schema)?;
                let rt = right.data_type(schema)?;
                match op {
                    BinaryOp::And | BinaryOp::Or | BinaryOp::Like => Ok(ColumnType::Bool),
                    op if op.is_comparison() => Ok(ColumnType::Bool),
                    _ => {
                        if lt.is_numeric() && rt.is_numeric() {
                            Ok(lt.numeric_widen(&rt))
                        } else if lt == ColumnType::Utf8 && rt == ColumnType::Utf8 {
                            // string concatenation via +
                            Ok(ColumnType::Utf8)
                        } else {
                            Err(EngineError::TypeMismatch(format!(
                                "operator {} not applicable to {} and {}",
                                op, lt, rt
                            )))
                        }
                    }
                }
            }
            Expr::UnaryOp { op, expr } => match op {
                UnaryOp::Not | UnaryOp::IsNull | UnaryOp::IsNotNull => Ok(ColumnType::Bool),
                UnaryOp::Negate => {
                    let t = expr.data_type(schema)?;
                    if t.is_numeric() {
                        Ok(t)
                    } else {
                        Err(EngineError::TypeMismatch(format!("cannot negate {}", t)))
                    }
                }
            },
            Expr::Call { func, args } => call_return_type(func, args, schema),
            Expr::Case {
                branches,
                else_expr,
                ..
            } => {
                if let Some((_, then)) = branches.first() {
                    then.data_type(schema)
                } else if let Some(e) = else_expr {
                    e.data_type(schema)
                } else {
                    Ok(ColumnType::Unknown)
                }
            }
            Expr::Cast { to, .. } => Ok(to.clone()),
        }
    }
}

fn literal_type(v: &Value) -> ColumnType {
    match v {
        Value::Null => ColumnType::Unknown,
        Value::Boolean(_) => ColumnType::Bool,
        Value::Integer(_) => ColumnType::Int64,
        Value::Float(_) => ColumnType::Float64,
        Value::Decimal(d) => ColumnType::Decimal {
            precision: 38,
            scale: d.scale,
        },
        Value::String(_) => ColumnType::Utf8,
        Value::Bytes(_) => ColumnType::Binary,
        Value::Date(_) => ColumnType::Date,
        Value::Time(_) => ColumnType::Time,
        Value::Timestamp(_) => ColumnType::Timestamp { tz: None },
        Value::Interval(_) => ColumnType::Interval,
        Value::Json(_) => ColumnType::Json,
        Value::Vector(v) => ColumnType::Vector { dim: v.len() },
        Value::Array(items) => ColumnType::Array(Box::new(
            items
                .first()
                .map(literal_type)
                .unwrap_or(ColumnType::Unknown),
        )),
    }
}

/// Built-in scalar functions: name → (min arity, max arity).
const BUILTIN_FUNCTIONS: &[(&str, usize, usize)] = &[
    ("abs", 1, 1),
    ("coalesce", 1, usize::MAX),
    ("length", 1, 1),
    ("lower", 1, 1),
    ("upper", 1, 1),
    ("round", 1, 2),
    ("time_bucket", 2, 2),
    ("vector_distance", 2, 2),
];

pub fn check_call_arity(func: &str, arg_count: usize) -> Result<()> {
    match BUILTIN_FUNCTIONS.iter().find(|(n, _, _)| *n == func) {
        Some((_, min, max)) => {
            if arg_count < *min || arg_count > *max {
                Err(EngineError::Validation(format!(
                    "function {} takes {} argument(s), got {}",
                    func,
                    if min == max {
                        min.to_string()
                    } else {
                        format!("{}..{}", min, max)
                    },
                    arg_count
                )))
            } else {
                Ok(())
            }
        }
        None => Err(EngineError::Validation(format!(
            "unknown function '{}'",
            func
        ))),
    }
}

fn call_return_type(func: &str, args: &[Expr], schema: &Schema) -> Result<ColumnType> {
    check_call_arity(func, args.len())?;
    match func {
        "abs" | "round" => args[0].data_type(schema),
        "coalesce" => args[0].data_type(schema),
        "length" => Ok(ColumnType::Int64),
        "lower" | "upper" => Ok(ColumnType::Utf8),
        "time_bucket" => Ok(ColumnType::Timestamp { tz: None }),
        "vector_distance" => Ok(ColumnType::Float64),
        _ => Ok(ColumnType::Unknown),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => match v {
                Value::String(s) => write!(f, "'{}'", s),
                other => write!(f, "{}", other),
            },
            Expr::Column { relation, name } => match relation {
                Some(rel) => write!(f, "{}.{}", rel, name),
                None => write!(f, "{}", name),
            },
            Expr::BinaryOp { left, op, right } => write!(f, "({} {} {})", left, op, right),
            Expr::UnaryOp { op, expr } => match op {
                UnaryOp::IsNull | UnaryOp::IsNotNull => write!(f, "({} {})", expr, op),
                _ => write!(f, "({} {})", op, expr),
            },
            Expr::Call { func, args } => {
                write!(f, "{}(", func)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            Expr::Case {
                operand,
                branches,
                else_expr,
            } => {
                write!(f, "CASE")?;
                if let Some(op) = operand {
                    write!(f, " {}", op)?;
                }
                for (w, t) in branches {
                    write!(f, " WHEN {} THEN {}", w, t)?;
                }
                if let Some(e) = else_expr {
                    write!(f, " ELSE {}", e)?;
                }
                write!(f, " END")
            }
            Expr::Cast { expr, to } => write!(f, "CAST({} AS {})", expr, to),
        }
    }
}

// ============================================================================
// Sort keys, aggregates, window functions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub expr: Expr,
    pub ascending: bool,
    pub nulls_first: bool,
}

impl SortKey {
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            ascending: true,
            nulls_first: true,
        }
    }

    pub fn desc(expr: Expr) -> Self {
        Self {
            expr,
            ascending: false,
            nulls_first: false,
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.expr,
            if self.ascending { "ASC" } else { "DESC" }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggFunc {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    CountDistinct,
    Stddev,
    Variance,
    Median,
    Percentile(f64),
    Mode,
    Correlation,
    MovingAvg(usize),
}

impl AggFunc {
    pub fn name(&self) -> &'static str {
        match self {
            AggFunc::Sum => "SUM",
            AggFunc::Avg => "AVG",
            AggFunc::Min => "MIN",
            AggFunc::Max => "MAX",
            AggFunc::Count => "COUNT",
            AggFunc::CountDistinct => "COUNT_DISTINCT",
            AggFunc::Stddev => "STDDEV",
            AggFunc::Variance => "VARIANCE",
            AggFunc::Median => "MEDIAN",
            AggFunc::Percentile(_) => "PERCENTILE",
            AggFunc::Mode => "MODE",
            AggFunc::Correlation => "CORR",
            AggFunc::MovingAvg(_) => "MOVING_AVG",
        }
    }
}

/// One aggregate output: `func(arg) AS alias`. `arg` is `None` for
/// `COUNT(*)`; `second_arg` carries the second input of CORR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggExpr {
    pub func: AggFunc,
    pub arg: Option<Expr>,
    pub second_arg: Option<Expr>,
    pub alias: String,
}

impl AggExpr {
    pub fn output_type(&self, schema: &Schema) -> Result<ColumnType> {
        match &self.func {
            AggFunc::Count | AggFunc::CountDistinct => Ok(ColumnType::Int64),
            AggFunc::Avg
            | AggFunc::Stddev
            | AggFunc::Variance
            | AggFunc::Median
            | AggFunc::Percentile(_)
            | AggFunc::Correlation
            | AggFunc::MovingAvg(_) => Ok(ColumnType::Float64),
            AggFunc::Sum | AggFunc::Min | AggFunc::Max | AggFunc::Mode => match &self.arg {
                Some(e) => e.data_type(schema),
                None => Ok(ColumnType::Int64),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowFunc {
    RowNumber,
    Rank,
    DenseRank,
    Lead,
    Lag,
    FirstValue,
    LastValue,
    Ntile,
}

impl WindowFunc {
    pub fn name(&self) -> &'static str {
        match self {
            WindowFunc::RowNumber => "ROW_NUMBER",
            WindowFunc::Rank => "RANK",
            WindowFunc::DenseRank => "DENSE_RANK",
            WindowFunc::Lead => "LEAD",
            WindowFunc::Lag => "LAG",
            WindowFunc::FirstValue => "FIRST_VALUE",
            WindowFunc::LastValue => "LAST_VALUE",
            WindowFunc::Ntile => "NTILE",
        }
    }
}

/// One window output: `func(args) OVER (...) AS alias`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowExpr {
    pub func: WindowFunc,
    pub args: Vec<Expr>,
    pub alias: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameBound {
    UnboundedPreceding,
    Preceding(usize),
    CurrentRow,
    Following(usize),
    UnboundedFollowing,
}

/// Window frame. The default frame spans the whole partition, which is the
/// frame every supported ranking/navigation function evaluates against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowFrame {
    pub start: FrameBound,
    pub end: FrameBound,
}

impl Default for WindowFrame {
    fn default() -> Self {
        Self {
            start: FrameBound::UnboundedPreceding,
            end: FrameBound::UnboundedFollowing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Column;

    fn schema() -> Schema {
        Schema::new(vec![
            Column::new("id", ColumnType::Int64, false),
            Column::new("age", ColumnType::Int32, true),
            Column::new("name", ColumnType::Utf8, true),
        ])
    }

    #[test]
    fn test_split_conjunction() {
        let e = Expr::and(
            Expr::and(Expr::column("a"), Expr::column("b")),
            Expr::column("c"),
        );
        assert_eq!(e.split_conjunction().len(), 3);
    }

    #[test]
    fn test_type_inference_comparison() {
        let e = Expr::binary(
            Expr::column("age"),
            BinaryOp::Gt,
            Expr::literal(Value::Integer(30)),
        );
        assert_eq!(e.data_type(&schema()).unwrap(), ColumnType::Bool);
    }

    #[test]
    fn test_type_inference_widening() {
        let e = Expr::binary(
            Expr::column("age"),
            BinaryOp::Plus,
            Expr::literal(Value::Float(0.5)),
        );
        assert_eq!(e.data_type(&schema()).unwrap(), ColumnType::Float64);
    }

    #[test]
    fn test_unknown_column_is_resolution_error() {
        let e = Expr::column("nope");
        assert!(matches!(
            e.data_type(&schema()),
            Err(EngineError::Resolution { .. })
        ));
    }

    #[test]
    fn test_arity_check() {
        assert!(check_call_arity("abs", 1).is_ok());
        assert!(check_call_arity("abs", 2).is_err());
        assert!(check_call_arity("no_such_fn", 1).is_err());
    }

    #[test]
    fn test_display_round_trip_stable() {
        let e = Expr::binary(
            Expr::qualified_column("users", "age"),
            BinaryOp::GtEq,
            Expr::literal(Value::Integer(18)),
        );
        assert_eq!(e.to_string(), "(users.age >= 18)");
    }
}

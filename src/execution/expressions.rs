// Row-wise expression evaluation with SQL three-valued logic.
//
// NULL propagates through arithmetic and comparisons; AND/OR follow Kleene
// logic. Integer arithmetic is checked and surfaces overflow as an arithmetic
// error; floats follow IEEE-754; decimals round half-to-even at the wider
// operand scale.

use crate::common::{ColumnType, Decimal, Row, Schema, Value};
use crate::error::{EngineError, Result};
use crate::plan::{BinaryOp, Expr, UnaryOp};
use std::cmp::Ordering;
use std::sync::Arc;

pub struct ExpressionEvaluator {
    schema: Arc<Schema>,
}

impl ExpressionEvaluator {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Evaluate an expression against one row.
    pub fn evaluate(&self, expr: &Expr, row: &Row) -> Result<Value> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Column { relation, name } => {
                let matches = self.schema.resolve(relation.as_deref(), name);
                match matches.len() {
                    1 => Ok(row[matches[0]].clone()),
                    0 => Err(EngineError::Resolution {
                        name: name.clone(),
                        candidates: self.schema.names(),
                    }),
                    _ => Err(EngineError::Validation(format!(
                        "ambiguous column reference '{}'",
                        name
                    ))),
                }
            }
            Expr::BinaryOp { left, op, right } => match op {
                BinaryOp::And => {
                    let l = self.evaluate(left, row)?;
                    // Kleene AND: false dominates NULL
                    if l == Value::Boolean(false) {
                        return Ok(Value::Boolean(false));
                    }
                    let r = self.evaluate(right, row)?;
                    match (l, r) {
                        (_, Value::Boolean(false)) => Ok(Value::Boolean(false)),
                        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                        (Value::Boolean(a), Value::Boolean(b)) => Ok(Value::Boolean(a && b)),
                        (a, b) => Err(type_mismatch("AND", &a, &b)),
                    }
                }
                BinaryOp::Or => {
                    let l = self.evaluate(left, row)?;
                    if l == Value::Boolean(true) {
                        return Ok(Value::Boolean(true));
                    }
                    let r = self.evaluate(right, row)?;
                    match (l, r) {
                        (_, Value::Boolean(true)) => Ok(Value::Boolean(true)),
                        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                        (Value::Boolean(a), Value::Boolean(b)) => Ok(Value::Boolean(a || b)),
                        (a, b) => Err(type_mismatch("OR", &a, &b)),
                    }
                }
                BinaryOp::Like => {
                    let l = self.evaluate(left, row)?;
                    let r = self.evaluate(right, row)?;
                    match (l, r) {
                        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                        (Value::String(s), Value::String(p)) => {
                            Ok(Value::Boolean(like_match(&s, &p)))
                        }
                        (a, b) => Err(type_mismatch("LIKE", &a, &b)),
                    }
                }
                op if op.is_comparison() => {
                    let l = self.evaluate(left, row)?;
                    let r = self.evaluate(right, row)?;
                    if l.is_null() || r.is_null() {
                        return Ok(Value::Null);
                    }
                    let ord = l.partial_cmp(&r).ok_or_else(|| {
                        EngineError::TypeMismatch(format!(
                            "cannot compare {} with {}",
                            l.type_name(),
                            r.type_name()
                        ))
                    })?;
                    let result = match op {
                        BinaryOp::Eq => ord == Ordering::Equal,
                        BinaryOp::NotEq => ord != Ordering::Equal,
                        BinaryOp::Lt => ord == Ordering::Less,
                        BinaryOp::LtEq => ord != Ordering::Greater,
                        BinaryOp::Gt => ord == Ordering::Greater,
                        BinaryOp::GtEq => ord != Ordering::Less,
                        _ => unreachable!(),
                    };
                    Ok(Value::Boolean(result))
                }
                _ => {
                    let l = self.evaluate(left, row)?;
                    let r = self.evaluate(right, row)?;
                    arithmetic(*op, l, r)
                }
            },
            Expr::UnaryOp { op, expr } => {
                let v = self.evaluate(expr, row)?;
                match op {
                    UnaryOp::IsNull => Ok(Value::Boolean(v.is_null())),
                    UnaryOp::IsNotNull => Ok(Value::Boolean(!v.is_null())),
                    UnaryOp::Not => match v {
                        Value::Null => Ok(Value::Null),
                        Value::Boolean(b) => Ok(Value::Boolean(!b)),
                        other => Err(EngineError::TypeMismatch(format!(
                            "NOT applied to {}",
                            other.type_name()
                        ))),
                    },
                    UnaryOp::Negate => match v {
                        Value::Null => Ok(Value::Null),
                        Value::Integer(i) => i
                            .checked_neg()
                            .map(Value::Integer)
                            .ok_or_else(|| EngineError::Arithmetic("integer overflow".into())),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        Value::Decimal(d) => Ok(Value::Decimal(Decimal::new(-d.unscaled, d.scale))),
                        other => Err(EngineError::TypeMismatch(format!(
                            "cannot negate {}",
                            other.type_name()
                        ))),
                    },
                }
            }
            Expr::Call { func, args } => self.evaluate_call(func, args, row),
            Expr::Case {
                operand,
                branches,
                else_expr,
            } => {
                for (when, then) in branches {
                    let matched = match operand {
                        Some(op) => {
                            let lhs = self.evaluate(op, row)?;
                            let rhs = self.evaluate(when, row)?;
                            !lhs.is_null() && lhs == rhs
                        }
                        None => self.evaluate(when, row)? == Value::Boolean(true),
                    };
                    if matched {
                        return self.evaluate(then, row);
                    }
                }
                match else_expr {
                    Some(e) => self.evaluate(e, row),
                    None => Ok(Value::Null),
                }
            }
            Expr::Cast { expr, to } => {
                let v = self.evaluate(expr, row)?;
                cast_value(v, to)
            }
        }
    }

    /// Evaluate a predicate: NULL and false both reject the row.
    pub fn evaluate_predicate(&self, expr: &Expr, row: &Row) -> Result<bool> {
        Ok(self.evaluate(expr, row)? == Value::Boolean(true))
    }

    fn evaluate_call(&self, func: &str, args: &[Expr], row: &Row) -> Result<Value> {
        crate::plan::expr::check_call_arity(func, args.len())?;
        match func {
            "abs" => match self.evaluate(&args[0], row)? {
                Value::Null => Ok(Value::Null),
                Value::Integer(i) => i
                    .checked_abs()
                    .map(Value::Integer)
                    .ok_or_else(|| EngineError::Arithmetic("integer overflow".into())),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                Value::Decimal(d) => Ok(Value::Decimal(Decimal::new(d.unscaled.abs(), d.scale))),
                other => Err(EngineError::TypeMismatch(format!(
                    "abs({})",
                    other.type_name()
                ))),
            },
            "coalesce" => {
                for arg in args {
                    let v = self.evaluate(arg, row)?;
                    if !v.is_null() {
                        return Ok(v);
                    }
                }
                Ok(Value::Null)
            }
            "length" => match self.evaluate(&args[0], row)? {
                Value::Null => Ok(Value::Null),
                Value::String(s) => Ok(Value::Integer(s.chars().count() as i64)),
                Value::Bytes(b) => Ok(Value::Integer(b.len() as i64)),
                other => Err(EngineError::TypeMismatch(format!(
                    "length({})",
                    other.type_name()
                ))),
            },
            "lower" | "upper" => match self.evaluate(&args[0], row)? {
                Value::Null => Ok(Value::Null),
                Value::String(s) => Ok(Value::String(if func == "lower" {
                    s.to_lowercase()
                } else {
                    s.to_uppercase()
                })),
                other => Err(EngineError::TypeMismatch(format!(
                    "{}({})",
                    func,
                    other.type_name()
                ))),
            },
            "round" => {
                let v = self.evaluate(&args[0], row)?;
                let digits = if args.len() > 1 {
                    match self.evaluate(&args[1], row)? {
                        Value::Integer(d) => d as i32,
                        _ => 0,
                    }
                } else {
                    0
                };
                match v {
                    Value::Null => Ok(Value::Null),
                    Value::Float(f) => {
                        let factor = 10f64.powi(digits);
                        Ok(Value::Float((f * factor).round() / factor))
                    }
                    Value::Integer(i) => Ok(Value::Integer(i)),
                    Value::Decimal(d) => Ok(Value::Decimal(d.rescale(digits.max(0) as u32)?)),
                    other => Err(EngineError::TypeMismatch(format!(
                        "round({})",
                        other.type_name()
                    ))),
                }
            }
            "time_bucket" => {
                let width = self.evaluate(&args[0], row)?;
                let ts = self.evaluate(&args[1], row)?;
                match (width, ts) {
                    (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                    (Value::Interval(w), Value::Timestamp(t)) if w > 0 => {
                        Ok(Value::Timestamp(t - t.rem_euclid(w)))
                    }
                    (a, b) => Err(type_mismatch("time_bucket", &a, &b)),
                }
            }
            "vector_distance" => {
                let a = self.evaluate(&args[0], row)?;
                let b = self.evaluate(&args[1], row)?;
                match (a, b) {
                    (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                    (Value::Vector(x), Value::Vector(y)) => {
                        if x.len() != y.len() {
                            return Err(EngineError::Execution(format!(
                                "vector dimension mismatch: {} vs {}",
                                x.len(),
                                y.len()
                            )));
                        }
                        let dist: f64 = x
                            .iter()
                            .zip(y.iter())
                            .map(|(p, q)| {
                                let d = (*p - *q) as f64;
                                d * d
                            })
                            .sum::<f64>()
                            .sqrt();
                        Ok(Value::Float(dist))
                    }
                    (a, b) => Err(type_mismatch("vector_distance", &a, &b)),
                }
            }
            other => Err(EngineError::Validation(format!(
                "unknown function '{}'",
                other
            ))),
        }
    }
}

fn type_mismatch(op: &str, a: &Value, b: &Value) -> EngineError {
    EngineError::TypeMismatch(format!(
        "{} not applicable to {} and {}",
        op,
        a.type_name(),
        b.type_name()
    ))
}

fn arithmetic(op: BinaryOp, l: Value, r: Value) -> Result<Value> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    match (&l, &r) {
        (Value::Integer(a), Value::Integer(b)) => int_arithmetic(op, *a, *b),
        (Value::Float(a), Value::Float(b)) => float_arithmetic(op, *a, *b),
        (Value::Integer(a), Value::Float(b)) => float_arithmetic(op, *a as f64, *b),
        (Value::Float(a), Value::Integer(b)) => float_arithmetic(op, *a, *b as f64),
        (Value::Decimal(a), Value::Decimal(b)) => decimal_arithmetic(op, *a, *b),
        (Value::Decimal(a), Value::Integer(b)) => decimal_arithmetic(op, *a, Decimal::from_i64(*b)),
        (Value::Integer(a), Value::Decimal(b)) => decimal_arithmetic(op, Decimal::from_i64(*a), *b),
        (Value::String(a), Value::String(b)) if op == BinaryOp::Plus => {
            Ok(Value::String(format!("{}{}", a, b)))
        }
        (Value::Timestamp(a), Value::Interval(b)) if op == BinaryOp::Plus => {
            Ok(Value::Timestamp(a + b))
        }
        (Value::Timestamp(a), Value::Interval(b)) if op == BinaryOp::Minus => {
            Ok(Value::Timestamp(a - b))
        }
        _ => Err(type_mismatch(&op.to_string(), &l, &r)),
    }
}

fn int_arithmetic(op: BinaryOp, a: i64, b: i64) -> Result<Value> {
    let overflow = || EngineError::Arithmetic("integer overflow".to_string());
    match op {
        BinaryOp::Plus => a.checked_add(b).map(Value::Integer).ok_or_else(overflow),
        BinaryOp::Minus => a.checked_sub(b).map(Value::Integer).ok_or_else(overflow),
        BinaryOp::Multiply => a.checked_mul(b).map(Value::Integer).ok_or_else(overflow),
        BinaryOp::Divide => {
            if b == 0 {
                Err(EngineError::Arithmetic("division by zero".into()))
            } else {
                a.checked_div(b).map(Value::Integer).ok_or_else(overflow)
            }
        }
        BinaryOp::Modulo => {
            if b == 0 {
                Err(EngineError::Arithmetic("division by zero".into()))
            } else {
                a.checked_rem(b).map(Value::Integer).ok_or_else(overflow)
            }
        }
        _ => Err(EngineError::Internal(format!(
            "non-arithmetic operator {} in arithmetic path",
            op
        ))),
    }
}

fn float_arithmetic(op: BinaryOp, a: f64, b: f64) -> Result<Value> {
    // IEEE-754: division by zero yields inf/NaN rather than an error
    let v = match op {
        BinaryOp::Plus => a + b,
        BinaryOp::Minus => a - b,
        BinaryOp::Multiply => a * b,
        BinaryOp::Divide => a / b,
        BinaryOp::Modulo => a % b,
        _ => {
            return Err(EngineError::Internal(format!(
                "non-arithmetic operator {} in arithmetic path",
                op
            )))
        }
    };
    Ok(Value::Float(v))
}

fn decimal_arithmetic(op: BinaryOp, a: Decimal, b: Decimal) -> Result<Value> {
    let v = match op {
        BinaryOp::Plus => a.checked_add(&b)?,
        BinaryOp::Minus => a.checked_sub(&b)?,
        BinaryOp::Multiply => a.checked_mul(&b)?,
        BinaryOp::Divide => a.checked_div(&b)?,
        _ => {
            return Err(EngineError::Internal(format!(
                "non-arithmetic operator {} in arithmetic path",
                op
            )))
        }
    };
    Ok(Value::Decimal(v))
}

/// SQL LIKE with `%` and `_` wildcards.
fn like_match(s: &str, pattern: &str) -> bool {
    fn inner(s: &[char], p: &[char]) -> bool {
        match (s, p) {
            (_, []) => s.is_empty(),
            (_, ['%', rest @ ..]) => {
                (0..=s.len()).any(|skip| inner(&s[skip..], rest))
            }
            ([], _) => false,
            ([_, srest @ ..], ['_', prest @ ..]) => inner(srest, prest),
            ([sc, srest @ ..], [pc, prest @ ..]) => sc == pc && inner(srest, prest),
        }
    }
    let s: Vec<char> = s.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    inner(&s, &p)
}

fn cast_value(v: Value, to: &ColumnType) -> Result<Value> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    let fail = |v: &Value, to: &ColumnType| EngineError::Coercion {
        from: v.type_name().to_string(),
        to: to.to_string(),
    };
    match to {
        ColumnType::Bool => match v {
            Value::Boolean(_) => Ok(v),
            Value::Integer(i) => Ok(Value::Boolean(i != 0)),
            Value::String(ref s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(Value::Boolean(true)),
                "false" | "f" | "0" => Ok(Value::Boolean(false)),
                _ => Err(fail(&v, to)),
            },
            _ => Err(fail(&v, to)),
        },
        t if t.is_integer() => match v {
            Value::Integer(_) => Ok(v),
            Value::Boolean(b) => Ok(Value::Integer(b as i64)),
            Value::Float(f) => {
                if f.is_finite() && (i64::MIN as f64..=i64::MAX as f64).contains(&f) {
                    Ok(Value::Integer(f as i64))
                } else {
                    Err(EngineError::Arithmetic(format!(
                        "{} out of integer range",
                        f
                    )))
                }
            }
            Value::Decimal(d) => Ok(Value::Integer(d.rescale(0)?.unscaled as i64)),
            Value::String(ref s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|_| fail(&v, to)),
            _ => Err(fail(&v, to)),
        },
        t if t.is_float() => match v {
            Value::Float(_) => Ok(v),
            Value::Integer(i) => Ok(Value::Float(i as f64)),
            Value::Decimal(d) => Ok(Value::Float(d.to_f64())),
            Value::String(ref s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| fail(&v, to)),
            _ => Err(fail(&v, to)),
        },
        ColumnType::Decimal { scale, .. } => match v {
            Value::Decimal(d) => Ok(Value::Decimal(d.rescale(*scale)?)),
            Value::Integer(i) => Ok(Value::Decimal(Decimal::from_i64(i).rescale(*scale)?)),
            _ => Err(fail(&v, to)),
        },
        ColumnType::Utf8 => Ok(Value::String(v.to_string())),
        ColumnType::Timestamp { .. } => match v {
            Value::Timestamp(_) => Ok(v),
            Value::Integer(i) => Ok(Value::Timestamp(i)),
            _ => Err(fail(&v, to)),
        },
        ColumnType::Json => match v {
            Value::Json(_) => Ok(v),
            Value::String(s) => serde_json::from_str(&s)
                .map(Value::Json)
                .map_err(|_| EngineError::Coercion {
                    from: "STRING".into(),
                    to: "json".into(),
                }),
            _ => Err(fail(&v, to)),
        },
        _ => Err(fail(&v, to)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Column;

    fn evaluator() -> ExpressionEvaluator {
        ExpressionEvaluator::new(Arc::new(Schema::new(vec![
            Column::new("id", ColumnType::Int64, false),
            Column::new("age", ColumnType::Int64, true),
            Column::new("name", ColumnType::Utf8, true),
        ])))
    }

    fn row(id: i64, age: Option<i64>, name: &str) -> Row {
        vec![
            Value::Integer(id),
            age.map(Value::Integer).unwrap_or(Value::Null),
            Value::String(name.to_string()),
        ]
    }

    #[test]
    fn test_comparison_with_null_is_null() {
        let ev = evaluator();
        let expr = Expr::binary(
            Expr::column("age"),
            BinaryOp::Gt,
            Expr::literal(Value::Integer(30)),
        );
        let v = ev.evaluate(&expr, &row(1, None, "x")).unwrap();
        assert_eq!(v, Value::Null);
        assert!(!ev.evaluate_predicate(&expr, &row(1, None, "x")).unwrap());
    }

    #[test]
    fn test_kleene_and() {
        let ev = evaluator();
        // NULL AND false = false
        let expr = Expr::and(
            Expr::binary(
                Expr::column("age"),
                BinaryOp::Gt,
                Expr::literal(Value::Integer(0)),
            ),
            Expr::literal(Value::Boolean(false)),
        );
        assert_eq!(
            ev.evaluate(&expr, &row(1, None, "x")).unwrap(),
            Value::Boolean(false)
        );
    }

    #[test]
    fn test_integer_overflow_is_error() {
        let ev = evaluator();
        let expr = Expr::binary(
            Expr::literal(Value::Integer(i64::MAX)),
            BinaryOp::Plus,
            Expr::literal(Value::Integer(1)),
        );
        assert!(matches!(
            ev.evaluate(&expr, &row(1, Some(2), "x")),
            Err(EngineError::Arithmetic(_))
        ));
    }

    #[test]
    fn test_integer_division_by_zero_is_error() {
        let ev = evaluator();
        let expr = Expr::binary(
            Expr::column("id"),
            BinaryOp::Divide,
            Expr::literal(Value::Integer(0)),
        );
        assert!(matches!(
            ev.evaluate(&expr, &row(1, Some(2), "x")),
            Err(EngineError::Arithmetic(_))
        ));
    }

    #[test]
    fn test_float_division_by_zero_is_inf() {
        let ev = evaluator();
        let expr = Expr::binary(
            Expr::literal(Value::Float(1.0)),
            BinaryOp::Divide,
            Expr::literal(Value::Float(0.0)),
        );
        assert_eq!(
            ev.evaluate(&expr, &row(1, Some(2), "x")).unwrap(),
            Value::Float(f64::INFINITY)
        );
    }

    #[test]
    fn test_like() {
        assert!(like_match("alice", "a%"));
        assert!(like_match("alice", "_lice"));
        assert!(like_match("alice", "%ice"));
        assert!(!like_match("bob", "a%"));
        assert!(like_match("", "%"));
    }

    #[test]
    fn test_vector_distance() {
        let ev = evaluator();
        let expr = Expr::Call {
            func: "vector_distance".into(),
            args: vec![
                Expr::literal(Value::Vector(vec![0.0, 0.0])),
                Expr::literal(Value::Vector(vec![3.0, 4.0])),
            ],
        };
        assert_eq!(
            ev.evaluate(&expr, &row(1, Some(2), "x")).unwrap(),
            Value::Float(5.0)
        );
    }

    #[test]
    fn test_time_bucket_truncates() {
        let ev = evaluator();
        let expr = Expr::Call {
            func: "time_bucket".into(),
            args: vec![
                Expr::literal(Value::Interval(60_000_000)),
                Expr::literal(Value::Timestamp(125_000_000)),
            ],
        };
        assert_eq!(
            ev.evaluate(&expr, &row(1, Some(2), "x")).unwrap(),
            Value::Timestamp(120_000_000)
        );
    }

    #[test]
    fn test_cast_string_to_int() {
        let ev = evaluator();
        let expr = Expr::Cast {
            expr: Box::new(Expr::literal(Value::String(" 42 ".into()))),
            to: ColumnType::Int64,
        };
        assert_eq!(
            ev.evaluate(&expr, &row(1, Some(2), "x")).unwrap(),
            Value::Integer(42)
        );
    }

    #[test]
    fn test_case_expression() {
        let ev = evaluator();
        let expr = Expr::Case {
            operand: None,
            branches: vec![(
                Expr::binary(
                    Expr::column("age"),
                    BinaryOp::GtEq,
                    Expr::literal(Value::Integer(18)),
                ),
                Expr::literal(Value::String("adult".into())),
            )],
            else_expr: Some(Box::new(Expr::literal(Value::String("minor".into())))),
        };
        assert_eq!(
            ev.evaluate(&expr, &row(1, Some(20), "x")).unwrap(),
            Value::String("adult".into())
        );
        assert_eq!(
            ev.evaluate(&expr, &row(1, Some(10), "x")).unwrap(),
            Value::String("minor".into())
        );
    }
}

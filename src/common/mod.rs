// # Common Types
//
// Shared types used across the engine: values, column types, schemas, row
// batches and table references. These are the vocabulary every other module
// speaks; nothing here depends on planning or execution.

pub mod decimal;

pub use decimal::Decimal;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Unique identifier for a submitted query, assigned at submission.
pub type QueryId = u64;

/// Identity of the submitting principal, used for fair-share grouping.
pub type SubmitterId = String;

/// Maximum number of columns in a schema.
pub const MAX_SCHEMA_COLUMNS: usize = 1024;

/// Maximum nesting depth for array/struct column types.
pub const MAX_TYPE_NESTING_DEPTH: usize = 32;

/// Rows per batch produced by operators unless an adapter dictates otherwise.
pub const DEFAULT_BATCH_ROWS: usize = 1024;

// ============================================================================
// Table references
// ============================================================================

/// A fully qualified table reference: `source.table`. Used for name
/// resolution, cache dependency sets and invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub source: String,
    pub table: String,
}

impl TableRef {
    pub fn new(source: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            table: table.into(),
        }
    }

    /// Parse `source.table`; a bare name yields an empty source to be
    /// resolved later against registered namespaces.
    pub fn parse(qualified: &str) -> Self {
        match qualified.split_once('.') {
            Some((source, table)) => Self::new(source, table),
            None => Self::new("", qualified),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.source.is_empty() {
            write!(f, "{}", self.table)
        } else {
            write!(f, "{}.{}", self.source, self.table)
        }
    }
}

// ============================================================================
// Column types
// ============================================================================

/// Closed set of engine-native column types. Source-specific types are
/// normalized into this set by the adapter layer; anything unmappable becomes
/// `Unknown` and is carried as an opaque blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Decimal { precision: u8, scale: u32 },
    Utf8,
    Binary,
    Timestamp { tz: Option<String> },
    Date,
    Time,
    Interval,
    Json,
    Vector { dim: usize },
    Geometry,
    Array(Box<ColumnType>),
    Struct(Vec<(String, ColumnType)>),
    Unknown,
}

impl ColumnType {
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            ColumnType::Int8 | ColumnType::Int16 | ColumnType::Int32 | ColumnType::Int64
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, ColumnType::Float32 | ColumnType::Float64)
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer() || self.is_float() || matches!(self, ColumnType::Decimal { .. })
    }

    pub fn is_orderable(&self) -> bool {
        !matches!(
            self,
            ColumnType::Json
                | ColumnType::Vector { .. }
                | ColumnType::Geometry
                | ColumnType::Struct(_)
                | ColumnType::Unknown
        )
    }

    /// Result type of arithmetic between two numeric types.
    pub fn numeric_widen(&self, other: &ColumnType) -> ColumnType {
        use ColumnType::*;
        match (self, other) {
            (Decimal { .. }, _) | (_, Decimal { .. }) => match (self, other) {
                (
                    Decimal {
                        precision: p1,
                        scale: s1,
                    },
                    Decimal {
                        precision: p2,
                        scale: s2,
                    },
                ) => Decimal {
                    precision: *p1.max(p2),
                    scale: *s1.max(s2),
                },
                (d @ Decimal { .. }, _) | (_, d @ Decimal { .. }) => d.clone(),
                _ => unreachable!(),
            },
            (Float64, _) | (_, Float64) | (Float32, _) | (_, Float32) => Float64,
            _ => Int64,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Bool => write!(f, "bool"),
            ColumnType::Int8 => write!(f, "int8"),
            ColumnType::Int16 => write!(f, "int16"),
            ColumnType::Int32 => write!(f, "int32"),
            ColumnType::Int64 => write!(f, "int64"),
            ColumnType::Float32 => write!(f, "float32"),
            ColumnType::Float64 => write!(f, "float64"),
            ColumnType::Decimal { precision, scale } => {
                write!(f, "decimal({},{})", precision, scale)
            }
            ColumnType::Utf8 => write!(f, "utf8"),
            ColumnType::Binary => write!(f, "binary"),
            ColumnType::Timestamp { tz: Some(tz) } => write!(f, "timestamp({})", tz),
            ColumnType::Timestamp { tz: None } => write!(f, "timestamp"),
            ColumnType::Date => write!(f, "date"),
            ColumnType::Time => write!(f, "time"),
            ColumnType::Interval => write!(f, "interval"),
            ColumnType::Json => write!(f, "json"),
            ColumnType::Vector { dim } => write!(f, "vector({})", dim),
            ColumnType::Geometry => write!(f, "geometry"),
            ColumnType::Array(inner) => write!(f, "array<{}>", inner),
            ColumnType::Struct(fields) => {
                write!(f, "struct<")?;
                for (i, (name, ty)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", name, ty)?;
                }
                write!(f, ">")
            }
            ColumnType::Unknown => write!(f, "unknown"),
        }
    }
}

// ============================================================================
// Schema
// ============================================================================

/// A named, typed column within a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Relation (table or alias) the column came from, when known.
    pub relation: Option<String>,
    pub data_type: ColumnType,
    pub nullable: bool,
    /// Free-form tags (e.g. security classification labels).
    pub tags: Vec<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            relation: None,
            data_type,
            nullable,
            tags: Vec::new(),
        }
    }

    pub fn with_relation(mut self, relation: impl Into<String>) -> Self {
        self.relation = Some(relation.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Ordered list of columns. Shared between operators via `Arc`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Index of the first column matching `name` (unqualified).
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Resolve a possibly-qualified column reference. Returns all matching
    /// indices; resolution requires exactly one.
    pub fn resolve(&self, relation: Option<&str>, name: &str) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                c.name == name
                    && match relation {
                        Some(rel) => c.relation.as_deref() == Some(rel),
                        None => true,
                    }
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.index_of(name).map(|i| &self.columns[i])
    }

    /// Concatenate two schemas (join output shape: left then right).
    pub fn join(&self, other: &Schema) -> Schema {
        let mut columns = self.columns.clone();
        columns.extend(other.columns.iter().cloned());
        Schema::new(columns)
    }

    pub fn project(&self, indices: &[usize]) -> Schema {
        Schema::new(indices.iter().map(|&i| self.columns[i].clone()).collect())
    }
}

// ============================================================================
// Values
// ============================================================================

/// All data values the engine can hold. Float equality and hashing are
/// bit-exact so values can key hash tables; NULL sorts first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Decimal(Decimal),
    String(String),
    Bytes(Vec<u8>),
    /// Days since epoch
    Date(i64),
    /// Microseconds since midnight
    Time(i64),
    /// Microseconds since epoch
    Timestamp(i64),
    /// Microseconds
    Interval(i64),
    Json(serde_json::Value),
    Vector(Vec<f32>),
    Array(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Boolean(_) => "BOOLEAN",
            Value::Integer(_) => "INTEGER",
            Value::Float(_) => "FLOAT",
            Value::Decimal(_) => "DECIMAL",
            Value::String(_) => "STRING",
            Value::Bytes(_) => "BYTES",
            Value::Date(_) => "DATE",
            Value::Time(_) => "TIME",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Interval(_) => "INTERVAL",
            Value::Json(_) => "JSON",
            Value::Vector(_) => "VECTOR",
            Value::Array(_) => "ARRAY",
        }
    }

    /// Rough in-memory footprint, used for budget accounting.
    pub fn estimated_size(&self) -> usize {
        match self {
            Value::Null | Value::Boolean(_) => 1,
            Value::Integer(_)
            | Value::Float(_)
            | Value::Date(_)
            | Value::Time(_)
            | Value::Timestamp(_)
            | Value::Interval(_) => 8,
            Value::Decimal(_) => 24,
            Value::String(s) => s.len() + 24,
            Value::Bytes(b) => b.len() + 24,
            Value::Json(j) => j.to_string().len() + 32,
            Value::Vector(v) => v.len() * 4 + 24,
            Value::Array(a) => a.iter().map(|v| v.estimated_size()).sum::<usize>() + 24,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::String(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Date(d) => write!(f, "DATE({})", d),
            Value::Time(t) => write!(f, "TIME({})", t),
            Value::Timestamp(t) => write!(f, "TIMESTAMP({})", t),
            Value::Interval(i) => write!(f, "INTERVAL({})", i),
            Value::Json(j) => write!(f, "{}", j),
            Value::Vector(v) => write!(f, "[{} dims]", v.len()),
            Value::Array(a) => write!(f, "[{} items]", a.len()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Decimal(a), Value::Decimal(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Time(a), Value::Time(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Interval(a), Value::Interval(b)) => a == b,
            (Value::Json(a), Value::Json(b)) => a == b,
            (Value::Vector(a), Value::Vector(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Value::Array(a), Value::Array(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Boolean(b) => b.hash(state),
            Value::Integer(i) => i.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::Decimal(d) => d.hash(state),
            Value::String(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
            Value::Date(d) => d.hash(state),
            Value::Time(t) => t.hash(state),
            Value::Timestamp(t) => t.hash(state),
            Value::Interval(i) => i.hash(state),
            Value::Json(j) => j.to_string().hash(state),
            Value::Vector(v) => {
                for x in v {
                    x.to_bits().hash(state);
                }
            }
            Value::Array(a) => a.hash(state),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, _) => Some(Ordering::Less),
            (_, Value::Null) => Some(Ordering::Greater),
            (Value::Boolean(a), Value::Boolean(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.partial_cmp(b),
            (Value::Float(a), Value::Float(b)) => cmp_f64(*a, *b),
            (Value::Integer(a), Value::Float(b)) => cmp_f64(*a as f64, *b),
            (Value::Float(a), Value::Integer(b)) => cmp_f64(*a, *b as f64),
            (Value::Decimal(a), Value::Decimal(b)) => a.partial_cmp(b),
            (Value::Decimal(a), Value::Integer(b)) => a.partial_cmp(&Decimal::from_i64(*b)),
            (Value::Integer(a), Value::Decimal(b)) => Decimal::from_i64(*a).partial_cmp(b),
            (Value::Decimal(a), Value::Float(b)) => cmp_f64(a.to_f64(), *b),
            (Value::Float(a), Value::Decimal(b)) => cmp_f64(*a, b.to_f64()),
            (Value::String(a), Value::String(b)) => a.partial_cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.partial_cmp(b),
            (Value::Date(a), Value::Date(b)) => a.partial_cmp(b),
            (Value::Time(a), Value::Time(b)) => a.partial_cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.partial_cmp(b),
            (Value::Interval(a), Value::Interval(b)) => a.partial_cmp(b),
            (Value::Array(a), Value::Array(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

/// IEEE-754 comparison with a total order for NaN (NaN sorts greatest).
fn cmp_f64(a: f64, b: f64) -> Option<Ordering> {
    if a.is_nan() && b.is_nan() {
        Some(Ordering::Equal)
    } else if a.is_nan() {
        Some(Ordering::Greater)
    } else if b.is_nan() {
        Some(Ordering::Less)
    } else {
        a.partial_cmp(&b)
    }
}

// ============================================================================
// Rows and batches
// ============================================================================

pub type Row = Vec<Value>;

/// A batch of rows sharing one schema. The unit of flow between operators.
#[derive(Debug, Clone)]
pub struct Batch {
    pub schema: Arc<Schema>,
    pub rows: Vec<Row>,
}

impl Batch {
    pub fn new(schema: Arc<Schema>, rows: Vec<Row>) -> Self {
        Self { schema, rows }
    }

    pub fn empty(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn estimated_size(&self) -> usize {
        self.rows
            .iter()
            .map(|r| r.iter().map(|v| v.estimated_size()).sum::<usize>() + 24)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_ref_parse() {
        let t = TableRef::parse("pg.users");
        assert_eq!(t.source, "pg");
        assert_eq!(t.table, "users");
        assert_eq!(t.to_string(), "pg.users");

        let bare = TableRef::parse("users");
        assert_eq!(bare.source, "");
    }

    #[test]
    fn test_value_null_sorts_first() {
        assert_eq!(
            Value::Null.partial_cmp(&Value::Integer(-5)),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn test_cross_numeric_compare() {
        assert_eq!(
            Value::Integer(2).partial_cmp(&Value::Float(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Decimal(Decimal::new(25, 1)).partial_cmp(&Value::Integer(3)),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn test_float_hash_is_bit_exact() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(Value::Float(1.5));
        assert!(set.contains(&Value::Float(1.5)));
        assert!(!set.contains(&Value::Float(1.6)));
    }

    #[test]
    fn test_schema_resolve_qualified() {
        let schema = Schema::new(vec![
            Column::new("id", ColumnType::Int64, false).with_relation("users"),
            Column::new("id", ColumnType::Int64, false).with_relation("orders"),
        ]);
        assert_eq!(schema.resolve(Some("users"), "id"), vec![0]);
        assert_eq!(schema.resolve(None, "id").len(), 2);
    }

    #[test]
    fn test_numeric_widen() {
        assert_eq!(
            ColumnType::Int32.numeric_widen(&ColumnType::Float64),
            ColumnType::Float64
        );
        assert_eq!(
            ColumnType::Int64.numeric_widen(&ColumnType::Int8),
            ColumnType::Int64
        );
    }
}

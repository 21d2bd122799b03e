// # Source Adapter Contract
//
// The plugin boundary between the engine and heterogeneous sources. An
// adapter exposes capability discovery, schema introspection, optional cost
// estimation and subplan execution; the engine never sees a source-native
// type or wire format. Adapters normalize native types through the central
// mapping in this module; anything unmappable becomes `ColumnType::Unknown`
// and flows through as an opaque blob.

pub mod memory;

pub use memory::MemoryAdapter;

use crate::common::{Batch, ColumnType, Schema, TableRef};
use crate::error::{AdapterErrorKind, EngineError, Result};
use crate::plan::LogicalPlan;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Family a source belongs to. Drives type normalization defaults and
/// planner heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    Relational,
    TimeSeries,
    Vector,
    Document,
    Graph,
}

/// A named feature a source supports. Capability pushdown only wraps a
/// subtree in a `Federated` node when the target's capability set covers
/// every node in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    PredicatePushdown,
    ProjectionPushdown,
    Joins,
    Subqueries,
    Window,
    Aggregate,
    Sort,
    Limit,
    FullText,
    VectorKnn,
    TimeBucket,
    Transactions,
    CostEstimation,
    IndexLookup,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySet(HashSet<Capability>);

impl CapabilitySet {
    pub fn new(caps: impl IntoIterator<Item = Capability>) -> Self {
        Self(caps.into_iter().collect())
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }

    pub fn insert(&mut self, cap: Capability) {
        self.0.insert(cap);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }

    /// Whether this capability set covers a single plan node.
    pub fn covers(&self, node: &LogicalPlan) -> bool {
        match node {
            LogicalPlan::Scan { predicate, .. } => {
                predicate.is_none() || self.contains(Capability::PredicatePushdown)
            }
            LogicalPlan::Filter { .. } => self.contains(Capability::PredicatePushdown),
            LogicalPlan::Project { .. } => self.contains(Capability::ProjectionPushdown),
            LogicalPlan::Join { .. } => self.contains(Capability::Joins),
            LogicalPlan::Aggregate { .. } => self.contains(Capability::Aggregate),
            LogicalPlan::Window { .. } => self.contains(Capability::Window),
            LogicalPlan::Sort { .. } => self.contains(Capability::Sort),
            LogicalPlan::Limit { .. } => self.contains(Capability::Limit),
            LogicalPlan::Union { .. } => self.contains(Capability::Joins),
            LogicalPlan::Federated { .. } | LogicalPlan::Unsupported { .. } => false,
        }
    }
}

/// Per-source cost model inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostFactors {
    pub io_per_row: f64,
    pub cpu_per_row: f64,
    pub startup_cost: f64,
    pub parallelism: usize,
}

impl Default for CostFactors {
    fn default() -> Self {
        Self {
            io_per_row: 1.0,
            cpu_per_row: 0.1,
            startup_cost: 10.0,
            parallelism: 1,
        }
    }
}

/// Everything the planner needs to know about a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: String,
    pub kind: SourceKind,
    pub capabilities: CapabilitySet,
    pub cost_factors: CostFactors,
}

/// Estimated cost of running a subplan on a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub io: f64,
    pub cpu: f64,
    pub rows_out: u64,
}

impl CostEstimate {
    pub fn total(&self) -> f64 {
        self.io + self.cpu
    }

    pub fn combine(&self, other: &CostEstimate) -> CostEstimate {
        CostEstimate {
            io: self.io + other.io,
            cpu: self.cpu + other.cpu,
            rows_out: self.rows_out.max(other.rows_out),
        }
    }
}

/// Lazy sequence of row batches coming back from a source.
pub trait BatchStream: Send {
    fn next_batch(&mut self) -> Result<Option<Batch>>;
}

impl std::fmt::Debug for dyn BatchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn BatchStream")
    }
}

/// A fully materialized stream, for adapters that compute eagerly.
pub struct MaterializedStream {
    batches: std::collections::VecDeque<Batch>,
}

impl MaterializedStream {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self {
            batches: batches.into(),
        }
    }
}

impl BatchStream for MaterializedStream {
    fn next_batch(&mut self) -> Result<Option<Batch>> {
        Ok(self.batches.pop_front())
    }
}

/// The adapter contract. Implementations wrap one external source and are
/// shared across queries; they must be internally synchronized.
pub trait SourceAdapter: Send + Sync {
    fn descriptor(&self) -> SourceDescriptor;

    fn connect(&self) -> Result<()>;

    fn disconnect(&self) -> Result<()>;

    fn capabilities(&self) -> CapabilitySet {
        self.descriptor().capabilities
    }

    fn list_tables(&self) -> Result<Vec<TableRef>>;

    fn schema(&self, table: &str) -> Result<Schema>;

    /// Estimated row count of a base table, when the source keeps statistics.
    fn estimated_rows(&self, _table: &str) -> Option<u64> {
        None
    }

    /// Cost of executing `plan` on this source. `None` means the planner
    /// falls back to its own heuristics.
    fn estimate_cost(&self, _plan: &LogicalPlan) -> Option<CostEstimate> {
        None
    }

    /// Whether this adapter can execute `node` natively. Used during
    /// capability pushdown; the default consults the capability set.
    fn supports(&self, node: &LogicalPlan) -> bool {
        self.capabilities().covers(node)
    }

    /// Execute a single-source subplan, returning a lazy batch sequence.
    fn execute(&self, plan: &LogicalPlan) -> Result<Box<dyn BatchStream>>;

    /// Point lookup through a source-side index, used by the index join.
    fn index_lookup(
        &self,
        table: &str,
        _column: &str,
        _key: &crate::common::Value,
    ) -> Result<Vec<crate::common::Row>> {
        Err(EngineError::adapter(
            self.descriptor().id,
            AdapterErrorKind::Capability,
            format!("no index lookup on table '{}'", table),
        ))
    }
}

// ============================================================================
// Native type normalization
// ============================================================================

static NATIVE_TYPE_MAP: Lazy<HashMap<&'static str, ColumnType>> = Lazy::new(|| {
    let mut m = HashMap::new();
    // relational
    m.insert("boolean", ColumnType::Bool);
    m.insert("bool", ColumnType::Bool);
    m.insert("smallint", ColumnType::Int16);
    m.insert("int", ColumnType::Int32);
    m.insert("integer", ColumnType::Int32);
    m.insert("bigint", ColumnType::Int64);
    m.insert("real", ColumnType::Float32);
    m.insert("double precision", ColumnType::Float64);
    m.insert("double", ColumnType::Float64);
    m.insert("text", ColumnType::Utf8);
    m.insert("varchar", ColumnType::Utf8);
    m.insert("bytea", ColumnType::Binary);
    m.insert("blob", ColumnType::Binary);
    m.insert("date", ColumnType::Date);
    m.insert("time", ColumnType::Time);
    m.insert("timestamp", ColumnType::Timestamp { tz: None });
    m.insert(
        "timestamptz",
        ColumnType::Timestamp {
            tz: Some("UTC".to_string()),
        },
    );
    m.insert("interval", ColumnType::Interval);
    m.insert("json", ColumnType::Json);
    m.insert("jsonb", ColumnType::Json);
    m.insert("geometry", ColumnType::Geometry);
    m.insert("uuid", ColumnType::Utf8);
    m
});

/// Normalize a source-native type name into the engine's closed type set.
/// `vector(N)` and `decimal(p,s)` are parsed structurally; everything not in
/// the map becomes `Unknown`.
pub fn normalize_native_type(native: &str) -> ColumnType {
    let lowered = native.trim().to_lowercase();
    if let Some(dim) = parse_parenthesized(&lowered, "vector") {
        if let Ok(dim) = dim.parse::<usize>() {
            return ColumnType::Vector { dim };
        }
    }
    if let Some(args) = parse_parenthesized(&lowered, "decimal")
        .or_else(|| parse_parenthesized(&lowered, "numeric"))
    {
        let mut parts = args.split(',').map(str::trim);
        if let (Some(p), Some(s)) = (parts.next(), parts.next()) {
            if let (Ok(p), Ok(s)) = (p.parse::<u8>(), s.parse::<u32>()) {
                return ColumnType::Decimal {
                    precision: p,
                    scale: s,
                };
            }
        }
    }
    NATIVE_TYPE_MAP
        .get(lowered.as_str())
        .cloned()
        .unwrap_or(ColumnType::Unknown)
}

fn parse_parenthesized<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    s.strip_prefix(prefix)?
        .trim()
        .strip_prefix('(')?
        .strip_suffix(')')
}

// ============================================================================
// Registry
// ============================================================================

/// Registry of connected source adapters plus a lazily refreshed schema
/// snapshot per table. Schema entries are invalidated when an adapter signals
/// a schema change.
pub struct SourceRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn SourceAdapter>>>,
    schema_cache: RwLock<HashMap<(String, String), Schema>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
            schema_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Register and connect an adapter under its descriptor id.
    pub fn register(&self, adapter: Arc<dyn SourceAdapter>) -> Result<()> {
        adapter.connect()?;
        let id = adapter.descriptor().id;
        self.adapters.write().insert(id, adapter);
        Ok(())
    }

    pub fn adapter(&self, source: &str) -> Result<Arc<dyn SourceAdapter>> {
        self.adapters
            .read()
            .get(source)
            .cloned()
            .ok_or_else(|| EngineError::Planning(format!("unknown source '{}'", source)))
    }

    pub fn sources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Tables visible across all sources, used for resolution diagnostics.
    pub fn all_tables(&self) -> Vec<TableRef> {
        let mut out = Vec::new();
        for (_, adapter) in self.adapters.read().iter() {
            if let Ok(tables) = adapter.list_tables() {
                out.extend(tables);
            }
        }
        out.sort();
        out
    }

    /// Schema of `source.table`, from the snapshot cache or the adapter.
    pub fn schema_of(&self, source: &str, table: &str) -> Result<Schema> {
        let key = (source.to_string(), table.to_string());
        if let Some(schema) = self.schema_cache.read().get(&key) {
            return Ok(schema.clone());
        }
        let schema = self.adapter(source)?.schema(table)?;
        self.schema_cache.write().insert(key, schema.clone());
        Ok(schema)
    }

    /// Drop cached schemas for a source after it signalled a schema change.
    pub fn invalidate_schemas(&self, source: &str) {
        self.schema_cache
            .write()
            .retain(|(s, _), _| s != source);
    }

    pub fn estimated_rows(&self, source: &str, table: &str) -> Option<u64> {
        self.adapters
            .read()
            .get(source)
            .and_then(|a| a.estimated_rows(table))
    }

    pub fn capabilities(&self, source: &str) -> Result<CapabilitySet> {
        Ok(self.adapter(source)?.capabilities())
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::plan::TableSchemas for SourceRegistry {
    fn table_schema(&self, source: &str, table: &str) -> Result<Schema> {
        self.schema_of(source, table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_known_types() {
        assert_eq!(normalize_native_type("BIGINT"), ColumnType::Int64);
        assert_eq!(
            normalize_native_type("vector(384)"),
            ColumnType::Vector { dim: 384 }
        );
        assert_eq!(
            normalize_native_type("decimal(10, 2)"),
            ColumnType::Decimal {
                precision: 10,
                scale: 2
            }
        );
    }

    #[test]
    fn test_unknown_types_are_opaque() {
        assert_eq!(normalize_native_type("hyperloglog"), ColumnType::Unknown);
    }

    #[test]
    fn test_capability_covers() {
        let caps = CapabilitySet::new([Capability::PredicatePushdown, Capability::Limit]);
        let filter = LogicalPlan::Filter {
            input: Arc::new(LogicalPlan::Scan {
                source: "s".into(),
                table: "t".into(),
                projection: None,
                predicate: None,
            }),
            predicate: crate::plan::Expr::literal(crate::common::Value::Boolean(true)),
        };
        assert!(caps.covers(&filter));
        let window = LogicalPlan::Window {
            input: Arc::new(LogicalPlan::Scan {
                source: "s".into(),
                table: "t".into(),
                projection: None,
                predicate: None,
            }),
            partition_keys: vec![],
            order_keys: vec![],
            frame: Default::default(),
            functions: vec![],
        };
        assert!(!caps.covers(&window));
    }
}

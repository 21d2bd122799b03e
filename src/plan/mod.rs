// # Plan Model
//
// Immutable logical plan trees with structural sharing, the expression
// language, canonicalization and fingerprinting.

pub mod canonical;
pub mod expr;
pub mod node;

pub use canonical::{canonicalize, canonicalize_expr, fingerprint, node_id, Fingerprint};
pub use expr::{
    AggExpr, AggFunc, BinaryOp, Expr, FrameBound, SortKey, UnaryOp, WindowExpr, WindowFrame,
    WindowFunc,
};
pub use node::{JoinHint, JoinType, LogicalPlan, TableSchemas};

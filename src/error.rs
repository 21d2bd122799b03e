use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Category of adapter failure, as reported by a source adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterErrorKind {
    /// Connection establishment or loss (transient)
    Connection,
    /// Adapter-side timeout (transient)
    Timeout,
    /// Schema introspection failure or schema mismatch
    Schema,
    /// The source rejected the subplan it was handed
    Query,
    /// The subplan requires a capability the source does not have
    Capability,
}

impl fmt::Display for AdapterErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterErrorKind::Connection => write!(f, "connection"),
            AdapterErrorKind::Timeout => write!(f, "timeout"),
            AdapterErrorKind::Schema => write!(f, "schema"),
            AdapterErrorKind::Query => write!(f, "query"),
            AdapterErrorKind::Capability => write!(f, "capability"),
        }
    }
}

/// Pipeline stage an error originated from. Carried on the user-visible
/// failure so callers can tell a bad query from a bad source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorStage {
    Parse,
    Validation,
    Planning,
    Federation,
    Execution,
    Adapter,
    Cache,
    Resource,
    Security,
    Internal,
}

impl fmt::Display for ErrorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorStage::Parse => "parse",
            ErrorStage::Validation => "validation",
            ErrorStage::Planning => "planning",
            ErrorStage::Federation => "federation",
            ErrorStage::Execution => "execution",
            ErrorStage::Adapter => "adapter",
            ErrorStage::Cache => "cache",
            ErrorStage::Resource => "resource",
            ErrorStage::Security => "security",
            ErrorStage::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

/// Engine error. A closed sum: every failure the engine can surface is one of
/// these variants, each with a stable code (see [`EngineError::code`]).
/// Retriability is an explicit property, not a type hierarchy.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("parse error at position {position}: expected {expected}, found {found}")]
    Parse {
        position: usize,
        expected: String,
        found: String,
    },

    #[error("unresolved name '{name}' (candidates: {})", candidates.join(", "))]
    Resolution {
        name: String,
        candidates: Vec<String>,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("planning error: {0}")]
    Planning(String),

    #[error("no registered source supports {0}")]
    UnsupportedCapability(String),

    #[error("{category} error on source '{source_name}': {message}")]
    Adapter {
        source_name: String,
        category: AdapterErrorKind,
        message: String,
    },

    #[error("execution error: {0}")]
    Execution(String),

    #[error("arithmetic error: {0}")]
    Arithmetic(String),

    #[error("cannot coerce {from} to {to}")]
    Coercion { from: String, to: String },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("admission queue full ({0} waiting)")]
    AdmissionQueueFull(usize),

    #[error("admission timed out after {0:?}")]
    AdmissionTimeout(Duration),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("security policy violation: {0}")]
    PolicyViolation(String),

    #[error("query cancelled")]
    Cancelled,

    #[error("query deadline exceeded")]
    Timeout,

    #[error("cache error: {0}")]
    Cache(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable error code. Codes never change meaning across releases; new
    /// variants get new codes.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Parse { .. } => "LF-PARSE-001",
            EngineError::Resolution { .. } => "LF-PARSE-002",
            EngineError::Validation(_) => "LF-VALID-001",
            EngineError::TypeMismatch(_) => "LF-VALID-002",
            EngineError::Planning(_) => "LF-PLAN-001",
            EngineError::UnsupportedCapability(_) => "LF-PLAN-002",
            EngineError::Adapter { category, .. } => match category {
                AdapterErrorKind::Connection => "LF-ADPT-001",
                AdapterErrorKind::Timeout => "LF-ADPT-002",
                AdapterErrorKind::Schema => "LF-ADPT-003",
                AdapterErrorKind::Query => "LF-ADPT-004",
                AdapterErrorKind::Capability => "LF-ADPT-005",
            },
            EngineError::Execution(_) => "LF-EXEC-001",
            EngineError::Arithmetic(_) => "LF-EXEC-002",
            EngineError::Coercion { .. } => "LF-EXEC-003",
            EngineError::ResourceExhausted(_) => "LF-RSRC-001",
            EngineError::AdmissionQueueFull(_) => "LF-RSRC-002",
            EngineError::AdmissionTimeout(_) => "LF-RSRC-003",
            EngineError::Unauthenticated(_) => "LF-SEC-001",
            EngineError::Unauthorized(_) => "LF-SEC-002",
            EngineError::PolicyViolation(_) => "LF-SEC-003",
            EngineError::Cancelled => "LF-CANCEL-001",
            EngineError::Timeout => "LF-CANCEL-002",
            EngineError::Cache(_) => "LF-CACHE-001",
            EngineError::Internal(_) => "LF-INT-001",
        }
    }

    /// Whether the caller may usefully retry the whole query.
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            EngineError::Adapter {
                category: AdapterErrorKind::Connection | AdapterErrorKind::Timeout,
                ..
            } | EngineError::AdmissionQueueFull(_)
                | EngineError::AdmissionTimeout(_)
                | EngineError::ResourceExhausted(_)
        )
    }

    /// Whether the engine itself retries this error internally (transient
    /// adapter failures, bounded by the query deadline).
    pub fn transient(&self) -> bool {
        matches!(
            self,
            EngineError::Adapter {
                category: AdapterErrorKind::Connection | AdapterErrorKind::Timeout,
                ..
            }
        )
    }

    pub fn stage(&self) -> ErrorStage {
        match self {
            EngineError::Parse { .. } | EngineError::Resolution { .. } => ErrorStage::Parse,
            EngineError::Validation(_) | EngineError::TypeMismatch(_) => ErrorStage::Validation,
            EngineError::Planning(_) | EngineError::UnsupportedCapability(_) => {
                ErrorStage::Planning
            }
            EngineError::Adapter { .. } => ErrorStage::Adapter,
            EngineError::Execution(_)
            | EngineError::Arithmetic(_)
            | EngineError::Coercion { .. }
            | EngineError::Cancelled
            | EngineError::Timeout => ErrorStage::Execution,
            EngineError::ResourceExhausted(_)
            | EngineError::AdmissionQueueFull(_)
            | EngineError::AdmissionTimeout(_) => ErrorStage::Resource,
            EngineError::Unauthenticated(_)
            | EngineError::Unauthorized(_)
            | EngineError::PolicyViolation(_) => ErrorStage::Security,
            EngineError::Cache(_) => ErrorStage::Cache,
            EngineError::Internal(_) => ErrorStage::Internal,
        }
    }

    pub fn adapter(source: impl Into<String>, category: AdapterErrorKind, message: impl Into<String>) -> Self {
        EngineError::Adapter {
            source_name: source.into(),
            category,
            message: message.into(),
        }
    }
}

/// The single structured failure a query surfaces to the caller. Internal
/// errors are logged with full context elsewhere and reach the caller as an
/// opaque code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryFailure {
    pub code: String,
    pub message: String,
    pub stage: ErrorStage,
    pub retriable: bool,
    pub context: HashMap<String, String>,
}

impl From<EngineError> for QueryFailure {
    fn from(err: EngineError) -> Self {
        let mut context = HashMap::new();
        if let EngineError::Adapter {
            source_name, category, ..
        } = &err
        {
            context.insert("source".to_string(), source_name.clone());
            context.insert("category".to_string(), category.to_string());
        }
        let message = match &err {
            EngineError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        QueryFailure {
            code: err.code().to_string(),
            message,
            stage: err.stage(),
            retriable: err.retriable(),
            context,
        }
    }
}

impl fmt::Display for QueryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} (stage: {})", self.code, self.message, self.stage)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Validation(format!("malformed JSON plan: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable_per_variant() {
        let e = EngineError::Parse {
            position: 3,
            expected: "FROM".into(),
            found: "FORM".into(),
        };
        assert_eq!(e.code(), "LF-PARSE-001");
        assert_eq!(e.stage(), ErrorStage::Parse);
        assert!(!e.retriable());
    }

    #[test]
    fn test_transient_adapter_errors_retry() {
        let e = EngineError::adapter("pg", AdapterErrorKind::Connection, "reset by peer");
        assert!(e.transient());
        assert!(e.retriable());

        let e = EngineError::adapter("pg", AdapterErrorKind::Schema, "column gone");
        assert!(!e.transient());
        assert!(!e.retriable());
    }

    #[test]
    fn test_internal_errors_are_opaque_to_callers() {
        let failure = QueryFailure::from(EngineError::Internal("lock poisoned at foo.rs:42".into()));
        assert_eq!(failure.message, "internal error");
        assert_eq!(failure.code, "LF-INT-001");
    }

    #[test]
    fn test_adapter_failure_carries_context() {
        let failure = QueryFailure::from(EngineError::adapter(
            "tsdb",
            AdapterErrorKind::Timeout,
            "deadline",
        ));
        assert_eq!(failure.context.get("source").unwrap(), "tsdb");
        assert!(failure.retriable);
    }
}

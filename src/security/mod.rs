// # Security Enforcer
//
// Plan-time enforcement: scans gain policy row predicates, and columns the
// caller may not see are masked or rejected. Execution-time enforcement:
// output schemas are re-checked so no operator can unmask a column. Every
// access decision is audited; decisions fail closed on any ambiguity.

pub mod audit;

pub use audit::{AuditEvent, AuditLog, AuditAction, Decision};

use crate::adapter::SourceRegistry;
use crate::common::{ColumnType, Schema, TableRef, Value};
use crate::error::{EngineError, Result};
use crate::plan::{Expr, LogicalPlan};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Totally ordered privilege labels.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum AccessLevel {
    #[default]
    None,
    Read,
    Write,
    Admin,
    System,
}

/// The caller's identity, carried in the query context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub subject: String,
    pub roles: Vec<String>,
    pub access_level: AccessLevel,
    pub session_id: String,
    pub client_ip: Option<String>,
    /// Attributes substituted into policy predicates (e.g. `caller_id`).
    pub attributes: HashMap<String, Value>,
}

impl Identity {
    pub fn new(subject: impl Into<String>, access_level: AccessLevel) -> Self {
        let subject = subject.into();
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            subject,
            roles: Vec::new(),
            access_level,
            client_ip: None,
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }
}

/// How a restricted column presents to non-privileged callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaskRule {
    /// Replaced with a fixed redaction marker (NULL for non-text columns).
    Redact,
    /// Replaced with NULL.
    Null,
    /// Referencing the column at all is an authorization failure.
    Deny,
}

/// Access policy for one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub resource: TableRef,
    pub required_level: AccessLevel,
    /// column name → mask applied below this level
    pub masking: HashMap<String, MaskRule>,
    /// Injected into scans for callers below `row_predicate_exempt_level`.
    /// May reference identity attributes via `caller_attribute('name')`.
    pub row_predicate: Option<Expr>,
    pub row_predicate_exempt_level: AccessLevel,
    /// Masking is skipped at or above this level.
    pub masking_exempt_level: AccessLevel,
}

impl SecurityPolicy {
    pub fn new(resource: TableRef, required_level: AccessLevel) -> Self {
        Self {
            resource,
            required_level,
            masking: HashMap::new(),
            row_predicate: None,
            row_predicate_exempt_level: AccessLevel::Admin,
            masking_exempt_level: AccessLevel::Admin,
        }
    }

    pub fn with_row_predicate(mut self, predicate: Expr) -> Self {
        self.row_predicate = Some(predicate);
        self
    }

    pub fn with_mask(mut self, column: impl Into<String>, rule: MaskRule) -> Self {
        self.masking.insert(column.into(), rule);
        self
    }
}

pub struct SecurityEnforcer {
    registry: Arc<SourceRegistry>,
    policies: RwLock<HashMap<TableRef, SecurityPolicy>>,
    audit: Arc<AuditLog>,
}

impl SecurityEnforcer {
    pub fn new(registry: Arc<SourceRegistry>, audit: Arc<AuditLog>) -> Self {
        Self {
            registry,
            policies: RwLock::new(HashMap::new()),
            audit,
        }
    }

    pub fn audit_log(&self) -> Arc<AuditLog> {
        Arc::clone(&self.audit)
    }

    pub fn install_policy(&self, policy: SecurityPolicy) {
        self.policies.write().insert(policy.resource.clone(), policy);
    }

    /// Rewrite a plan per policy before optimization: inject row predicates
    /// and masking projections, and reject references to denied columns.
    pub fn authorize_plan(
        &self,
        plan: &Arc<LogicalPlan>,
        identity: &Identity,
    ) -> Result<Arc<LogicalPlan>> {
        if identity.access_level < AccessLevel::Read {
            self.audit.record(
                identity,
                "*",
                AuditAction::Query,
                Decision::Deny,
            );
            return Err(EngineError::Unauthorized(
                "read access required to run queries".into(),
            ));
        }

        let policies = self.policies.read();
        let result = plan.transform_up(&|node: Arc<LogicalPlan>| {
            let LogicalPlan::Scan { source, table, .. } = node.as_ref() else {
                return Ok(node);
            };
            let table_ref = TableRef::new(source.clone(), table.clone());
            let Some(policy) = policies.get(&table_ref) else {
                self.audit
                    .record(identity, &table_ref.to_string(), AuditAction::Read, Decision::Allow);
                return Ok(node);
            };

            if identity.access_level < policy.required_level {
                self.audit
                    .record(identity, &table_ref.to_string(), AuditAction::Read, Decision::Deny);
                return Err(EngineError::Unauthorized(format!(
                    "access to {} requires {:?}",
                    table_ref, policy.required_level
                )));
            }

            let mut rewritten = node.as_ref().clone();

            // row-level predicate for non-exempt callers
            if identity.access_level < policy.row_predicate_exempt_level {
                if let Some(template) = &policy.row_predicate {
                    let bound = bind_policy_predicate(template, identity)?;
                    if let LogicalPlan::Scan { predicate, .. } = &mut rewritten {
                        *predicate = match predicate.take() {
                            Some(existing) => Some(Expr::and(existing, bound)),
                            None => Some(bound),
                        };
                    }
                }
            }

            let mut result = Arc::new(rewritten);

            // column masking for non-exempt callers
            if identity.access_level < policy.masking_exempt_level && !policy.masking.is_empty() {
                result = self.apply_masking(&result, &table_ref, policy)?;
            }

            self.audit
                .record(identity, &table_ref.to_string(), AuditAction::Read, Decision::Allow);
            Ok(result)
        });

        match result {
            Ok(plan) => Ok(plan),
            Err(err) => {
                // anything ambiguous during rewriting denies access
                match err {
                    e @ (EngineError::Unauthorized(_)
                    | EngineError::Unauthenticated(_)
                    | EngineError::PolicyViolation(_)) => Err(e),
                    other => {
                        tracing::warn!(error = %other, "security rewrite failed; failing closed");
                        Err(EngineError::PolicyViolation(format!(
                            "could not prove access is allowed: {}",
                            other
                        )))
                    }
                }
            }
        }
    }

    /// Wrap a scan in a projection that replaces masked columns and fails on
    /// denied ones.
    fn apply_masking(
        &self,
        scan: &Arc<LogicalPlan>,
        table_ref: &TableRef,
        policy: &SecurityPolicy,
    ) -> Result<Arc<LogicalPlan>> {
        let schema = scan.output_schema(self.registry.as_ref())?;
        let mut exprs = Vec::with_capacity(schema.len());
        for col in &schema.columns {
            let expr = match policy.masking.get(&col.name) {
                Some(MaskRule::Deny) => {
                    return Err(EngineError::Unauthorized(format!(
                        "column {}.{} is not accessible",
                        table_ref, col.name
                    )))
                }
                Some(MaskRule::Redact) => mask_expr(&col.data_type),
                Some(MaskRule::Null) => Expr::Cast {
                    expr: Box::new(Expr::literal(Value::Null)),
                    to: col.data_type.clone(),
                },
                None => Expr::Column {
                    relation: col.relation.clone(),
                    name: col.name.clone(),
                },
            };
            exprs.push((expr, col.name.clone()));
        }
        Ok(Arc::new(LogicalPlan::Project {
            input: Arc::clone(scan),
            exprs,
        }))
    }

    /// Execution-time check: operators must not have reintroduced a denied
    /// column into the output.
    pub fn validate_output(&self, schema: &Schema, identity: &Identity) -> Result<()> {
        if identity.access_level >= AccessLevel::Admin {
            return Ok(());
        }
        let policies = self.policies.read();
        for policy in policies.values() {
            for (column, rule) in &policy.masking {
                if *rule == MaskRule::Deny {
                    let leaked = schema.columns.iter().any(|c| {
                        c.name == *column
                            && c.relation.as_deref() == Some(policy.resource.table.as_str())
                    });
                    if leaked {
                        self.audit.record(
                            identity,
                            &policy.resource.to_string(),
                            AuditAction::Read,
                            Decision::Deny,
                        );
                        return Err(EngineError::PolicyViolation(format!(
                            "denied column {} present in output",
                            column
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Replace `caller_attribute('name')` calls with the caller's attribute
/// values. A missing attribute fails closed.
fn bind_policy_predicate(template: &Expr, identity: &Identity) -> Result<Expr> {
    Ok(match template {
        Expr::Call { func, args } if func == "caller_attribute" => {
            let name = match args.as_slice() {
                [Expr::Literal(Value::String(name))] => name,
                _ => {
                    return Err(EngineError::PolicyViolation(
                        "caller_attribute takes one literal name".into(),
                    ))
                }
            };
            let value = identity.attributes.get(name).ok_or_else(|| {
                EngineError::PolicyViolation(format!(
                    "caller attribute '{}' unavailable; denying access",
                    name
                ))
            })?;
            Expr::literal(value.clone())
        }
        Expr::BinaryOp { left, op, right } => Expr::binary(
            bind_policy_predicate(left, identity)?,
            *op,
            bind_policy_predicate(right, identity)?,
        ),
        Expr::UnaryOp { op, expr } => Expr::UnaryOp {
            op: *op,
            expr: Box::new(bind_policy_predicate(expr, identity)?),
        },
        Expr::Call { func, args } => Expr::Call {
            func: func.clone(),
            args: args
                .iter()
                .map(|a| bind_policy_predicate(a, identity))
                .collect::<Result<_>>()?,
        },
        other => other.clone(),
    })
}

fn mask_expr(data_type: &ColumnType) -> Expr {
    match data_type {
        ColumnType::Utf8 => Expr::literal(Value::String("[redacted]".into())),
        other => Expr::Cast {
            expr: Box::new(Expr::literal(Value::Null)),
            to: other.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{MemoryAdapter, SourceKind};
    use crate::common::Column;
    use crate::plan::BinaryOp;

    fn setup() -> (SecurityEnforcer, Arc<LogicalPlan>) {
        let registry = Arc::new(SourceRegistry::new());
        let pg = MemoryAdapter::new("pg", SourceKind::Relational);
        pg.add_table(
            "accounts",
            Schema::new(vec![
                Column::new("user_id", ColumnType::Int64, false),
                Column::new("balance", ColumnType::Float64, true),
                Column::new("ssn", ColumnType::Utf8, true),
            ]),
            vec![],
        );
        registry.register(Arc::new(pg)).unwrap();
        let enforcer = SecurityEnforcer::new(registry, Arc::new(AuditLog::new(128, true)));
        let scan = Arc::new(LogicalPlan::Scan {
            source: "pg".into(),
            table: "accounts".into(),
            projection: None,
            predicate: None,
        });
        (enforcer, scan)
    }

    fn own_rows_policy() -> SecurityPolicy {
        SecurityPolicy::new(TableRef::new("pg", "accounts"), AccessLevel::Read)
            .with_row_predicate(Expr::binary(
                Expr::column("user_id"),
                BinaryOp::Eq,
                Expr::Call {
                    func: "caller_attribute".into(),
                    args: vec![Expr::literal(Value::String("caller_id".into()))],
                },
            ))
    }

    #[test]
    fn test_row_predicate_injected_for_non_admin() {
        let (enforcer, scan) = setup();
        enforcer.install_policy(own_rows_policy());
        let identity = Identity::new("alice", AccessLevel::Read)
            .with_attribute("caller_id", Value::Integer(7));
        let rewritten = enforcer.authorize_plan(&scan, &identity).unwrap();
        match rewritten.as_ref() {
            LogicalPlan::Scan {
                predicate: Some(pred),
                ..
            } => {
                assert!(pred.to_string().contains("user_id"));
                assert!(pred.to_string().contains('7'));
            }
            other => panic!("expected scan with predicate, got {}", other.name()),
        }
    }

    #[test]
    fn test_admin_exempt_from_row_predicate() {
        let (enforcer, scan) = setup();
        enforcer.install_policy(own_rows_policy());
        let identity = Identity::new("root", AccessLevel::Admin);
        let rewritten = enforcer.authorize_plan(&scan, &identity).unwrap();
        assert!(matches!(
            rewritten.as_ref(),
            LogicalPlan::Scan { predicate: None, .. }
        ));
    }

    #[test]
    fn test_missing_attribute_fails_closed() {
        let (enforcer, scan) = setup();
        enforcer.install_policy(own_rows_policy());
        let identity = Identity::new("alice", AccessLevel::Read);
        assert!(matches!(
            enforcer.authorize_plan(&scan, &identity),
            Err(EngineError::PolicyViolation(_))
        ));
    }

    #[test]
    fn test_insufficient_level_denied_and_audited() {
        let (enforcer, scan) = setup();
        enforcer.install_policy(SecurityPolicy::new(
            TableRef::new("pg", "accounts"),
            AccessLevel::Write,
        ));
        let identity = Identity::new("alice", AccessLevel::Read);
        assert!(matches!(
            enforcer.authorize_plan(&scan, &identity),
            Err(EngineError::Unauthorized(_))
        ));
        let events = enforcer.audit_log().recent(10);
        assert!(events
            .iter()
            .any(|e| e.decision == Decision::Deny && e.resource == "pg.accounts"));
    }

    #[test]
    fn test_masking_wraps_scan() {
        let (enforcer, scan) = setup();
        enforcer.install_policy(
            SecurityPolicy::new(TableRef::new("pg", "accounts"), AccessLevel::Read)
                .with_mask("ssn", MaskRule::Redact),
        );
        let identity = Identity::new("alice", AccessLevel::Read);
        let rewritten = enforcer.authorize_plan(&scan, &identity).unwrap();
        match rewritten.as_ref() {
            LogicalPlan::Project { exprs, .. } => {
                let ssn = exprs.iter().find(|(_, name)| name == "ssn").unwrap();
                assert!(matches!(&ssn.0, Expr::Literal(Value::String(s)) if s == "[redacted]"));
            }
            other => panic!("expected masking projection, got {}", other.name()),
        }
    }

    #[test]
    fn test_denied_column_rejects_query() {
        let (enforcer, scan) = setup();
        enforcer.install_policy(
            SecurityPolicy::new(TableRef::new("pg", "accounts"), AccessLevel::Read)
                .with_mask("ssn", MaskRule::Deny),
        );
        let identity = Identity::new("alice", AccessLevel::Read);
        assert!(matches!(
            enforcer.authorize_plan(&scan, &identity),
            Err(EngineError::Unauthorized(_))
        ));
    }
}

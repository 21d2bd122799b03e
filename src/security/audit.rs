// Audit trail: every access decision lands here and in the structured log.
// The in-memory ring is bounded; external archival consumes the tracing
// stream.

use crate::security::Identity;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    Query,
    Read,
    CacheInvalidate,
    PolicyChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub subject: String,
    pub resource: String,
    pub action: AuditAction,
    pub decision: Decision,
    pub session_id: String,
}

pub struct AuditLog {
    ring: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
    enabled: bool,
}

impl AuditLog {
    pub fn new(capacity: usize, enabled: bool) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            enabled,
        }
    }

    pub fn record(
        &self,
        identity: &Identity,
        resource: &str,
        action: AuditAction,
        decision: Decision,
    ) {
        if !self.enabled {
            return;
        }
        let event = AuditEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            subject: identity.subject.clone(),
            resource: resource.to_string(),
            action,
            decision,
            session_id: identity.session_id.clone(),
        };
        tracing::info!(
            subject = %event.subject,
            resource = %event.resource,
            action = ?event.action,
            decision = ?event.decision,
            session_id = %event.session_id,
            "audit"
        );
        let mut ring = self.ring.lock();
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(event);
    }

    /// The most recent `n` events, newest last.
    pub fn recent(&self, n: usize) -> Vec<AuditEvent> {
        let ring = self.ring.lock();
        ring.iter().rev().take(n).rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::AccessLevel;

    #[test]
    fn test_ring_is_bounded() {
        let log = AuditLog::new(3, true);
        let identity = Identity::new("alice", AccessLevel::Read);
        for i in 0..5 {
            log.record(
                &identity,
                &format!("t{}", i),
                AuditAction::Read,
                Decision::Allow,
            );
        }
        assert_eq!(log.len(), 3);
        let recent = log.recent(10);
        assert_eq!(recent.first().unwrap().resource, "t2");
        assert_eq!(recent.last().unwrap().resource, "t4");
    }

    #[test]
    fn test_disabled_log_records_nothing() {
        let log = AuditLog::new(3, false);
        let identity = Identity::new("alice", AccessLevel::Read);
        log.record(&identity, "t", AuditAction::Read, Decision::Allow);
        assert!(log.is_empty());
    }
}

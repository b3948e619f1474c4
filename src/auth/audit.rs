use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::info;

use super::CallerIdentity;
use crate::observability::logging::redact_ip;

/// Where an authorization decision came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Cache,
    Store,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionSource::Cache => "cache",
            DecisionSource::Store => "store",
        }
    }
}

impl fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub trace_id: String,
    pub user_id: String,
    pub caller_ip: String,
    pub allowed: bool,
    /// Reason code when not allowed
    pub reason: Option<&'static str>,
    pub source: DecisionSource,
    pub duration_ms: u64,
}

impl AuditEntry {
    pub fn new(
        caller: &CallerIdentity,
        reason: Option<&'static str>,
        source: DecisionSource,
        duration: Duration,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            trace_id: caller.trace_id.clone(),
            user_id: caller.user_id.clone(),
            caller_ip: redact_ip(&caller.caller_ip),
            allowed: reason.is_none(),
            reason,
            source,
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Emit the audit line for one decision; `reason` is `None` when allowed
pub fn audit_authorization_decision(
    caller: &CallerIdentity,
    reason: Option<&'static str>,
    source: DecisionSource,
    duration: Duration,
) -> AuditEntry {
    let entry = AuditEntry::new(caller, reason, source, duration);

    info!(
        target: "audit",
        audit_type = "authorization",
        trace_id = %entry.trace_id,
        user_id = %entry.user_id,
        caller_ip = %entry.caller_ip,
        allowed = entry.allowed,
        reason = entry.reason.unwrap_or("-"),
        source = %entry.source,
        duration_ms = entry.duration_ms,
        "Authorization decision"
    );

    entry
}

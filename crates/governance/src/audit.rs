use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::storage::AuditStore;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Auth,
    Rate,
    Path,
    Tool,
    Provider,
    Session,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::Auth => "auth",
            AuditCategory::Rate => "rate",
            AuditCategory::Path => "path",
            AuditCategory::Tool => "tool",
            AuditCategory::Provider => "provider",
            AuditCategory::Session => "session",
        }
    }
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Allowed,
    Denied,
    Succeeded,
    Failed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub identity: String,
    pub category: AuditCategory,
    pub outcome: AuditOutcome,
    pub risk_level: RiskLevel,
    pub detail: String,
}

struct Cursor {
    sequence: u64,
    last_timestamp: Option<DateTime<Utc>>,
}

/// Append-only record of security-relevant actions.
///
/// Events are numbered and timestamped under one lock so that sequence order
/// is also timestamp order, even if the wall clock steps backwards. The
/// store write happens after the lock is released; stores order events by
/// sequence.
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
    clock: Arc<dyn Clock>,
    cursor: Mutex<Cursor>,
}

impl AuditLog {
    /// Numbering continues after the highest sequence already stored.
    pub fn new(store: Arc<dyn AuditStore>, clock: Arc<dyn Clock>) -> Self {
        let sequence = store.last_sequence().unwrap_or_else(|err| {
            warn!(error = %err, "audit sequence lookup failed, numbering from zero");
            0
        });
        Self {
            store,
            clock,
            cursor: Mutex::new(Cursor {
                sequence,
                last_timestamp: None,
            }),
        }
    }

    pub fn shared(store: Arc<dyn AuditStore>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self::new(store, clock))
    }

    pub fn record(
        &self,
        identity: &str,
        category: AuditCategory,
        outcome: AuditOutcome,
        risk_level: RiskLevel,
        detail: impl Into<String>,
    ) -> AuditEvent {
        let (sequence, timestamp) = {
            let mut cursor = self.cursor.lock();
            cursor.sequence += 1;
            let now = self.clock.now();
            let timestamp = match cursor.last_timestamp {
                Some(last) if last > now => last,
                _ => now,
            };
            cursor.last_timestamp = Some(timestamp);
            (cursor.sequence, timestamp)
        };
        let event = AuditEvent {
            sequence,
            timestamp,
            identity: identity.to_string(),
            category,
            outcome,
            risk_level,
            detail: detail.into(),
        };
        if let Err(err) = self.store.append(&event) {
            warn!(sequence = event.sequence, error = %err, "audit append failed");
        }

        match outcome {
            AuditOutcome::Allowed | AuditOutcome::Succeeded => info!(
                target: "audit",
                identity = %event.identity,
                category = %event.category,
                outcome = ?event.outcome,
                risk = ?event.risk_level,
                detail = %event.detail,
                "audit event"
            ),
            AuditOutcome::Denied | AuditOutcome::Failed => warn!(
                target: "audit",
                identity = %event.identity,
                category = %event.category,
                outcome = ?event.outcome,
                risk = ?event.risk_level,
                detail = %event.detail,
                "audit event"
            ),
        }
        event
    }

    /// Most recent events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        match self.store.recent(limit) {
            Ok(events) => events,
            Err(err) => {
                warn!(error = %err, "audit read failed");
                Vec::new()
            }
        }
    }
}

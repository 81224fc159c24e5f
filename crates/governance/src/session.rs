use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::BackendKind;
use crate::tools::ToolInvocationRecord;

/// One request/response exchange within a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Turn {
    pub sequence: u64,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub prompt: String,
    pub response: String,
    pub backend: BackendKind,
    pub cost: f64,
    pub tool_invocations: Vec<ToolInvocationRecord>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Durable conversational state for one identity in one working directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub identity: String,
    pub working_directory: PathBuf,
    pub backend_in_use: Option<BackendKind>,
    /// Backend the caller asked for; tried first while its circuit allows.
    #[serde(default)]
    pub preferred_backend: Option<BackendKind>,
    pub turn_history: Vec<Turn>,
    /// Turns ever recorded, including ones trimmed from `turn_history`.
    pub turn_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub accumulated_cost: f64,
    /// Set by an explicit close. Closed sessions are never resumed.
    #[serde(default)]
    pub closed: bool,
}

impl Session {
    pub fn new(
        session_id: String,
        identity: String,
        working_directory: PathBuf,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            identity,
            working_directory,
            backend_in_use: None,
            preferred_backend: None,
            turn_history: Vec::new(),
            turn_count: 0,
            created_at: now,
            last_active_at: now,
            accumulated_cost: 0.0,
            closed: false,
        }
    }

    /// Appends `turn`, keeping at most `max_history` turns in memory.
    pub fn record_turn(&mut self, mut turn: Turn, max_history: usize) -> &Turn {
        self.turn_count += 1;
        turn.sequence = self.turn_count;
        self.accumulated_cost += turn.cost;
        self.last_active_at = turn.completed_at;
        self.backend_in_use = Some(turn.backend);
        self.turn_history.push(turn);
        if max_history > 0 && self.turn_history.len() > max_history {
            let excess = self.turn_history.len() - max_history;
            self.turn_history.drain(..excess);
        }
        &self.turn_history[self.turn_history.len() - 1]
    }

    pub fn find_turn_by_key(&self, key: &str) -> Option<&Turn> {
        self.turn_history
            .iter()
            .rev()
            .find(|turn| turn.idempotency_key.as_deref() == Some(key))
    }

    pub fn is_idle(&self, now: DateTime<Utc>, idle_timeout: chrono::Duration) -> bool {
        now - self.last_active_at >= idle_timeout
    }

    /// Approved tool invocations per tool name across the retained history.
    pub fn tool_usage(&self) -> BTreeMap<String, u64> {
        let mut usage = BTreeMap::new();
        for record in self
            .turn_history
            .iter()
            .flat_map(|turn| turn.tool_invocations.iter())
            .filter(|record| record.allowed)
        {
            *usage.entry(record.tool_name.clone()).or_insert(0) += 1;
        }
        usage
    }
}

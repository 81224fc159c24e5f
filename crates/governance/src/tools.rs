use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::audit::{AuditCategory, AuditLog, AuditOutcome, RiskLevel};
use crate::clock::Clock;
use crate::config::{ToolConfig, ToolListConfig};
use crate::sandbox::PathSandbox;

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
    pub struct ToolTiers: u8 {
        const READ_ONLY = 0b001;
        const MUTATING = 0b010;
        const EXECUTION = 0b100;
    }
}

/// Tier of a tool by name. Unknown tools are treated as execution-capable.
pub fn classify(tool_name: &str) -> ToolTiers {
    match tool_name {
        "Read" | "Grep" | "Glob" | "LS" | "NotebookRead" | "WebFetch" | "WebSearch"
        | "TodoRead" => ToolTiers::READ_ONLY,
        "Write" | "Edit" | "MultiEdit" | "NotebookEdit" | "TodoWrite" => ToolTiers::MUTATING,
        _ => ToolTiers::EXECUTION,
    }
}

fn requires_path(tool_name: &str) -> bool {
    matches!(
        tool_name,
        "Read" | "Write" | "Edit" | "MultiEdit" | "NotebookRead" | "NotebookEdit"
    )
}

const PATH_ARGUMENTS: [&str; 5] = ["path", "file_path", "notebook_path", "directory", "cwd"];

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    NotWhitelisted,
    ExplicitlyDisallowed,
    PathEscape,
    MissingPath,
    DangerousCommand,
}

impl DenialReason {
    fn risk(&self) -> RiskLevel {
        match self {
            DenialReason::MissingPath => RiskLevel::Low,
            DenialReason::NotWhitelisted | DenialReason::ExplicitlyDisallowed => RiskLevel::Medium,
            DenialReason::PathEscape | DenialReason::DangerousCommand => RiskLevel::High,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolInvocationRecord {
    pub tool_name: String,
    pub arguments_digest: String,
    pub allowed: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub denial: Option<DenialReason>,
}

#[derive(Clone, Debug, Default)]
pub struct ToolPolicy {
    pub allow: HashSet<String>,
    pub deny: HashSet<String>,
}

impl ToolPolicy {
    fn from_lists(allowed: &[String], disallowed: &[String]) -> Self {
        Self {
            allow: allowed.iter().cloned().collect(),
            deny: disallowed.iter().cloned().collect(),
        }
    }

    pub fn denies(&self, name: &str) -> bool {
        self.deny.contains(name)
    }

    pub fn allows(&self, name: &str) -> bool {
        self.allow.contains(name) && !self.denies(name)
    }
}

/// Where a tool call is allowed to reach.
#[derive(Clone, Copy, Debug)]
pub struct ToolScope<'a> {
    pub identity: &'a str,
    pub working_directory: &'a Path,
    pub approved_root: &'a Path,
}

pub struct ToolMonitor {
    default_policy: ToolPolicy,
    identity_policies: HashMap<String, ToolPolicy>,
    dangerous_patterns: Vec<Regex>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl ToolMonitor {
    pub fn new(
        config: &ToolConfig,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, regex::Error> {
        let dangerous_patterns = config
            .dangerous_patterns
            .iter()
            .map(|pattern| RegexBuilder::new(pattern).case_insensitive(true).build())
            .collect::<Result<Vec<_>, _>>()?;
        let identity_policies = config
            .identities
            .iter()
            .map(|(identity, lists): (&String, &ToolListConfig)| {
                (
                    identity.clone(),
                    ToolPolicy::from_lists(&lists.allowed, &lists.disallowed),
                )
            })
            .collect();
        Ok(Self {
            default_policy: ToolPolicy::from_lists(&config.allowed, &config.disallowed),
            identity_policies,
            dangerous_patterns,
            audit,
            clock,
        })
    }

    fn policy_for(&self, identity: &str) -> &ToolPolicy {
        self.identity_policies
            .get(identity)
            .unwrap_or(&self.default_policy)
    }

    pub fn is_tool_allowed(&self, identity: &str, tool_name: &str) -> bool {
        self.policy_for(identity).allows(tool_name)
    }

    /// Decides whether a backend may run `tool_name` with `arguments`.
    /// Denials are returned as records with `allowed == false`, never as
    /// errors, and are always audited.
    pub fn authorize_tool(
        &self,
        scope: &ToolScope<'_>,
        tool_name: &str,
        arguments: &Value,
    ) -> ToolInvocationRecord {
        let tier = classify(tool_name);
        let verdict = self.evaluate(scope, tool_name, tier, arguments);
        let record = ToolInvocationRecord {
            tool_name: tool_name.to_string(),
            arguments_digest: digest_arguments(arguments),
            allowed: verdict.is_ok(),
            timestamp: self.clock.now(),
            denial: verdict.as_ref().err().map(|(reason, _)| *reason),
        };

        match verdict {
            Ok(()) => {
                if tier.intersects(ToolTiers::MUTATING | ToolTiers::EXECUTION) {
                    self.audit.record(
                        scope.identity,
                        AuditCategory::Tool,
                        AuditOutcome::Allowed,
                        RiskLevel::Low,
                        format!("tool {tool_name} approved"),
                    );
                } else {
                    debug!(identity = scope.identity, tool = tool_name, "tool approved");
                }
            }
            Err((reason, detail)) => {
                self.audit.record(
                    scope.identity,
                    AuditCategory::Tool,
                    AuditOutcome::Denied,
                    reason.risk(),
                    format!("tool {tool_name} denied: {detail}"),
                );
            }
        }
        record
    }

    fn evaluate(
        &self,
        scope: &ToolScope<'_>,
        tool_name: &str,
        tier: ToolTiers,
        arguments: &Value,
    ) -> Result<(), (DenialReason, String)> {
        let policy = self.policy_for(scope.identity);
        if policy.denies(tool_name) {
            return Err((
                DenialReason::ExplicitlyDisallowed,
                "explicitly disallowed".to_string(),
            ));
        }
        if !policy.allows(tool_name) {
            return Err((DenialReason::NotWhitelisted, "not in whitelist".to_string()));
        }

        let paths: Vec<&str> = PATH_ARGUMENTS
            .iter()
            .filter_map(|key| arguments.get(*key).and_then(Value::as_str))
            .collect();
        if paths.is_empty() && requires_path(tool_name) {
            return Err((DenialReason::MissingPath, "file path required".to_string()));
        }
        for path in paths {
            if let Err(err) =
                PathSandbox::resolve_from(path, scope.working_directory, scope.approved_root)
            {
                return Err((DenialReason::PathEscape, err.to_string()));
            }
        }

        if tier.contains(ToolTiers::EXECUTION) {
            if let Some(command) = arguments.get("command").and_then(Value::as_str) {
                if let Some(pattern) = self
                    .dangerous_patterns
                    .iter()
                    .find(|pattern| pattern.is_match(command))
                {
                    return Err((
                        DenialReason::DangerousCommand,
                        format!("dangerous command pattern `{}`", pattern.as_str()),
                    ));
                }
            }
        }
        Ok(())
    }
}

pub fn digest_arguments(arguments: &Value) -> String {
    let payload = serde_json::to_vec(arguments).unwrap_or_default();
    hex::encode(Sha256::digest(&payload))
}

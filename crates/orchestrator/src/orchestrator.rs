use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use governance::{
    AuditCategory, AuditLog, AuditOutcome, BackendKind, HealthStore, ProviderConfig,
    ProviderHealth, RiskLevel, ToolInvocationRecord, ToolMonitor, ToolScope,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError, BackendEvent, BackendRequest};
use crate::cancel::CancelSignal;
use crate::error::RelayError;
use crate::selector::{BackendSelector, SelectionExclusions};

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub timeout: Duration,
    pub max_switches: u32,
}

impl From<&ProviderConfig> for OrchestratorConfig {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            timeout: config.timeout(),
            max_switches: config.max_switches,
        }
    }
}

/// A turn served to completion.
#[derive(Clone, Debug, Serialize)]
pub struct Execution {
    pub backend: BackendKind,
    pub content: String,
    pub cost: f64,
    pub tool_invocations: Vec<ToolInvocationRecord>,
    pub attempts: u32,
}

enum StreamEnd {
    Completed {
        content: String,
        cost: f64,
        tools: Vec<ToolInvocationRecord>,
    },
    Denied(ToolInvocationRecord),
}

/// Result of one backend attempt.
enum AttemptOutcome {
    Succeeded {
        content: String,
        cost: f64,
        tools: Vec<ToolInvocationRecord>,
    },
    Retryable(BackendError),
    Terminal(RelayError),
}

/// Executes a turn against the configured backends with fallback.
///
/// Each request walks SELECTING → EXECUTING → {SUCCEEDED, FAILED_RETRYABLE,
/// FAILED_TERMINAL}. A retryable failure excludes the backend for the rest of
/// the request and re-enters selection, at most `max_switches` times.
pub struct ProviderOrchestrator {
    config: OrchestratorConfig,
    backends: HashMap<BackendKind, Arc<dyn Backend>>,
    selector: BackendSelector,
    health: Arc<dyn HealthStore>,
    tools: Arc<ToolMonitor>,
    audit: Arc<AuditLog>,
}

impl ProviderOrchestrator {
    pub fn new(
        config: &ProviderConfig,
        backends: Vec<Arc<dyn Backend>>,
        health: Arc<dyn HealthStore>,
        tools: Arc<ToolMonitor>,
        audit: Arc<AuditLog>,
    ) -> Self {
        let backends: HashMap<BackendKind, Arc<dyn Backend>> = backends
            .into_iter()
            .map(|backend| (backend.kind(), backend))
            .collect();
        let order: Vec<BackendKind> = config
            .order
            .iter()
            .copied()
            .filter(|kind| {
                let registered = backends.contains_key(kind);
                if !registered {
                    warn!(backend = %kind, "configured backend has no implementation");
                }
                registered
            })
            .collect();
        info!(order = ?order, "backend priority order");
        Self {
            config: OrchestratorConfig::from(config),
            selector: BackendSelector::new(order, health.clone()),
            backends,
            health,
            tools,
            audit,
        }
    }

    pub fn health_report(&self) -> Vec<ProviderHealth> {
        self.selector
            .order()
            .iter()
            .map(|kind| self.health.snapshot(*kind))
            .collect()
    }

    pub async fn execute(
        &self,
        request: &BackendRequest,
        scope: &ToolScope<'_>,
        cancel: &mut CancelSignal,
    ) -> Result<Execution, RelayError> {
        let mut exclusions = SelectionExclusions::default();
        let mut attempts: u32 = 0;
        let mut last_error: Option<(BackendKind, BackendError)> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(RelayError::Cancelled { executing: false });
            }
            let Ok(kind) = self.selector.select(request.preferred_backend, &exclusions) else {
                break;
            };
            let Some(backend) = self.backends.get(&kind) else {
                exclusions.backends.insert(kind);
                continue;
            };
            attempts += 1;
            debug!(session = %request.session_id, backend = %kind, attempt = attempts, "backend selected");

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(session = %request.session_id, backend = %kind, "cancelled while executing");
                    return Err(RelayError::Cancelled { executing: true });
                }
                outcome = self.attempt(backend.as_ref(), request, scope) => outcome,
            };

            match outcome {
                AttemptOutcome::Succeeded {
                    content,
                    cost,
                    tools,
                } => {
                    self.health.record_success(kind);
                    debug!(session = %request.session_id, backend = %kind, cost, "backend succeeded");
                    return Ok(Execution {
                        backend: kind,
                        content,
                        cost,
                        tool_invocations: tools,
                        attempts,
                    });
                }
                AttemptOutcome::Terminal(err) => {
                    warn!(session = %request.session_id, backend = %kind, error = %err, "terminal backend failure");
                    return Err(err);
                }
                AttemptOutcome::Retryable(err) => {
                    let opened = self.health.record_failure(kind);
                    warn!(
                        session = %request.session_id,
                        backend = %kind,
                        error_kind = err.kind(),
                        error = %err,
                        circuit_opened = opened,
                        "backend attempt failed"
                    );
                    self.audit.record(
                        &request.identity,
                        AuditCategory::Provider,
                        AuditOutcome::Failed,
                        if opened { RiskLevel::Medium } else { RiskLevel::Low },
                        format!("backend {kind} failed: {err}"),
                    );
                    exclusions.backends.insert(kind);
                    last_error = Some((kind, err));
                    if attempts > self.config.max_switches {
                        break;
                    }
                }
            }
        }

        Err(match last_error {
            Some((backend, BackendError::Timeout(_))) => {
                RelayError::ProviderTimeout { backend, attempts }
            }
            Some((_, err)) => RelayError::ProviderFailure {
                attempts,
                detail: err.to_string(),
            },
            None => RelayError::ProviderFailure {
                attempts,
                detail: "no available backend".to_string(),
            },
        })
    }

    async fn attempt(
        &self,
        backend: &dyn Backend,
        request: &BackendRequest,
        scope: &ToolScope<'_>,
    ) -> AttemptOutcome {
        let kind = backend.kind();
        let consumed =
            tokio::time::timeout(self.config.timeout, self.consume(backend, request, scope)).await;
        match consumed {
            Err(_) => AttemptOutcome::Retryable(BackendError::Timeout(format!(
                "no reply within {}ms",
                self.config.timeout.as_millis()
            ))),
            Ok(Err(err)) if err.is_retryable() => AttemptOutcome::Retryable(err),
            Ok(Err(err)) => AttemptOutcome::Terminal(RelayError::from_backend(kind, err)),
            Ok(Ok(StreamEnd::Denied(record))) => AttemptOutcome::Terminal(RelayError::ToolDenied {
                tool: record.tool_name,
                reason: record.denial,
            }),
            Ok(Ok(StreamEnd::Completed {
                content,
                cost,
                tools,
            })) => AttemptOutcome::Succeeded {
                content,
                cost,
                tools,
            },
        }
    }

    /// Drains the backend's event stream, passing every tool request through
    /// the tool monitor before it is accepted.
    async fn consume(
        &self,
        backend: &dyn Backend,
        request: &BackendRequest,
        scope: &ToolScope<'_>,
    ) -> Result<StreamEnd, BackendError> {
        let mut events = backend.invoke(request).await?;
        let mut content = String::new();
        let mut cost = 0.0;
        let mut tools = Vec::new();
        while let Some(event) = events.next().await {
            match event? {
                BackendEvent::Text { text } => content.push_str(&text),
                BackendEvent::Usage { cost: reported } => {
                    if reported.is_finite() && reported > 0.0 {
                        cost += reported;
                    }
                }
                BackendEvent::ToolUse { name, arguments } => {
                    let record = self.tools.authorize_tool(scope, &name, &arguments);
                    if !record.allowed {
                        // Dropping the stream stops the backend from going further.
                        return Ok(StreamEnd::Denied(record));
                    }
                    tools.push(record);
                }
            }
        }
        Ok(StreamEnd::Completed {
            content,
            cost,
            tools,
        })
    }
}

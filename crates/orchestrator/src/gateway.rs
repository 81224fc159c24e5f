use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use governance::{
    AuditCategory, AuditEvent, AuditLog, AuditOutcome, AuthGate, AuthorizationContext,
    BackendKind, BudgetSnapshot, CircuitBreakerConfig, Clock, GovernanceConfig, InMemoryHealthStore,
    ProviderHealth, RateGovernor, RiskLevel, Session, Storage, ToolMonitor, Turn,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::Backend;
use crate::cancel::CancelSignal;
use crate::coordinator::{SessionCoordinator, TurnRequest, TurnResult};
use crate::cost::estimate_cost;
use crate::error::RelayError;
use crate::orchestrator::ProviderOrchestrator;

/// A message as delivered by the chat transport.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct InboundRequest {
    pub identity: String,
    #[serde(default)]
    pub token: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub has_attachment: bool,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Backend to try first for this session.
    #[serde(default)]
    pub backend: Option<BackendKind>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TurnOutcome {
    pub session_id: String,
    pub turn: Turn,
    pub replayed: bool,
    pub budget: BudgetSnapshot,
}

/// Runs the full request path: authenticate, admit, attach to a session,
/// execute, settle, audit.
pub struct Gateway {
    auth: Arc<AuthGate>,
    rate: Arc<RateGovernor>,
    sessions: Arc<SessionCoordinator>,
    audit: Arc<AuditLog>,
}

impl Gateway {
    pub fn new(
        auth: Arc<AuthGate>,
        rate: Arc<RateGovernor>,
        sessions: Arc<SessionCoordinator>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            auth,
            rate,
            sessions,
            audit,
        }
    }

    /// Wires every component from one configuration and one storage backend.
    pub fn build<S: Storage + 'static>(
        config: &GovernanceConfig,
        storage: Arc<S>,
        backends: Vec<Arc<dyn Backend>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RelayError> {
        let audit = AuditLog::shared(storage.clone(), clock.clone());
        let auth = Arc::new(AuthGate::new(
            config,
            storage.clone(),
            audit.clone(),
            clock.clone(),
        )?);
        let rate = RateGovernor::shared(&config.rate_limit, audit.clone(), clock.clone());
        let tools = ToolMonitor::new(&config.tools, audit.clone(), clock.clone())
            .map_err(|err| RelayError::Configuration(err.to_string()))?;
        let health = InMemoryHealthStore::shared(
            CircuitBreakerConfig::from(&config.providers),
            clock.clone(),
        );
        let orchestrator = Arc::new(ProviderOrchestrator::new(
            &config.providers,
            backends,
            health,
            Arc::new(tools),
            audit.clone(),
        ));
        let sessions = Arc::new(SessionCoordinator::new(
            config.sessions.clone(),
            orchestrator,
            storage,
            audit.clone(),
            clock,
        ));
        Ok(Self::new(auth, rate, sessions, audit))
    }

    pub fn auth(&self) -> &Arc<AuthGate> {
        &self.auth
    }

    pub fn rate(&self) -> &Arc<RateGovernor> {
        &self.rate
    }

    pub fn sessions(&self) -> &Arc<SessionCoordinator> {
        &self.sessions
    }

    pub async fn handle(
        &self,
        request: InboundRequest,
        cancel: CancelSignal,
    ) -> Result<TurnOutcome, RelayError> {
        // Gate and governor audit their own refusals.
        let context = self
            .auth
            .authenticate(&request.identity, request.token.as_deref())?;
        let estimate = estimate_cost(&request.prompt, request.has_attachment);
        let permit = self.rate.admit(&context.identity, estimate)?;

        let (session_id, result) = match self.run_turn(&context, request, cancel).await {
            Ok(done) => done,
            Err(err) => {
                if err.charges_estimate() {
                    if let Err(settle_err) = self.rate.settle(&permit, permit.estimated_cost()) {
                        warn!(identity = %context.identity, error = %settle_err, "settle failed");
                    }
                }
                return Err(self.fail(&context.identity, err));
            }
        };

        if result.replayed {
            // Dropping the permit refunds the estimate.
            drop(permit);
        } else if let Err(err) = self.rate.settle(&permit, result.turn.cost) {
            warn!(identity = %context.identity, error = %err, "settle failed");
        }
        self.audit.record(
            &context.identity,
            AuditCategory::Provider,
            AuditOutcome::Succeeded,
            RiskLevel::Low,
            format!(
                "turn {} of session {} served by {} at cost {:.4}{}",
                result.turn.sequence,
                session_id,
                result.turn.backend,
                result.turn.cost,
                if result.replayed { " (replayed)" } else { "" }
            ),
        );
        Ok(TurnOutcome {
            session_id,
            turn: result.turn,
            replayed: result.replayed,
            budget: self.rate.budget(&context.identity),
        })
    }

    async fn run_turn(
        &self,
        context: &AuthorizationContext,
        request: InboundRequest,
        cancel: CancelSignal,
    ) -> Result<(String, TurnResult), RelayError> {
        let session = self
            .sessions
            .open(context, request.working_directory.as_deref())?;
        let turn = TurnRequest {
            prompt: request.prompt,
            has_attachment: request.has_attachment,
            idempotency_key: request.idempotency_key,
            backend: request.backend,
        };
        let result = self
            .sessions
            .submit_turn(&session.session_id, turn, cancel)
            .await?;
        Ok((session.session_id, result))
    }

    /// Records `err` in the audit log and hands it back for returning.
    fn fail(&self, identity: &str, err: RelayError) -> RelayError {
        // Tool denials are audited by the monitor when they happen.
        if !matches!(err, RelayError::ToolDenied { .. }) {
            let outcome = match err.category() {
                AuditCategory::Provider | AuditCategory::Session => AuditOutcome::Failed,
                _ => AuditOutcome::Denied,
            };
            self.audit
                .record(identity, err.category(), outcome, err.risk(), err.to_string());
        }
        warn!(identity, error_kind = err.kind(), error = %err, "request failed");
        err
    }

    /// Closes `session_id` on behalf of its owner.
    pub async fn close_session(
        &self,
        identity: &str,
        token: Option<&str>,
        session_id: &str,
    ) -> Result<Session, RelayError> {
        let context = self.auth.authenticate(identity, token)?;
        let owned = self
            .sessions
            .get(session_id)
            .map(|session| session.identity == context.identity);
        let result = match owned {
            None => Err(RelayError::SessionNotFound(session_id.to_string())),
            Some(false) => Err(RelayError::Authorization(format!(
                "session {session_id} belongs to another identity"
            ))),
            Some(true) => self.sessions.close(session_id).await,
        };
        result.map_err(|err| self.fail(identity, err))
    }

    pub fn issue_token(&self, identity: &str, ttl: Option<Duration>) -> Result<String, RelayError> {
        Ok(self.auth.issue_token(identity, ttl)?)
    }

    pub fn revoke_tokens(&self, identity: &str) -> Result<usize, RelayError> {
        Ok(self.auth.revoke_tokens(identity)?)
    }

    pub fn recent_audit(&self, limit: usize) -> Vec<AuditEvent> {
        self.audit.recent(limit)
    }

    pub fn provider_health(&self) -> Vec<ProviderHealth> {
        self.sessions.orchestrator().health_report()
    }

    pub fn budget(&self, identity: &str) -> BudgetSnapshot {
        self.rate.budget(identity)
    }

    pub fn shutdown(&self) -> usize {
        let flushed = self.sessions.shutdown();
        info!(flushed, "gateway shut down");
        flushed
    }
}

//! Session lifecycle and turn serialization.
//!
//! Each live session has two locks. The state mutex guards the session data
//! and is only held for short, synchronous updates. The turn gate is a FIFO
//! async mutex held for the whole turn, so turns on one session run strictly
//! one after another in arrival order. Neither is held while storage is
//! written; flushes go through a separate per-session flush lock so writes
//! reach storage in order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use governance::{
    to_delta, AuditCategory, AuditLog, AuditOutcome, AuthorizationContext, BackendKind, Clock,
    PathSandbox,
    RiskLevel, Session, SessionConfig, SessionStore, ToolScope, Turn,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as TurnGate, MutexGuard as TurnGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::BackendRequest;
use crate::cancel::CancelSignal;
use crate::error::RelayError;
use crate::orchestrator::ProviderOrchestrator;

/// A turn as submitted by the caller.
#[derive(Clone, Debug, Default)]
pub struct TurnRequest {
    pub prompt: String,
    pub has_attachment: bool,
    pub idempotency_key: Option<String>,
    /// Becomes the session's preferred backend for this and later turns.
    pub backend: Option<BackendKind>,
}

#[derive(Clone, Debug)]
pub struct TurnResult {
    pub turn: Turn,
    /// True when an earlier turn with the same idempotency key was returned.
    pub replayed: bool,
}

struct LiveSession {
    state: Mutex<Session>,
    turn_gate: TurnGate<()>,
    flush_lock: Mutex<()>,
    approved_root: PathBuf,
    closed: AtomicBool,
}

impl LiveSession {
    fn new(session: Session, approved_root: PathBuf) -> Self {
        Self {
            state: Mutex::new(session),
            turn_gate: TurnGate::new(()),
            flush_lock: Mutex::new(()),
            approved_root,
            closed: AtomicBool::new(false),
        }
    }

    fn snapshot(&self) -> Session {
        self.state.lock().clone()
    }
}

pub struct SessionCoordinator {
    config: SessionConfig,
    orchestrator: Arc<ProviderOrchestrator>,
    store: Arc<dyn SessionStore>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    live: RwLock<HashMap<String, Arc<LiveSession>>>,
    by_identity: RwLock<HashMap<String, String>>,
}

impl SessionCoordinator {
    pub fn new(
        config: SessionConfig,
        orchestrator: Arc<ProviderOrchestrator>,
        store: Arc<dyn SessionStore>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            orchestrator,
            store,
            audit,
            clock,
            live: RwLock::new(HashMap::new()),
            by_identity: RwLock::new(HashMap::new()),
        }
    }

    pub fn orchestrator(&self) -> &Arc<ProviderOrchestrator> {
        &self.orchestrator
    }

    fn live_for_identity(&self, identity: &str) -> Option<Arc<LiveSession>> {
        let session_id = self.by_identity.read().get(identity).cloned()?;
        self.live.read().get(&session_id).cloned()
    }

    /// Creates or resumes the identity's session. A requested working
    /// directory is validated and becomes the session's directory; otherwise
    /// a resumed session's stored directory is re-validated against the
    /// current approved root.
    pub fn open(
        &self,
        context: &AuthorizationContext,
        working_directory: Option<&Path>,
    ) -> Result<Session, RelayError> {
        let requested = working_directory
            .map(|path| PathSandbox::resolve(path, &context.approved_root))
            .transpose()?;

        if let Some(live) = self.live_for_identity(&context.identity) {
            if live.approved_root == context.approved_root {
                let session = {
                    let mut state = live.state.lock();
                    if let Some(path) = &requested {
                        state.working_directory = path.clone();
                    }
                    state.clone()
                };
                if requested.is_none() {
                    revalidate(&session, &context.approved_root)?;
                }
                return Ok(session);
            }
            // The identity's root changed since the session went live.
            self.evict(&live, "approved root changed");
        }

        let (mut session, resumed) = match self.store.latest_session_for(&context.identity)? {
            Some(stored) => (stored, true),
            None => {
                let working_directory = match &requested {
                    Some(path) => path.clone(),
                    None => PathSandbox::resolve(&context.approved_root, &context.approved_root)?,
                };
                let session = Session::new(
                    Uuid::new_v4().to_string(),
                    context.identity.clone(),
                    working_directory,
                    self.clock.now(),
                );
                (session, false)
            }
        };
        if resumed {
            match &requested {
                Some(path) => session.working_directory = path.clone(),
                None => revalidate(&session, &context.approved_root)?,
            }
        }

        let live = Arc::new(LiveSession::new(session, context.approved_root.clone()));
        let live = {
            let mut sessions = self.live.write();
            let mut index = self.by_identity.write();
            let existing = index
                .get(&context.identity)
                .and_then(|session_id| sessions.get(session_id))
                .cloned();
            match existing {
                // Lost a race with a concurrent open for the same identity.
                Some(existing) => existing,
                None => {
                    let session_id = live.state.lock().session_id.clone();
                    index.insert(context.identity.clone(), session_id.clone());
                    sessions.insert(session_id, live.clone());
                    live
                }
            }
        };

        self.flush(&live)?;
        let session = live.snapshot();
        self.audit.record(
            &context.identity,
            AuditCategory::Session,
            AuditOutcome::Allowed,
            RiskLevel::Low,
            format!(
                "session {} {}",
                session.session_id,
                if resumed { "resumed" } else { "opened" }
            ),
        );
        info!(
            identity = %context.identity,
            session = %session.session_id,
            resumed,
            working_directory = %session.working_directory.display(),
            "session ready"
        );
        Ok(session)
    }

    async fn acquire_turn<'a>(
        &self,
        live: &'a LiveSession,
        session_id: &str,
    ) -> Result<TurnGuard<'a, ()>, RelayError> {
        match self.config.turn_wait() {
            None => live
                .turn_gate
                .try_lock()
                .map_err(|_| RelayError::SessionConflict(session_id.to_string())),
            Some(wait) => tokio::time::timeout(wait, live.turn_gate.lock())
                .await
                .map_err(|_| RelayError::SessionConflict(session_id.to_string())),
        }
    }

    /// Runs one turn on `session_id`. Only one turn per session is in flight;
    /// a concurrent submission waits its turn or is rejected, per
    /// configuration.
    pub async fn submit_turn(
        &self,
        session_id: &str,
        request: TurnRequest,
        mut cancel: CancelSignal,
    ) -> Result<TurnResult, RelayError> {
        let live = self
            .live
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))?;

        let guard = self.acquire_turn(&live, session_id).await?;
        if live.closed.load(Ordering::Acquire) {
            return Err(RelayError::SessionNotFound(session_id.to_string()));
        }

        let (identity, working_directory, preferred_backend, replay) = {
            let mut state = live.state.lock();
            let replay = request
                .idempotency_key
                .as_deref()
                .and_then(|key| state.find_turn_by_key(key))
                .cloned();
            if replay.is_none() && request.backend.is_some() {
                state.preferred_backend = request.backend;
            }
            (
                state.identity.clone(),
                state.working_directory.clone(),
                state.preferred_backend,
                replay,
            )
        };
        if let Some(turn) = replay {
            debug!(session = session_id, sequence = turn.sequence, "idempotent replay");
            return Ok(TurnResult {
                turn,
                replayed: true,
            });
        }

        let backend_request = BackendRequest {
            session_id: session_id.to_string(),
            identity: identity.clone(),
            working_directory: working_directory.clone(),
            prompt: request.prompt.clone(),
            has_attachment: request.has_attachment,
            preferred_backend,
        };
        let scope = ToolScope {
            identity: &identity,
            working_directory: &working_directory,
            approved_root: &live.approved_root,
        };
        let started_at = self.clock.now();
        let execution = self
            .orchestrator
            .execute(&backend_request, &scope, &mut cancel)
            .await?;
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled { executing: true });
        }

        let turn = Turn {
            sequence: 0,
            idempotency_key: request.idempotency_key,
            prompt: request.prompt,
            response: execution.content,
            backend: execution.backend,
            cost: execution.cost,
            tool_invocations: execution.tool_invocations,
            started_at,
            completed_at: self.clock.now(),
        };
        let turn = live
            .state
            .lock()
            .record_turn(turn, self.config.max_history)
            .clone();
        drop(guard);

        if let Err(err) = self.flush(&live) {
            warn!(session = session_id, error = %err, "session flush after turn failed");
        }
        Ok(TurnResult {
            turn,
            replayed: false,
        })
    }

    fn flush(&self, live: &LiveSession) -> Result<(), RelayError> {
        let _order = live.flush_lock.lock();
        let session = live.snapshot();
        self.store.save_session(&session)?;
        Ok(())
    }

    fn remove(&self, live: &LiveSession, session_id: &str, identity: &str) {
        live.closed.store(true, Ordering::Release);
        self.live.write().remove(session_id);
        let mut index = self.by_identity.write();
        if index.get(identity).map(String::as_str) == Some(session_id) {
            index.remove(identity);
        }
    }

    fn evict(&self, live: &LiveSession, reason: &str) {
        let (session_id, identity) = {
            let state = live.state.lock();
            (state.session_id.clone(), state.identity.clone())
        };
        self.remove(live, &session_id, &identity);
        if let Err(err) = self.flush(live) {
            warn!(session = %session_id, error = %err, "session flush on eviction failed");
        }
        info!(session = %session_id, identity = %identity, reason, "session evicted");
    }

    /// Closes a session after any in-flight turn finishes, flushing it to
    /// storage first.
    pub async fn close(&self, session_id: &str) -> Result<Session, RelayError> {
        let live = self
            .live
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))?;
        let guard = live.turn_gate.lock().await;
        let identity = {
            let mut state = live.state.lock();
            state.closed = true;
            state.identity.clone()
        };
        self.remove(&live, session_id, &identity);
        drop(guard);

        self.flush(&live)?;
        self.audit.record(
            &identity,
            AuditCategory::Session,
            AuditOutcome::Succeeded,
            RiskLevel::Low,
            format!("session {session_id} closed"),
        );
        Ok(live.snapshot())
    }

    /// Evicts sessions idle for longer than the configured timeout. Sessions
    /// with a turn in flight are skipped. Returns how many were evicted.
    pub fn sweep_idle(&self) -> usize {
        let now = self.clock.now();
        let idle_timeout = to_delta(self.config.idle_timeout());
        let candidates: Vec<Arc<LiveSession>> = self.live.read().values().cloned().collect();
        let mut evicted = 0;
        for live in candidates {
            let Ok(guard) = live.turn_gate.try_lock() else {
                continue;
            };
            if !live.state.lock().is_idle(now, idle_timeout) {
                continue;
            }
            let (session_id, identity) = {
                let state = live.state.lock();
                (state.session_id.clone(), state.identity.clone())
            };
            self.remove(&live, &session_id, &identity);
            drop(guard);
            if let Err(err) = self.flush(&live) {
                warn!(session = %session_id, error = %err, "session flush on eviction failed");
            }
            self.audit.record(
                &identity,
                AuditCategory::Session,
                AuditOutcome::Succeeded,
                RiskLevel::Low,
                format!("session {session_id} evicted after idle timeout"),
            );
            evicted += 1;
        }
        if evicted > 0 {
            info!(evicted, remaining = self.live_count(), "idle session sweep");
        }
        evicted
    }

    /// Flushes every live session and drops them from memory.
    pub fn shutdown(&self) -> usize {
        let sessions: Vec<Arc<LiveSession>> = {
            let mut live = self.live.write();
            self.by_identity.write().clear();
            live.drain().map(|(_, session)| session).collect()
        };
        let mut flushed = 0;
        for live in &sessions {
            live.closed.store(true, Ordering::Release);
            match self.flush(live) {
                Ok(()) => flushed += 1,
                Err(err) => warn!(error = %err, "session flush on shutdown failed"),
            }
        }
        info!(flushed, "sessions flushed for shutdown");
        flushed
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.live
            .read()
            .get(session_id)
            .map(|live| live.snapshot())
    }

    pub fn live_count(&self) -> usize {
        self.live.read().len()
    }
}

fn revalidate(session: &Session, approved_root: &Path) -> Result<(), RelayError> {
    PathSandbox::resolve(&session.working_directory, approved_root)
        .map(|_| ())
        .map_err(|err| {
            RelayError::Authorization(format!(
                "session {} working directory out of scope: {err}",
                session.session_id
            ))
        })
}

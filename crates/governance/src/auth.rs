use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditLog, AuditOutcome, RiskLevel};
use crate::clock::{to_delta, Clock};
use crate::config::GovernanceConfig;
use crate::sandbox::PathSandbox;
use crate::storage::{StorageError, TokenStore};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("identity {identity} not authenticated: {reason}")]
    Authentication { identity: String, reason: String },
    #[error("identity {identity} not authorized: {reason}")]
    Authorization { identity: String, reason: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result of a successful [`AuthGate::authenticate`]. Lives for one request
/// unless embedded in a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthorizationContext {
    pub identity: String,
    pub approved_root: PathBuf,
    pub granted_at: DateTime<Utc>,
    #[serde(default)]
    pub development: bool,
}

/// Persisted form of an issued bearer token. The secret itself is never
/// stored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IssuedToken {
    pub identity: String,
    pub token_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IssuedToken {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

const SWEEP_LOCK_WAIT: Duration = Duration::from_millis(5);

fn prune_failures(
    recent: &mut VecDeque<DateTime<Utc>>,
    now: DateTime<Utc>,
    window: chrono::Duration,
) {
    while let Some(oldest) = recent.front() {
        if now - *oldest >= window {
            recent.pop_front();
        } else {
            break;
        }
    }
}

fn risk_for_failures(count: usize) -> RiskLevel {
    match count {
        0..=2 => RiskLevel::Low,
        3..=4 => RiskLevel::Medium,
        5..=9 => RiskLevel::High,
        _ => RiskLevel::Critical,
    }
}

pub struct AuthGate {
    allowed: HashSet<String>,
    token_auth: bool,
    token_ttl: Duration,
    failure_window: chrono::Duration,
    default_root: PathBuf,
    roots: HashMap<String, PathBuf>,
    development: bool,
    tokens: Arc<dyn TokenStore>,
    failures: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl AuthGate {
    /// Builds the gate. Development mode is decided here, once: it is on
    /// only when no identities are allow-listed and no tokens are stored.
    pub fn new(
        config: &GovernanceConfig,
        tokens: Arc<dyn TokenStore>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AuthError> {
        let auth = &config.auth;
        let development = auth.allowed_identities.is_empty() && tokens.token_count()? == 0;
        if development {
            warn!(
                root = %config.sandbox.approved_root.display(),
                "no identities or tokens configured; development mode grants every identity access"
            );
        } else {
            info!(
                identities = auth.allowed_identities.len(),
                token_auth = auth.token_auth,
                "auth gate configured"
            );
        }
        Ok(Self {
            allowed: auth.allowed_identities.iter().cloned().collect(),
            token_auth: auth.token_auth,
            token_ttl: auth.token_ttl(),
            failure_window: to_delta(auth.failure_window()),
            default_root: config.sandbox.approved_root.clone(),
            roots: auth.roots.clone(),
            development,
            tokens,
            failures: Mutex::new(HashMap::new()),
            audit,
            clock,
        })
    }

    pub fn is_development(&self) -> bool {
        self.development
    }

    pub fn authenticate(
        &self,
        identity: &str,
        token: Option<&str>,
    ) -> Result<AuthorizationContext, AuthError> {
        match self.check(identity, token) {
            Ok(context) => {
                self.failures.lock().remove(identity);
                if context.development {
                    warn!(identity, "development mode grant");
                } else {
                    debug!(identity, root = %context.approved_root.display(), "identity authenticated");
                }
                Ok(context)
            }
            Err(err) => {
                let risk = self.note_failure(identity);
                self.audit.record(
                    identity,
                    AuditCategory::Auth,
                    AuditOutcome::Denied,
                    risk,
                    err.to_string(),
                );
                Err(err)
            }
        }
    }

    fn check(
        &self,
        identity: &str,
        token: Option<&str>,
    ) -> Result<AuthorizationContext, AuthError> {
        if identity.trim().is_empty() {
            return Err(authentication(identity, "empty identity"));
        }
        if self.development {
            return self.grant(identity, true);
        }

        let listed = self.allowed.contains(identity);
        if !self.allowed.is_empty() && !listed {
            return Err(authentication(identity, "identity not in allow-list"));
        }
        if self.token_auth {
            let Some(token) = token else {
                return Err(authentication(identity, "token required"));
            };
            if !self.token_matches(identity, token)? {
                return Err(authentication(identity, "invalid or expired token"));
            }
        } else if !listed {
            return Err(authentication(identity, "no allow-list entry and token auth disabled"));
        }
        self.grant(identity, false)
    }

    fn token_matches(&self, identity: &str, token: &str) -> Result<bool, AuthError> {
        let hash = hash_token(token);
        let now = self.clock.now();
        Ok(self
            .tokens
            .tokens_for(identity)?
            .iter()
            .any(|issued| issued.token_hash == hash && issued.is_valid_at(now)))
    }

    fn grant(&self, identity: &str, development: bool) -> Result<AuthorizationContext, AuthError> {
        let root = self.roots.get(identity).unwrap_or(&self.default_root);
        let approved_root = PathSandbox::resolve(root, root).map_err(|err| AuthError::Authorization {
            identity: identity.to_string(),
            reason: err.to_string(),
        })?;
        Ok(AuthorizationContext {
            identity: identity.to_string(),
            approved_root,
            granted_at: self.clock.now(),
            development,
        })
    }

    fn note_failure(&self, identity: &str) -> RiskLevel {
        let now = self.clock.now();
        let mut failures = self.failures.lock();
        let recent = failures.entry(identity.to_string()).or_default();
        prune_failures(recent, now, self.failure_window);
        recent.push_back(now);
        risk_for_failures(recent.len())
    }

    /// Recent failures for `identity` inside the failure window.
    pub fn failure_count(&self, identity: &str) -> usize {
        let now = self.clock.now();
        self.failures
            .lock()
            .get(identity)
            .map(|recent| {
                recent
                    .iter()
                    .filter(|at| now - **at < self.failure_window)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Forgets failure history that has aged out of the failure window.
    /// Skips the pass when the map stays busy. Returns how many identities
    /// were dropped.
    pub fn sweep(&self) -> usize {
        let Some(mut failures) = self.failures.try_lock_for(SWEEP_LOCK_WAIT) else {
            debug!("auth failure sweep skipped, map busy");
            return 0;
        };
        let now = self.clock.now();
        let before = failures.len();
        failures.retain(|_, recent| {
            prune_failures(recent, now, self.failure_window);
            !recent.is_empty()
        });
        let forgotten = before - failures.len();
        if forgotten > 0 {
            debug!(forgotten, remaining = failures.len(), "auth failure sweep");
        }
        forgotten
    }

    /// Identities with failure history still held in memory.
    pub fn tracked_failures(&self) -> usize {
        self.failures.lock().len()
    }

    /// Issues a new bearer token for `identity`. Only its hash is persisted.
    pub fn issue_token(&self, identity: &str, ttl: Option<Duration>) -> Result<String, AuthError> {
        let secret = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let issued_at = self.clock.now();
        let record = IssuedToken {
            identity: identity.to_string(),
            token_hash: hash_token(&secret),
            issued_at,
            expires_at: issued_at + to_delta(ttl.unwrap_or(self.token_ttl)),
        };
        self.tokens.save_token(&record)?;
        self.audit.record(
            identity,
            AuditCategory::Auth,
            AuditOutcome::Succeeded,
            RiskLevel::Low,
            format!("token issued, expires {}", record.expires_at.to_rfc3339()),
        );
        Ok(secret)
    }

    pub fn revoke_tokens(&self, identity: &str) -> Result<usize, AuthError> {
        let revoked = self.tokens.revoke_tokens(identity)?;
        self.audit.record(
            identity,
            AuditCategory::Auth,
            AuditOutcome::Succeeded,
            RiskLevel::Low,
            format!("{revoked} token(s) revoked"),
        );
        Ok(revoked)
    }
}

fn authentication(identity: &str, reason: &str) -> AuthError {
    AuthError::Authentication {
        identity: identity.to_string(),
        reason: reason.to_string(),
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::audit::AuditEvent;
use crate::auth::IssuedToken;
use crate::session::Session;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage error: {0}")]
    Store(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub trait SessionStore: Send + Sync {
    fn save_session(&self, session: &Session) -> Result<(), StorageError>;
    fn load_session(&self, session_id: &str) -> Result<Option<Session>, StorageError>;
    /// Most recently active session owned by `identity` that was not closed.
    fn latest_session_for(&self, identity: &str) -> Result<Option<Session>, StorageError>;
}

/// Appends may arrive slightly out of sequence order; reads are always in
/// sequence order.
pub trait AuditStore: Send + Sync {
    fn append(&self, event: &AuditEvent) -> Result<(), StorageError>;
    fn recent(&self, limit: usize) -> Result<Vec<AuditEvent>, StorageError>;
    /// Highest stored sequence number, 0 when empty.
    fn last_sequence(&self) -> Result<u64, StorageError>;
}

pub trait TokenStore: Send + Sync {
    fn save_token(&self, token: &IssuedToken) -> Result<(), StorageError>;
    fn tokens_for(&self, identity: &str) -> Result<Vec<IssuedToken>, StorageError>;
    fn revoke_tokens(&self, identity: &str) -> Result<usize, StorageError>;
    fn token_count(&self) -> Result<usize, StorageError>;
}

/// Everything the governance layer persists.
pub trait Storage: SessionStore + AuditStore + TokenStore {}

impl<T: SessionStore + AuditStore + TokenStore> Storage for T {}

#[derive(Clone, Default)]
pub struct InMemoryStorage {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    audit: Arc<RwLock<Vec<AuditEvent>>>,
    tokens: Arc<RwLock<Vec<IssuedToken>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl SessionStore for InMemoryStorage {
    fn save_session(&self, session: &Session) -> Result<(), StorageError> {
        self.sessions
            .write()
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    fn load_session(&self, session_id: &str) -> Result<Option<Session>, StorageError> {
        Ok(self.sessions.read().get(session_id).cloned())
    }

    fn latest_session_for(&self, identity: &str) -> Result<Option<Session>, StorageError> {
        Ok(self
            .sessions
            .read()
            .values()
            .filter(|session| session.identity == identity && !session.closed)
            .max_by_key(|session| session.last_active_at)
            .cloned())
    }
}

impl AuditStore for InMemoryStorage {
    fn append(&self, event: &AuditEvent) -> Result<(), StorageError> {
        let mut events = self.audit.write();
        let at = events.partition_point(|existing| existing.sequence < event.sequence);
        events.insert(at, event.clone());
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<AuditEvent>, StorageError> {
        let events = self.audit.read();
        let start = events.len().saturating_sub(limit);
        Ok(events[start..].to_vec())
    }

    fn last_sequence(&self) -> Result<u64, StorageError> {
        Ok(self.audit.read().last().map_or(0, |event| event.sequence))
    }
}

impl TokenStore for InMemoryStorage {
    fn save_token(&self, token: &IssuedToken) -> Result<(), StorageError> {
        self.tokens.write().push(token.clone());
        Ok(())
    }

    fn tokens_for(&self, identity: &str) -> Result<Vec<IssuedToken>, StorageError> {
        Ok(self
            .tokens
            .read()
            .iter()
            .filter(|token| token.identity == identity)
            .cloned()
            .collect())
    }

    fn revoke_tokens(&self, identity: &str) -> Result<usize, StorageError> {
        let mut tokens = self.tokens.write();
        let before = tokens.len();
        tokens.retain(|token| token.identity != identity);
        Ok(before - tokens.len())
    }

    fn token_count(&self) -> Result<usize, StorageError> {
        Ok(self.tokens.read().len())
    }
}

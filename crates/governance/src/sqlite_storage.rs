use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::audit::AuditEvent;
use crate::auth::IssuedToken;
use crate::session::Session;
use crate::storage::{AuditStore, SessionStore, StorageError, TokenStore};

/// SQLite-backed storage. Rows hold JSON payloads next to the columns the
/// queries filter on.
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

fn store_err(err: rusqlite::Error) -> StorageError {
    StorageError::Store(err.to_string())
}

fn serde_err(err: serde_json::Error) -> StorageError {
    StorageError::Serialization(err.to_string())
}

impl SqliteStorage {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(store_err)?;
        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.ensure_schema()?;
        Ok(storage)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.ensure_schema()?;
        Ok(storage)
    }

    pub fn ensure_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                identity TEXT NOT NULL,
                last_active_at TEXT NOT NULL,
                closed INTEGER NOT NULL DEFAULT 0,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS sessions_identity
                ON sessions (identity, closed, last_active_at);
            CREATE TABLE IF NOT EXISTS audit_events (
                sequence INTEGER PRIMARY KEY,
                timestamp TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS issued_tokens (
                token_hash TEXT PRIMARY KEY,
                identity TEXT NOT NULL,
                payload TEXT NOT NULL
            );",
        )
        .map_err(store_err)?;
        Ok(())
    }
}

impl SessionStore for SqliteStorage {
    fn save_session(&self, session: &Session) -> Result<(), StorageError> {
        let payload = serde_json::to_string(session).map_err(serde_err)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (session_id, identity, last_active_at, closed, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(session_id) DO UPDATE
             SET identity = excluded.identity,
                 last_active_at = excluded.last_active_at,
                 closed = excluded.closed,
                 payload = excluded.payload",
            params![
                session.session_id,
                session.identity,
                session.last_active_at.to_rfc3339(),
                session.closed,
                payload
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn load_session(&self, session_id: &str) -> Result<Option<Session>, StorageError> {
        let conn = self.conn.lock();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        payload
            .map(|payload| serde_json::from_str(&payload).map_err(serde_err))
            .transpose()
    }

    fn latest_session_for(&self, identity: &str) -> Result<Option<Session>, StorageError> {
        let conn = self.conn.lock();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM sessions WHERE identity = ?1 AND closed = 0
                 ORDER BY last_active_at DESC LIMIT 1",
                params![identity],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        payload
            .map(|payload| serde_json::from_str(&payload).map_err(serde_err))
            .transpose()
    }
}

impl AuditStore for SqliteStorage {
    fn append(&self, event: &AuditEvent) -> Result<(), StorageError> {
        let payload = serde_json::to_string(event).map_err(serde_err)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO audit_events (sequence, timestamp, payload) VALUES (?1, ?2, ?3)",
            params![event.sequence as i64, event.timestamp.to_rfc3339(), payload],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<AuditEvent>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT payload FROM audit_events ORDER BY sequence DESC LIMIT ?1")
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))
            .map_err(store_err)?;
        let mut events = Vec::new();
        for row in rows {
            let payload = row.map_err(store_err)?;
            events.push(serde_json::from_str(&payload).map_err(serde_err)?);
        }
        events.reverse();
        Ok(events)
    }

    fn last_sequence(&self) -> Result<u64, StorageError> {
        let conn = self.conn.lock();
        let last: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(sequence), 0) FROM audit_events",
                [],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        Ok(last.max(0) as u64)
    }
}

impl TokenStore for SqliteStorage {
    fn save_token(&self, token: &IssuedToken) -> Result<(), StorageError> {
        let payload = serde_json::to_string(token).map_err(serde_err)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO issued_tokens (token_hash, identity, payload)
             VALUES (?1, ?2, ?3)",
            params![token.token_hash, token.identity, payload],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn tokens_for(&self, identity: &str) -> Result<Vec<IssuedToken>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT payload FROM issued_tokens WHERE identity = ?1")
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![identity], |row| row.get::<_, String>(0))
            .map_err(store_err)?;
        let mut tokens = Vec::new();
        for row in rows {
            let payload = row.map_err(store_err)?;
            tokens.push(serde_json::from_str(&payload).map_err(serde_err)?);
        }
        Ok(tokens)
    }

    fn revoke_tokens(&self, identity: &str) -> Result<usize, StorageError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM issued_tokens WHERE identity = ?1",
            params![identity],
        )
        .map_err(store_err)
    }

    fn token_count(&self) -> Result<usize, StorageError> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM issued_tokens", [], |row| row.get(0))
            .map_err(store_err)?;
        Ok(count.max(0) as usize)
    }
}

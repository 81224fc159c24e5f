use std::path::Path;
use std::sync::Arc;

use governance::{GovernanceConfig, InMemoryStorage, SqliteStorage, SystemClock};
use orchestrator::{Backend, Gateway, RelayError};
use tracing::{info, warn};

use crate::error::AppError;

pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>, admin_token: Option<String>) -> Self {
        let admin_token = admin_token.filter(|token| !token.trim().is_empty());
        if admin_token.is_none() {
            warn!("no admin token configured; admin endpoints are disabled");
        }
        Self {
            gateway,
            admin_token,
        }
    }
}

/// Wires the gateway against SQLite when a database path is configured,
/// in-memory storage otherwise.
pub fn build_gateway(
    config: &GovernanceConfig,
    backends: Vec<Arc<dyn Backend>>,
) -> Result<Gateway, AppError> {
    let clock = SystemClock::shared();
    let gateway = match &config.storage.sqlite_path {
        Some(path) => {
            info!(path = %path.display(), "using sqlite storage");
            let storage = Arc::new(SqliteStorage::open(path)?);
            Gateway::build(config, storage, backends, clock)
        }
        None => {
            warn!("no sqlite_path configured; sessions and audit events are kept in memory");
            Gateway::build(config, InMemoryStorage::shared(), backends, clock)
        }
    };
    gateway.map_err(|err: RelayError| AppError::internal(err.to_string()))
}

pub fn create_default_config(path: &Path) -> Result<String, AppError> {
    let root = std::env::current_dir()?;
    let content = default_config_template(&root);
    std::fs::write(path, content.as_bytes())?;
    Ok(content)
}

pub fn default_config_template(approved_root: &Path) -> String {
    let root = approved_root.display().to_string();
    let mut lines = Vec::new();
    lines.push("[sandbox]".to_string());
    lines.push(format!("approved_root = {root:?}"));
    lines.push(String::new());
    lines.push("[auth]".to_string());
    lines.push("allowed_identities = []".to_string());
    lines.push("token_auth = false".to_string());
    lines.push("# Admin endpoints stay disabled until a long random secret is set.".to_string());
    lines.push("# admin_token = \"\"".to_string());
    lines.push(String::new());
    lines.push("[rate_limit]".to_string());
    lines.push("requests = 10".to_string());
    lines.push("window_secs = 60".to_string());
    lines.push("cost_limit = 10.0".to_string());
    lines.push(String::new());
    lines.push("[providers]".to_string());
    lines.push("order = [\"claude\"]".to_string());
    lines.push("timeout_secs = 120".to_string());
    lines.push("max_switches = 3".to_string());
    lines.push(String::new());
    lines.push("[providers.endpoints.claude]".to_string());
    lines.push("url = \"http://127.0.0.1:9000/invoke\"".to_string());
    lines.push(String::new());
    lines.push("[sessions]".to_string());
    lines.push("idle_timeout_secs = 3600".to_string());
    lines.push("turn_wait_ms = 0".to_string());
    lines.push(String::new());
    lines.push("[storage]".to_string());
    lines.push("sqlite_path = \"relay.sqlite\"".to_string());
    format!("{}\n", lines.join("\n"))
}

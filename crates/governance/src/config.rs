use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::provider::{BackendKind, EndpointConfig};

/// Process-wide configuration. Loaded once at start-up and handed to each
/// component's constructor; changing it requires a restart.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GovernanceConfig {
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub tools: ToolConfig,
    #[serde(default)]
    pub providers: ProviderConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxConfig {
    pub approved_root: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    pub allowed_identities: Vec<String>,
    pub token_auth: bool,
    pub token_ttl_secs: u64,
    pub failure_window_secs: u64,
    /// Per-identity approved root overrides.
    pub roots: HashMap<String, PathBuf>,
    pub admin_token: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            allowed_identities: Vec::new(),
            token_auth: false,
            token_ttl_secs: 30 * 24 * 60 * 60,
            failure_window_secs: 300,
            roots: HashMap::new(),
            admin_token: None,
        }
    }
}

impl AuthConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Requests admitted per rolling window (`R`).
    pub requests: u32,
    /// Rolling window length in seconds (`W`).
    pub window_secs: u64,
    pub cost_limit: f64,
    pub cost_window_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: 10,
            window_secs: 60,
            cost_limit: 10.0,
            cost_window_secs: 24 * 60 * 60,
            sweep_interval_secs: 30,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cost_window(&self) -> Duration {
        Duration::from_secs(self.cost_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolListConfig {
    pub allowed: Vec<String>,
    pub disallowed: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolConfig {
    pub allowed: Vec<String>,
    pub disallowed: Vec<String>,
    pub identities: HashMap<String, ToolListConfig>,
    pub dangerous_patterns: Vec<String>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            allowed: ["Read", "Grep", "Glob", "LS"]
                .iter()
                .map(|name| name.to_string())
                .collect(),
            disallowed: Vec::new(),
            identities: HashMap::new(),
            dangerous_patterns: default_dangerous_patterns(),
        }
    }
}

pub fn default_dangerous_patterns() -> Vec<String> {
    [
        r"\brm\s+-[a-z]*r[a-z]*f|\brm\s+-[a-z]*f[a-z]*r",
        r"\bsudo\b",
        r"\bchmod\s+777\b",
        r"\b(curl|wget)\b.*\|\s*(ba|z)?sh\b",
        r"\|",
        r">",
        r"\b(eval|exec)\b",
        r"\$\(",
        r"`",
        r"\bmkfs\b",
        r"\bdd\s+if=",
    ]
    .iter()
    .map(|pattern| pattern.to_string())
    .collect()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderConfig {
    pub order: Vec<BackendKind>,
    pub timeout_secs: u64,
    pub max_switches: u32,
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub half_open_success_threshold: u32,
    /// Keys are backend names; case and surrounding whitespace are ignored.
    #[serde(deserialize_with = "endpoint_map")]
    pub endpoints: HashMap<BackendKind, EndpointConfig>,
}

fn endpoint_map<'de, D>(
    deserializer: D,
) -> Result<HashMap<BackendKind, EndpointConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = HashMap::<String, EndpointConfig>::deserialize(deserializer)?;
    let mut endpoints = HashMap::with_capacity(raw.len());
    for (key, endpoint) in raw {
        let kind = key.parse::<BackendKind>().map_err(serde::de::Error::custom)?;
        if endpoints.insert(kind, endpoint).is_some() {
            return Err(serde::de::Error::custom(format!(
                "endpoint for {kind} configured more than once"
            )));
        }
    }
    Ok(endpoints)
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            order: vec![BackendKind::Claude],
            timeout_secs: 120,
            max_switches: 3,
            failure_threshold: 3,
            cooldown_secs: 30,
            half_open_success_threshold: 1,
            endpoints: HashMap::new(),
        }
    }
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn endpoint(&self, kind: BackendKind) -> Option<&EndpointConfig> {
        self.endpoints.get(&kind)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
    /// How long a second turn may wait for the session; 0 rejects at once.
    pub turn_wait_ms: u64,
    pub sweep_interval_secs: u64,
    pub max_history: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60 * 60,
            turn_wait_ms: 0,
            sweep_interval_secs: 60,
            max_history: 200,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn turn_wait(&self) -> Option<Duration> {
        (self.turn_wait_ms > 0).then(|| Duration::from_millis(self.turn_wait_ms))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// SQLite database path; in-memory storage when unset.
    pub sqlite_path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl GovernanceConfig {
    /// Minimal configuration rooted at `approved_root`, everything else at
    /// defaults.
    pub fn with_root(approved_root: impl Into<PathBuf>) -> Self {
        Self {
            sandbox: SandboxConfig {
                approved_root: approved_root.into(),
            },
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            tools: ToolConfig::default(),
            providers: ProviderConfig::default(),
            sessions: SessionConfig::default(),
            storage: StorageConfig::default(),
        }
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: GovernanceConfig =
            toml::from_str(input).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.sandbox.approved_root.is_absolute() {
            return Err(ConfigError::invalid(
                "sandbox.approved_root",
                "must be an absolute path",
            ));
        }
        for (identity, root) in &self.auth.roots {
            if !root.is_absolute() {
                return Err(ConfigError::invalid(
                    &format!("auth.roots.{identity}"),
                    "must be an absolute path",
                ));
            }
        }
        if self.rate_limit.requests == 0 {
            return Err(ConfigError::invalid("rate_limit.requests", "must be at least 1"));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(ConfigError::invalid("rate_limit.window_secs", "must be at least 1"));
        }
        if !self.rate_limit.cost_limit.is_finite() || self.rate_limit.cost_limit < 0.0 {
            return Err(ConfigError::invalid(
                "rate_limit.cost_limit",
                "must be a non-negative number",
            ));
        }
        if self.providers.order.is_empty() {
            return Err(ConfigError::invalid("providers.order", "must name at least one backend"));
        }
        for (index, kind) in self.providers.order.iter().enumerate() {
            if self.providers.order[..index].contains(kind) {
                return Err(ConfigError::invalid(
                    "providers.order",
                    format!("{kind} listed more than once"),
                ));
            }
        }
        if self.providers.timeout_secs == 0 {
            return Err(ConfigError::invalid("providers.timeout_secs", "must be at least 1"));
        }
        if self.providers.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "providers.failure_threshold",
                "must be at least 1",
            ));
        }
        for pattern in &self.tools.dangerous_patterns {
            regex::Regex::new(pattern).map_err(|err| {
                ConfigError::invalid("tools.dangerous_patterns", err.to_string())
            })?;
        }
        Ok(())
    }

    /// Approved root for `identity`, honouring per-identity overrides.
    pub fn approved_root_for(&self, identity: &str) -> &Path {
        self.auth
            .roots
            .get(identity)
            .map(PathBuf::as_path)
            .unwrap_or(self.sandbox.approved_root.as_path())
    }
}

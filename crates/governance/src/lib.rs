pub mod audit;
pub mod auth;
pub mod clock;
pub mod config;
pub mod health;
pub mod provider;
pub mod rate_limit;
pub mod sandbox;
pub mod session;
pub mod sqlite_storage;
pub mod storage;
pub mod tools;

pub use audit::{AuditCategory, AuditEvent, AuditLog, AuditOutcome, RiskLevel};
pub use auth::{hash_token, AuthError, AuthGate, AuthorizationContext, IssuedToken};
pub use clock::{to_delta, Clock, ManualClock, SystemClock};
pub use config::{
    AuthConfig, ConfigError, GovernanceConfig, ProviderConfig, RateLimitConfig, SandboxConfig,
    SessionConfig, StorageConfig, ToolConfig, ToolListConfig,
};
pub use health::{CircuitBreakerConfig, HealthStore, InMemoryHealthStore, ProviderHealth};
pub use provider::{BackendKind, EndpointConfig, UnknownBackend};
pub use rate_limit::{BudgetSnapshot, Permit, RateGovernor, RateLimitError};
pub use sandbox::{PathSandbox, SandboxError};
pub use session::{Session, Turn};
pub use sqlite_storage::SqliteStorage;
pub use storage::{
    AuditStore, InMemoryStorage, SessionStore, Storage, StorageError, TokenStore,
};
pub use tools::{
    classify, digest_arguments, DenialReason, ToolInvocationRecord, ToolMonitor, ToolPolicy,
    ToolScope, ToolTiers,
};

mod backend;
mod cancel;
mod coordinator;
mod cost;
mod error;
mod gateway;
mod http_backend;
mod orchestrator;
mod selector;
mod sweeper;

pub use backend::{Backend, BackendError, BackendEvent, BackendRequest, EventStream};
pub use cancel::{cancellation, CancelHandle, CancelSignal};
pub use coordinator::{SessionCoordinator, TurnRequest, TurnResult};
pub use cost::estimate_cost;
pub use error::RelayError;
pub use gateway::{Gateway, InboundRequest, TurnOutcome};
pub use http_backend::{http_backends, HttpBackend, HttpBackendConfig};
pub use orchestrator::{Execution, OrchestratorConfig, ProviderOrchestrator};
pub use selector::{BackendSelector, SelectionExclusions, SelectorError};
pub use sweeper::spawn_sweeper;

use std::collections::HashSet;
use std::sync::Arc;

use governance::{BackendKind, HealthStore};

#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    #[error("no available backend")]
    NoBackend,
}

/// Backends already tried (and failed) during the current request.
#[derive(Debug, Default)]
pub struct SelectionExclusions {
    pub backends: HashSet<BackendKind>,
}

/// Walks the configured priority order, skipping excluded backends and
/// backends whose circuit is open. A caller's preferred backend is tried
/// ahead of the order when it is registered and available.
pub struct BackendSelector {
    order: Vec<BackendKind>,
    health: Arc<dyn HealthStore>,
}

impl BackendSelector {
    pub fn new(order: Vec<BackendKind>, health: Arc<dyn HealthStore>) -> Self {
        Self { order, health }
    }

    pub fn order(&self) -> &[BackendKind] {
        &self.order
    }

    pub fn select(
        &self,
        preferred: Option<BackendKind>,
        exclusions: &SelectionExclusions,
    ) -> Result<BackendKind, SelectorError> {
        let usable = |kind: &BackendKind| {
            !exclusions.backends.contains(kind) && self.health.is_available(*kind)
        };
        if let Some(kind) = preferred.filter(|kind| self.order.contains(kind) && usable(kind)) {
            return Ok(kind);
        }
        self.order
            .iter()
            .copied()
            .find(|kind| usable(kind))
            .ok_or(SelectorError::NoBackend)
    }
}

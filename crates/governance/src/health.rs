use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::{to_delta, Clock};
use crate::config::ProviderConfig;
use crate::provider::BackendKind;

#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            half_open_success_threshold: 1,
        }
    }
}

impl From<&ProviderConfig> for CircuitBreakerConfig {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown(),
            half_open_success_threshold: config.half_open_success_threshold.max(1),
        }
    }
}

/// Health of one backend as seen by the selector.
#[derive(Clone, Debug, Serialize)]
pub struct ProviderHealth {
    pub provider_id: BackendKind,
    pub consecutive_failures: u32,
    pub circuit_open_until: Option<DateTime<Utc>>,
    pub half_open: bool,
    pub total_failures: u64,
    pub total_successes: u64,
}

impl ProviderHealth {
    fn new(provider_id: BackendKind) -> Self {
        Self {
            provider_id,
            consecutive_failures: 0,
            circuit_open_until: None,
            half_open: false,
            total_failures: 0,
            total_successes: 0,
        }
    }

    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.circuit_open_until.is_some_and(|until| now < until)
    }
}

#[derive(Clone, Debug)]
struct CircuitState {
    health: ProviderHealth,
    half_open_success: u32,
}

pub trait HealthStore: Send + Sync {
    fn is_available(&self, id: BackendKind) -> bool;
    fn record_success(&self, id: BackendKind);
    /// Returns true when this failure opened the circuit.
    fn record_failure(&self, id: BackendKind) -> bool;
    fn snapshot(&self, id: BackendKind) -> ProviderHealth;
}

#[derive(Clone)]
pub struct InMemoryHealthStore {
    config: CircuitBreakerConfig,
    states: Arc<Mutex<HashMap<BackendKind, CircuitState>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryHealthStore {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            states: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    pub fn shared(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self::new(config, clock))
    }

    fn open(&self, state: &mut CircuitState, now: DateTime<Utc>) {
        let until = now + to_delta(self.config.cooldown);
        state.health.circuit_open_until = Some(until);
        state.health.half_open = false;
        state.half_open_success = 0;
        warn!(
            provider = %state.health.provider_id,
            failures = state.health.consecutive_failures,
            until = %until,
            "circuit opened"
        );
    }
}

fn entry(states: &mut HashMap<BackendKind, CircuitState>, id: BackendKind) -> &mut CircuitState {
    states.entry(id).or_insert_with(|| CircuitState {
        health: ProviderHealth::new(id),
        half_open_success: 0,
    })
}

impl HealthStore for InMemoryHealthStore {
    fn is_available(&self, id: BackendKind) -> bool {
        let now = self.clock.now();
        let mut states = self.states.lock();
        let state = entry(&mut states, id);
        if let Some(until) = state.health.circuit_open_until {
            if now < until {
                return false;
            }
            state.health.circuit_open_until = None;
            state.health.half_open = true;
            state.half_open_success = 0;
            info!(provider = %id, "circuit half-open");
        }
        true
    }

    fn record_success(&self, id: BackendKind) {
        let mut states = self.states.lock();
        let state = entry(&mut states, id);
        state.health.total_successes += 1;
        state.health.consecutive_failures = 0;
        if state.health.half_open {
            state.half_open_success += 1;
            if state.half_open_success >= self.config.half_open_success_threshold {
                state.health.half_open = false;
                state.half_open_success = 0;
                info!(provider = %id, "circuit closed");
            }
            return;
        }
        state.health.circuit_open_until = None;
    }

    fn record_failure(&self, id: BackendKind) -> bool {
        let now = self.clock.now();
        let mut states = self.states.lock();
        let state = entry(&mut states, id);
        state.health.total_failures += 1;
        state.health.consecutive_failures += 1;
        if state.health.half_open {
            self.open(state, now);
            return true;
        }
        if state.health.circuit_open_until.is_none()
            && state.health.consecutive_failures >= self.config.failure_threshold
        {
            self.open(state, now);
            return true;
        }
        false
    }

    fn snapshot(&self, id: BackendKind) -> ProviderHealth {
        self.states
            .lock()
            .get(&id)
            .map(|state| state.health.clone())
            .unwrap_or_else(|| ProviderHealth::new(id))
    }
}

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditLog, AuditOutcome, RiskLevel};
use crate::clock::{to_delta, Clock};
use crate::config::RateLimitConfig;

const SWEEP_LOCK_WAIT: Duration = Duration::from_millis(5);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RateLimitError {
    #[error("request limit reached for {identity}; next slot at {retry_at}")]
    RequestLimit {
        identity: String,
        retry_at: DateTime<Utc>,
    },
    #[error("cost limit reached for {identity}: spent {spent:.4} + estimate {estimate:.4} > {limit:.4}")]
    CostLimit {
        identity: String,
        spent: f64,
        estimate: f64,
        limit: f64,
    },
    #[error("invalid cost {0}")]
    InvalidCost(f64),
    #[error("permit {0} already settled")]
    AlreadySettled(Uuid),
}

/// Point-in-time view of one identity's budget.
#[derive(Clone, Debug, Serialize)]
pub struct BudgetSnapshot {
    pub identity: String,
    pub request_count_remaining: u32,
    /// When the oldest admission in the window ages out, if any are held.
    pub request_window_reset_at: Option<DateTime<Utc>>,
    pub cost_spent: f64,
    pub cost_limit: f64,
}

#[derive(Debug)]
struct Budget {
    admitted: VecDeque<DateTime<Utc>>,
    cost_spent: f64,
    period_started_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl Budget {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            admitted: VecDeque::new(),
            cost_spent: 0.0,
            period_started_at: now,
            last_seen: now,
        }
    }

    fn prune(&mut self, now: DateTime<Utc>, window: chrono::Duration) {
        while let Some(oldest) = self.admitted.front() {
            if now - *oldest >= window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    fn roll_period(&mut self, now: DateTime<Utc>, cost_window: chrono::Duration) {
        if now - self.period_started_at >= cost_window {
            self.period_started_at = now;
            self.cost_spent = 0.0;
        }
    }
}

/// Reservation handed out by [`RateGovernor::admit`].
///
/// The estimate is charged at admission. Settling swaps it for the actual
/// cost; dropping an unsettled permit gives the estimate back.
pub struct Permit {
    id: Uuid,
    identity: String,
    estimated_cost: f64,
    period_started_at: DateTime<Utc>,
    budget: Arc<Mutex<Budget>>,
    settled: AtomicBool,
}

impl Permit {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn estimated_cost(&self) -> f64 {
        self.estimated_cost
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("estimated_cost", &self.estimated_cost)
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.settled.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut budget = self.budget.lock();
        if budget.period_started_at == self.period_started_at {
            budget.cost_spent = (budget.cost_spent - self.estimated_cost).max(0.0);
        }
        debug!(identity = %self.identity, permit = %self.id, "unsettled permit released");
    }
}

/// Per-identity admission control over request count and spend.
///
/// Request counting uses a rolling window: an identity never has more than
/// `requests` admissions inside any `window`-long interval.
pub struct RateGovernor {
    requests: u32,
    window: chrono::Duration,
    cost_limit: f64,
    cost_window: chrono::Duration,
    budgets: Mutex<HashMap<String, Arc<Mutex<Budget>>>>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl RateGovernor {
    pub fn new(config: &RateLimitConfig, audit: Arc<AuditLog>, clock: Arc<dyn Clock>) -> Self {
        Self {
            requests: config.requests,
            window: to_delta(config.window()),
            cost_limit: config.cost_limit,
            cost_window: to_delta(config.cost_window()),
            budgets: Mutex::new(HashMap::new()),
            audit,
            clock,
        }
    }

    pub fn shared(
        config: &RateLimitConfig,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self::new(config, audit, clock))
    }

    fn budget_for(&self, identity: &str) -> Arc<Mutex<Budget>> {
        let mut budgets = self.budgets.lock();
        budgets
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Budget::new(self.clock.now()))))
            .clone()
    }

    /// Consumes one request slot and reserves `estimated_cost`. Both checks
    /// and both mutations happen under the identity's budget lock.
    pub fn admit(&self, identity: &str, estimated_cost: f64) -> Result<Permit, RateLimitError> {
        if !estimated_cost.is_finite() || estimated_cost < 0.0 {
            return Err(RateLimitError::InvalidCost(estimated_cost));
        }
        let handle = self.budget_for(identity);
        let decision = {
            let mut budget = handle.lock();
            let now = self.clock.now();
            budget.last_seen = now;
            budget.prune(now, self.window);
            budget.roll_period(now, self.cost_window);

            if budget.admitted.len() >= self.requests as usize {
                let retry_at = budget
                    .admitted
                    .front()
                    .map(|oldest| *oldest + self.window)
                    .unwrap_or(now);
                Err(RateLimitError::RequestLimit {
                    identity: identity.to_string(),
                    retry_at,
                })
            } else if budget.cost_spent + estimated_cost > self.cost_limit {
                Err(RateLimitError::CostLimit {
                    identity: identity.to_string(),
                    spent: budget.cost_spent,
                    estimate: estimated_cost,
                    limit: self.cost_limit,
                })
            } else {
                budget.admitted.push_back(now);
                budget.cost_spent += estimated_cost;
                Ok(budget.period_started_at)
            }
        };

        match decision {
            Ok(period_started_at) => {
                let permit = Permit {
                    id: Uuid::new_v4(),
                    identity: identity.to_string(),
                    estimated_cost,
                    period_started_at,
                    budget: handle,
                    settled: AtomicBool::new(false),
                };
                debug!(identity, permit = %permit.id, estimated_cost, "request admitted");
                Ok(permit)
            }
            Err(err) => {
                self.audit.record(
                    identity,
                    AuditCategory::Rate,
                    AuditOutcome::Denied,
                    RiskLevel::Medium,
                    err.to_string(),
                );
                Err(err)
            }
        }
    }

    /// Replaces the permit's estimate with `actual_cost`. Overage is applied
    /// even if it pushes spend past the limit. A permit settles once.
    pub fn settle(&self, permit: &Permit, actual_cost: f64) -> Result<f64, RateLimitError> {
        if !actual_cost.is_finite() || actual_cost < 0.0 {
            return Err(RateLimitError::InvalidCost(actual_cost));
        }
        if permit.settled.swap(true, Ordering::AcqRel) {
            return Err(RateLimitError::AlreadySettled(permit.id));
        }
        let spent = {
            let mut budget = permit.budget.lock();
            if budget.period_started_at == permit.period_started_at {
                budget.cost_spent += actual_cost - permit.estimated_cost;
            } else {
                budget.cost_spent += actual_cost;
            }
            budget.cost_spent = budget.cost_spent.max(0.0);
            budget.cost_spent
        };
        if actual_cost > permit.estimated_cost {
            warn!(
                identity = %permit.identity,
                permit = %permit.id,
                estimated = permit.estimated_cost,
                actual = actual_cost,
                "actual cost exceeded estimate"
            );
        }
        if spent > self.cost_limit {
            warn!(
                identity = %permit.identity,
                spent,
                limit = self.cost_limit,
                "cost limit overshot by in-flight request"
            );
        }
        Ok(spent)
    }

    pub fn budget(&self, identity: &str) -> BudgetSnapshot {
        let handle = self.budgets.lock().get(identity).cloned();
        let now = self.clock.now();
        let (used, reset_at, cost_spent) = match handle {
            Some(handle) => {
                let mut budget = handle.lock();
                budget.prune(now, self.window);
                budget.roll_period(now, self.cost_window);
                (
                    budget.admitted.len(),
                    budget.admitted.front().map(|oldest| *oldest + self.window),
                    budget.cost_spent,
                )
            }
            None => (0, None, 0.0),
        };
        BudgetSnapshot {
            identity: identity.to_string(),
            request_count_remaining: (self.requests as usize).saturating_sub(used) as u32,
            request_window_reset_at: reset_at,
            cost_spent,
            cost_limit: self.cost_limit,
        }
    }

    /// Prunes aged-out admissions and forgets identities with nothing left
    /// to track. Budgets that are busy are skipped until the next sweep.
    /// Returns the number of identities forgotten.
    pub fn sweep(&self) -> usize {
        let Some(mut budgets) = self.budgets.try_lock_for(SWEEP_LOCK_WAIT) else {
            debug!("rate sweep skipped, budget map busy");
            return 0;
        };
        let now = self.clock.now();
        let before = budgets.len();
        budgets.retain(|_, handle| {
            if Arc::strong_count(handle) > 1 {
                return true;
            }
            let Some(mut budget) = handle.try_lock_for(SWEEP_LOCK_WAIT) else {
                return true;
            };
            budget.prune(now, self.window);
            budget.roll_period(now, self.cost_window);
            !(budget.admitted.is_empty() && budget.cost_spent == 0.0)
        });
        let forgotten = before - budgets.len();
        if forgotten > 0 {
            debug!(forgotten, remaining = budgets.len(), "rate sweep");
        }
        forgotten
    }

    pub fn tracked_identities(&self) -> usize {
        self.budgets.lock().len()
    }
}

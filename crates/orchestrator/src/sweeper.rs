use std::sync::Arc;
use std::time::Duration;

use governance::{AuthGate, RateGovernor};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::cancel::CancelSignal;
use crate::coordinator::SessionCoordinator;

/// Periodic background housekeeping. Rate windows and auth failure history
/// are pruned on one interval, idle sessions are evicted on the other. Every
/// sweep only uses bounded or non-blocking lock attempts.
pub fn spawn_sweeper(
    auth: Arc<AuthGate>,
    rate: Arc<RateGovernor>,
    sessions: Arc<SessionCoordinator>,
    rate_every: Duration,
    session_every: Duration,
    mut stop: CancelSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rate_tick = tokio::time::interval(rate_every);
        let mut session_tick = tokio::time::interval(session_every);
        rate_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        session_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = rate_tick.tick() => {
                    rate.sweep();
                    auth.sweep();
                }
                _ = session_tick.tick() => {
                    sessions.sweep_idle();
                }
            }
        }
        debug!("sweeper stopped");
    })
}

//! Periodic reconciliation sweep.
//!
//! Every `cleanup_interval` the reaper (a) moves records whose transport
//! silently died into the grace substate, (b) purges endpoints that are
//! stale past their grace window, fanning out `driverRemoved` for drivers,
//! and (c) drops expired rate-gate buckets. The sweep takes the same
//! registry serialization as every other mutation and is idempotent with
//! respect to explicit `endSession` and to itself.

use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::proto::{self, outbound};
use crate::state::AppState;
use crate::ws::{broadcast, is_live};

pub fn spawn(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(state.config.cleanup_interval());
        // Skip the first immediate tick
        ticker.tick().await;
        loop {
            ticker.tick().await;
            run_sweep(&state);
        }
    })
}

/// One sweep pass. Factored out of the timer loop so tests can drive it
/// with synthetic transports.
pub fn run_sweep(state: &AppState) {
    let now = Instant::now();
    let outcome = state.registry.sweep(
        now,
        state.config.grace_period(),
        state.config.stale_timeout(),
        |conn| is_live(&state.connections, conn),
    );
    state.rate_gate.sweep(now);

    broadcast::notify_ping_removals(state, &outcome.ping_removals, Some("user_disconnected"));

    let timestamp = proto::now_ms();
    for account_id in &outcome.removed_drivers {
        tracing::info!(account_id = %account_id, "reaped stale driver");
        broadcast::broadcast_to_users(state, &outbound::driver_removed(account_id, timestamp));
    }
    if !outcome.removed_users.is_empty() {
        tracing::debug!(count = outcome.removed_users.len(), "reaped stale users");
    }
}

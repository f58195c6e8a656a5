//! Fan-out primitives.
//!
//! Recipient sets are captured under the registry lock; the per-connection
//! sends happen without holding it (the senders are unbounded channels, so
//! a slow peer cannot block a producer). A send failure is treated as a
//! transport close: the peer is unbound and the fan-out continues.

use axum::extract::ws::Message;
use std::time::Instant;

use crate::proto::{self, outbound};
use crate::registry::PingRemovalNotice;
use crate::state::AppState;
use crate::ws::ConnectionId;

/// Push one message to one connection. False when the transport is gone.
pub fn send_to(state: &AppState, conn: ConnectionId, message: Message) -> bool {
    match state.connections.get(&conn) {
        Some(sender) => sender.send(message).is_ok(),
        None => false,
    }
}

/// Publish to every connection currently in role user. Best-effort: a dead
/// subscriber is dropped and the rest still get the message.
pub fn broadcast_to_users(state: &AppState, message: &Message) {
    let recipients = state.registry.user_connections();
    for conn in recipients {
        if !send_to(state, conn, message.clone()) {
            drop_dead_peer(state, conn);
        }
    }
}

/// Unicast to a specific driver connection, surfacing a dead transport to
/// the caller.
pub fn unicast(state: &AppState, conn: ConnectionId, message: Message) -> bool {
    if send_to(state, conn, message) {
        true
    } else {
        drop_dead_peer(state, conn);
        false
    }
}

/// Deliver `pingRemoved` notices produced by an unbind or sweep. Failures
/// here are left to the reaper; recursing into another unbind from a
/// notification path is not worth it.
pub fn notify_ping_removals(state: &AppState, removals: &[PingRemovalNotice], reason: Option<&str>) {
    let timestamp = proto::now_ms();
    for notice in removals {
        let message = outbound::ping_removed(&notice.user_account_id, timestamp, reason);
        let _ = send_to(state, notice.driver_conn, message);
    }
}

/// A send failure is a disconnect: remove the transport, unbind the peer,
/// and tell affected drivers their waiting user left.
fn drop_dead_peer(state: &AppState, conn: ConnectionId) {
    state.connections.remove(&conn);
    state.rate_gate.remove(conn);
    let outcome = state.registry.unbind(conn, Instant::now());
    notify_ping_removals(state, &outcome.ping_removals, Some("user_disconnected"));
    tracing::debug!(conn_id = %conn, "dropped dead subscriber during fan-out");
}

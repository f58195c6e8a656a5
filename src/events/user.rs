//! User-originated event handlers: snapshots, bus lookups, and the
//! point-to-point ping subsystem.

use std::time::Instant;

use crate::error::RelayError;
use crate::proto::inbound::{PingRequest, UnpingRequest};
use crate::proto::{self, outbound};
use crate::state::AppState;
use crate::ws::{broadcast, is_live, ConnectionId};

pub fn handle_get_bus_info(
    state: &AppState,
    conn: ConnectionId,
    account_id: &str,
) -> Result<(), RelayError> {
    if account_id.is_empty() {
        return Err(RelayError::validation("accountId must not be empty"));
    }
    let message = match state.registry.bus_info(account_id) {
        Some(view) => outbound::bus_info(&view),
        None => outbound::bus_info_error(account_id),
    };
    let _ = broadcast::send_to(state, conn, message);
    Ok(())
}

pub fn handle_request_drivers_data(state: &AppState, conn: ConnectionId) -> Result<(), RelayError> {
    let drivers = state.registry.drivers_data();
    let _ = broadcast::send_to(state, conn, outbound::drivers_data(&drivers));
    Ok(())
}

pub fn handle_request_current_data(state: &AppState, conn: ConnectionId) -> Result<(), RelayError> {
    let snapshot = state.registry.snapshot(state.config.max_snapshot_drivers);
    let _ = broadcast::send_to(state, conn, outbound::drivers_snapshot(&snapshot));
    Ok(())
}

/// Route a ping to exactly one driver. The waiting entry is stored on the
/// driver record; nothing is broadcast.
pub fn handle_ping(
    state: &AppState,
    conn: ConnectionId,
    request: PingRequest,
) -> Result<(), RelayError> {
    request.validate()?;
    let requested_count = request.requested_count()?;
    let timestamp = proto::now_ms();

    let outcome = state.registry.ping_driver(
        conn,
        &request.driver_account_id,
        request.lat,
        request.lng,
        requested_count,
        timestamp,
        Instant::now(),
        |c| is_live(&state.connections, c),
    )?;

    let message = outbound::ping_received(
        &outcome.user_account_id,
        outcome.lat,
        outcome.lng,
        outcome.requested_count,
        timestamp,
    );
    if !broadcast::unicast(state, outcome.driver_conn, message) {
        return Err(RelayError::unavailable("driver is not connected"));
    }
    tracing::debug!(
        user_account_id = %outcome.user_account_id,
        driver_account_id = %request.driver_account_id,
        "ping delivered"
    );
    Ok(())
}

pub fn handle_unping(
    state: &AppState,
    conn: ConnectionId,
    request: UnpingRequest,
) -> Result<(), RelayError> {
    request.validate()?;
    let outcome = state
        .registry
        .unping_driver(conn, &request.driver_account_id)?;
    if let Some(driver_conn) = outcome.driver_conn {
        let message = outbound::ping_removed(&outcome.user_account_id, proto::now_ms(), None);
        let _ = broadcast::send_to(state, driver_conn, message);
    }
    Ok(())
}

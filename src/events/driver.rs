//! Driver-originated event handlers: registration/resumption, the four
//! update kinds, and explicit session end.

use std::time::Instant;

use crate::error::RelayError;
use crate::proto::inbound::{DestinationUpdate, LocationUpdate, PassengerUpdate, RouteUpdate};
use crate::proto::{self, outbound};
use crate::registry::driver::LocationPatch;
use crate::registry::session::Role;
use crate::registry::UpdateOutcome;
use crate::state::AppState;
use crate::ws::{broadcast, ConnectionId};

use super::close_preempted;

pub fn handle_register(
    state: &AppState,
    conn: ConnectionId,
    role_raw: &str,
    account_id: Option<String>,
) -> Result<(), RelayError> {
    let role = Role::parse(role_raw)
        .ok_or_else(|| RelayError::validation(format!("unknown role: {role_raw}")))?;

    let outcome = state.registry.register(conn, role, account_id, Instant::now())?;
    close_preempted(state, &outcome.preempted);
    state.rate_gate.reset(conn);

    tracing::info!(
        conn_id = %conn,
        role = role.as_str(),
        account_id = state.registry.bound_account(conn).as_deref().unwrap_or("-"),
        "role registered"
    );

    let _ = broadcast::send_to(state, conn, outbound::session_assigned(&outcome.session_key));

    // Users get the current picture right away.
    if role == Role::User {
        let snapshot = state.registry.snapshot(state.config.max_snapshot_drivers);
        let _ = broadcast::send_to(state, conn, outbound::current_data(&snapshot));
    }
    Ok(())
}

pub fn handle_resume(
    state: &AppState,
    conn: ConnectionId,
    session_key: &str,
) -> Result<(), RelayError> {
    let outcome = state.registry.resume_session(conn, session_key, Instant::now())?;
    close_preempted(state, &outcome.preempted);
    state.rate_gate.reset(conn);

    tracing::info!(
        conn_id = %conn,
        role = outcome.role.as_str(),
        account_id = outcome.account_id.as_deref().unwrap_or("-"),
        "session resumed"
    );

    if outcome.role == Role::User {
        let snapshot = state.registry.snapshot(state.config.max_snapshot_drivers);
        let _ = broadcast::send_to(state, conn, outbound::current_data(&snapshot));
    }
    // Drivers hear nothing yet: driverStateRestored waits for their first
    // authoritative update.
    Ok(())
}

pub fn handle_location(
    state: &AppState,
    conn: ConnectionId,
    update: LocationUpdate,
) -> Result<(), RelayError> {
    update.validate()?;
    let now = Instant::now();

    if let Err(err) = state
        .rate_gate
        .check(conn, state.config.max_updates_per_minute, now)
    {
        tracing::warn!(
            conn_id = %conn,
            account_id = %update.account_id,
            "location update rejected by rate gate"
        );
        return Err(err);
    }

    let patch = LocationPatch {
        destination_name: update.destination_name.clone(),
        destination_lat: update.destination_lat,
        destination_lng: update.destination_lng,
        organization_name: update.organization_name.clone(),
        passenger_count: update.passenger_count,
        max_capacity: update.max_capacity,
    };
    let outcome = state.registry.apply_location(
        conn,
        &update.account_id,
        update.lat,
        update.lng,
        &patch,
        now,
        state.config.movement_threshold_deg,
        state.config.heartbeat_interval(),
    )?;
    if let Some(trigger) = outcome.trigger {
        tracing::debug!(
            account_id = %outcome.account_id,
            trigger = trigger.as_str(),
            "location broadcast"
        );
    }
    publish(state, conn, "locationUpdate", outcome);
    Ok(())
}

pub fn handle_destination(
    state: &AppState,
    conn: ConnectionId,
    update: DestinationUpdate,
) -> Result<(), RelayError> {
    update.validate()?;
    let patch = LocationPatch {
        destination_name: update.destination_name.clone(),
        destination_lat: update.destination_lat,
        destination_lng: update.destination_lng,
        ..Default::default()
    };
    let outcome =
        state
            .registry
            .apply_destination(conn, &update.account_id, &patch, Instant::now())?;
    publish(state, conn, "destinationUpdate", outcome);
    Ok(())
}

pub fn handle_route(
    state: &AppState,
    conn: ConnectionId,
    update: RouteUpdate,
) -> Result<(), RelayError> {
    update.validate()?;
    let outcome = state.registry.apply_route(
        conn,
        &update.account_id,
        update.geometry,
        update.destination_lat,
        update.destination_lng,
        Instant::now(),
    )?;
    publish(state, conn, "routeUpdate", outcome);
    Ok(())
}

pub fn handle_passengers(
    state: &AppState,
    conn: ConnectionId,
    update: PassengerUpdate,
) -> Result<(), RelayError> {
    update.validate()?;
    let outcome = state.registry.apply_passengers(
        conn,
        &update.account_id,
        update.passenger_count,
        update.max_capacity,
        Instant::now(),
    )?;
    publish(state, conn, "passengerUpdate", outcome);
    Ok(())
}

pub fn handle_end_session(state: &AppState, conn: ConnectionId) -> Result<(), RelayError> {
    let outcome = state.registry.end_session(conn)?;
    state.rate_gate.remove(conn);
    tracing::info!(account_id = %outcome.account_id, "driver ended session");
    broadcast::broadcast_to_users(
        state,
        &outbound::driver_removed(&outcome.account_id, proto::now_ms()),
    );
    Ok(())
}

/// Common tail of every driver update: displace preempted incumbents, fan
/// out the broadcast if the filter fired, release a deferred state restore.
fn publish(state: &AppState, conn: ConnectionId, event: &str, outcome: UpdateOutcome) {
    close_preempted(state, &outcome.preempted);
    let timestamp = proto::now_ms();
    if let Some(view) = &outcome.broadcast {
        broadcast::broadcast_to_users(state, &outbound::driver_broadcast(event, view, timestamp));
    }
    if let Some(view) = &outcome.restored {
        tracing::info!(account_id = %outcome.account_id, "driver state restored");
        let _ = broadcast::send_to(state, conn, outbound::driver_state_restored(view, timestamp));
    }
}

//! Inbound event router.
//!
//! Every message from a connection lands here: parse, touch activity,
//! enforce role admission, then hand off to the matching handler. Handler
//! failures never tear down the engine; they come back as an
//! `error { message }` frame on the offending connection.

pub mod driver;
pub mod user;

use std::time::Instant;

use crate::error::RelayError;
use crate::proto::inbound::{self, ClientEvent};
use crate::proto::outbound;
use crate::registry::session::Role;
use crate::state::AppState;
use crate::ws::{broadcast, ConnectionId};

/// Process one inbound text frame from `conn`.
pub fn dispatch(state: &AppState, conn: ConnectionId, text: &str) {
    let event = match inbound::parse_frame(text) {
        Ok(event) => event,
        Err(err) => {
            tracing::debug!(conn_id = %conn, error = %err, "rejected inbound frame");
            let _ = broadcast::send_to(state, conn, outbound::error_frame(&err.to_string()));
            return;
        }
    };

    state.registry.touch_activity(conn, Instant::now());

    let name = event.name();
    if let Err(err) = route(state, conn, event) {
        match &err {
            RelayError::Internal(detail) => {
                tracing::error!(conn_id = %conn, event = name, detail = %detail, "handler failed");
            }
            _ => {
                tracing::debug!(
                    conn_id = %conn,
                    event = name,
                    kind = err.kind(),
                    error = %err,
                    "rejected event"
                );
            }
        }
        let _ = broadcast::send_to(state, conn, outbound::error_frame(&err.to_string()));
    }
}

fn route(state: &AppState, conn: ConnectionId, event: ClientEvent) -> Result<(), RelayError> {
    match event {
        ClientEvent::RegisterRole { role, account_id } => {
            driver::handle_register(state, conn, &role, account_id)
        }
        ClientEvent::ResumeSession { session_key } => {
            driver::handle_resume(state, conn, &session_key)
        }
        ClientEvent::UpdateLocation(update) => {
            require_role(state, conn, Role::Driver, "updateLocation")?;
            driver::handle_location(state, conn, update)
        }
        ClientEvent::DestinationUpdate(update) => {
            require_role(state, conn, Role::Driver, "destinationUpdate")?;
            driver::handle_destination(state, conn, update)
        }
        ClientEvent::RouteUpdate(update) => {
            require_role(state, conn, Role::Driver, "routeUpdate")?;
            driver::handle_route(state, conn, update)
        }
        ClientEvent::PassengerUpdate(update) => {
            require_role(state, conn, Role::Driver, "passengerUpdate")?;
            driver::handle_passengers(state, conn, update)
        }
        ClientEvent::EndSession => {
            require_role(state, conn, Role::Driver, "endSession")?;
            driver::handle_end_session(state, conn)
        }
        ClientEvent::GetBusInfo { account_id } => {
            require_role(state, conn, Role::User, "getBusInfo")?;
            user::handle_get_bus_info(state, conn, &account_id)
        }
        ClientEvent::RequestDriversData => {
            require_role(state, conn, Role::User, "requestDriversData")?;
            user::handle_request_drivers_data(state, conn)
        }
        ClientEvent::RequestCurrentData => {
            require_role(state, conn, Role::User, "requestCurrentData")?;
            user::handle_request_current_data(state, conn)
        }
        ClientEvent::PingDriver(request) => {
            require_role(state, conn, Role::User, "pingDriver")?;
            user::handle_ping(state, conn, request)
        }
        ClientEvent::UnpingDriver(request) => {
            require_role(state, conn, Role::User, "unpingDriver")?;
            user::handle_unping(state, conn, request)
        }
    }
}

fn require_role(
    state: &AppState,
    conn: ConnectionId,
    required: Role,
    event_name: &str,
) -> Result<(), RelayError> {
    match state.registry.role_of(conn) {
        Some(role) if role == required => Ok(()),
        Some(_) => Err(RelayError::authorization(format!(
            "{event_name} requires {} role",
            required.as_str()
        ))),
        None => Err(RelayError::authorization("register a role first")),
    }
}

/// Notify and close connections displaced by a newer registration for the
/// same account. Always the incumbent, never the newcomer.
pub(crate) fn close_preempted(state: &AppState, preempted: &[ConnectionId]) {
    for &old in preempted {
        tracing::info!(conn_id = %old, "preempting replaced connection");
        let _ = broadcast::send_to(state, old, outbound::connection_replaced(crate::proto::now_ms()));
        let _ = broadcast::send_to(
            state,
            old,
            axum::extract::ws::Message::Close(Some(axum::extract::ws::CloseFrame {
                code: 4000,
                reason: "connection replaced".into(),
            })),
        );
        state.connections.remove(&old);
        state.rate_gate.remove(old);
    }
}

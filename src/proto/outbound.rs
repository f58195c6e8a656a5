//! Outbound event builders. Every frame is JSON text:
//! `{ "event": <name>, "data": <payload> }`.

use axum::extract::ws::Message;
use serde_json::{json, Map, Value};

use crate::registry::snapshot::{DriverView, SnapshotData};

/// Assemble one outbound text frame.
pub fn frame(event: &str, data: Value) -> Message {
    let text = json!({ "event": event, "data": data }).to_string();
    Message::Text(text.into())
}

pub fn session_assigned(session_key: &str) -> Message {
    frame("sessionAssigned", Value::String(session_key.to_string()))
}

pub fn error_frame(message: &str) -> Message {
    frame("error", json!({ "message": message }))
}

/// Broadcast form of a driver event: the merged driver state stamped with
/// the origin marker and a timestamp.
pub fn driver_broadcast(event: &str, view: &DriverView, timestamp_ms: i64) -> Message {
    let mut data = view_object(view);
    data.insert("from".to_string(), Value::String("driver".to_string()));
    data.insert("timestamp".to_string(), json!(timestamp_ms));
    frame(event, Value::Object(data))
}

pub fn drivers_snapshot(snapshot: &SnapshotData) -> Message {
    frame("driversSnapshot", to_value(snapshot))
}

/// Initial push to a freshly registered or resumed user.
pub fn current_data(snapshot: &SnapshotData) -> Message {
    frame(
        "currentData",
        json!({ "buses": &snapshot.drivers, "count": snapshot.count }),
    )
}

pub fn drivers_data(drivers: &[DriverView]) -> Message {
    frame(
        "driversData",
        json!({ "drivers": drivers, "count": drivers.len() }),
    )
}

pub fn bus_info(view: &DriverView) -> Message {
    frame("busInfo", Value::Object(view_object(view)))
}

pub fn bus_info_error(account_id: &str) -> Message {
    frame(
        "busInfoError",
        json!({ "accountId": account_id, "message": format!("no data for account: {account_id}") }),
    )
}

pub fn driver_removed(account_id: &str, timestamp_ms: i64) -> Message {
    frame(
        "driverRemoved",
        json!({ "accountId": account_id, "timestamp": timestamp_ms }),
    )
}

/// Unicast to a driver once the restoration gate opens.
pub fn driver_state_restored(view: &DriverView, timestamp_ms: i64) -> Message {
    let mut data = view_object(view);
    data.insert("timestamp".to_string(), json!(timestamp_ms));
    frame("driverStateRestored", Value::Object(data))
}

pub fn ping_received(
    user_account_id: &str,
    lat: f64,
    lng: f64,
    passenger_count: u32,
    timestamp_ms: i64,
) -> Message {
    frame(
        "pingReceived",
        json!({
            "userAccountId": user_account_id,
            "lat": lat,
            "lng": lng,
            "passengerCount": passenger_count,
            "timestamp": timestamp_ms,
        }),
    )
}

pub fn ping_removed(user_account_id: &str, timestamp_ms: i64, reason: Option<&str>) -> Message {
    let mut data = Map::new();
    data.insert("userAccountId".to_string(), Value::String(user_account_id.to_string()));
    data.insert("timestamp".to_string(), json!(timestamp_ms));
    if let Some(reason) = reason {
        data.insert("reason".to_string(), Value::String(reason.to_string()));
    }
    frame("pingRemoved", Value::Object(data))
}

pub fn connection_replaced(timestamp_ms: i64) -> Message {
    frame(
        "connectionReplaced",
        json!({
            "message": "another connection registered for this account",
            "timestamp": timestamp_ms,
        }),
    )
}

pub fn server_shutdown(timestamp_ms: i64) -> Message {
    frame("serverShutdown", json!({ "timestamp": timestamp_ms }))
}

fn view_object(view: &DriverView) -> Map<String, Value> {
    match to_value(view) {
        Value::Object(map) => map,
        // DriverView serializes as an object by construction.
        _ => Map::new(),
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

//! Wire surface: named events with a single JSON payload in each
//! direction, `{ "event": <name>, "data": <payload> }`.

pub mod inbound;
pub mod outbound;

/// Wall-clock milliseconds for client-facing timestamps.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

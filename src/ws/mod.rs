pub mod actor;
pub mod broadcast;
pub mod handler;

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Type alias for the sender half of a WebSocket connection's channel.
/// Other parts of the system can clone this to push messages to a specific client.
pub type ConnectionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;

/// Opaque identity for one accepted transport link. Minted per connection,
/// never reused within a process lifetime, never survives the link.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    pub fn mint() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Live transport table: every accepted connection's sender, keyed by id.
/// Arc<DashMap<ConnectionId, ConnectionSender>>
pub type ConnectionTable = Arc<DashMap<ConnectionId, ConnectionSender>>;

/// Create a new empty connection table.
pub fn new_connection_table() -> ConnectionTable {
    Arc::new(DashMap::new())
}

/// Whether a connection id currently has a live, writable transport.
pub fn is_live(table: &ConnectionTable, conn: ConnectionId) -> bool {
    table.get(&conn).map(|s| !s.is_closed()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_are_unique() {
        let a = ConnectionId::mint();
        let b = ConnectionId::mint();
        assert_ne!(a, b);
    }

    #[test]
    fn liveness_tracks_receiver_drop() {
        let table = new_connection_table();
        let conn = ConnectionId::mint();
        let (tx, rx) = mpsc::unbounded_channel();
        table.insert(conn, tx);
        assert!(is_live(&table, conn));
        drop(rx);
        assert!(!is_live(&table, conn));
        table.remove(&conn);
        assert!(!is_live(&table, conn));
    }
}

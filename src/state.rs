use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::registry::rate::RateGate;
use crate::registry::Registry;
use crate::ws::ConnectionTable;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Driver/user/session tables and their indexes, behind one coarse lock
    pub registry: Arc<Registry>,
    /// Live WebSocket transports (DashMap for concurrent access)
    pub connections: ConnectionTable,
    /// Per-connection fixed-window producer counters
    pub rate_gate: Arc<RateGate>,
    /// Server config
    pub config: Arc<Config>,
    /// Process start, for the uptime probe
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            connections: crate::ws::new_connection_table(),
            rate_gate: Arc::new(RateGate::new()),
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }
}

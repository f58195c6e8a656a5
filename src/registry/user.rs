//! Per-user record. Users share the endpoint lifecycle with drivers
//! (grace window, reap) but carry only activity bookkeeping and the
//! position captured from their most recent ping.

use std::time::{Duration, Instant};

use crate::ws::ConnectionId;

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub account_id: String,
    pub connection: Option<ConnectionId>,
    pub last_activity_at: Instant,
    pub disconnected: bool,
    pub disconnected_at: Option<Instant>,
    /// Captured from the most recent pingDriver, if any.
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

impl UserRecord {
    pub fn new(account_id: String, connection: ConnectionId, now: Instant) -> Self {
        Self {
            account_id,
            connection: Some(connection),
            last_activity_at: now,
            disconnected: false,
            disconnected_at: None,
            lat: None,
            lng: None,
        }
    }

    pub fn bind(&mut self, connection: ConnectionId, now: Instant) {
        self.connection = Some(connection);
        self.disconnected = false;
        self.disconnected_at = None;
        self.last_activity_at = now;
    }

    pub fn mark_disconnected(&mut self, now: Instant) {
        self.connection = None;
        self.disconnected = true;
        self.disconnected_at = Some(now);
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity_at = now;
    }

    pub fn is_stale(&self, now: Instant, stale_timeout: Duration) -> bool {
        now.duration_since(self.last_activity_at) > stale_timeout
    }

    pub fn in_grace(&self, now: Instant, grace_period: Duration) -> bool {
        match self.disconnected_at {
            Some(at) if self.disconnected => now.duration_since(at) <= grace_period,
            _ => false,
        }
    }
}

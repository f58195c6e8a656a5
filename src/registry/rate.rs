//! Per-connection fixed-window counter for producer updates.
//!
//! The window anchors at the first counted event; one window length later
//! the bucket resets. Buckets are torn down on disconnect and expired
//! buckets are dropped by the reaper sweep.

use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::error::RelayError;
use crate::ws::ConnectionId;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct RateBucket {
    count: u32,
    window_start: Instant,
}

pub struct RateGate {
    buckets: DashMap<ConnectionId, RateBucket>,
}

impl RateGate {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Count one producer event against the connection's current window.
    /// Rejects without mutating the count once the budget is exhausted.
    pub fn check(&self, conn: ConnectionId, limit: u32, now: Instant) -> Result<(), RelayError> {
        let mut bucket = self.buckets.entry(conn).or_insert(RateBucket {
            count: 0,
            window_start: now,
        });

        if now.duration_since(bucket.window_start) >= WINDOW {
            bucket.count = 0;
            bucket.window_start = now;
        }

        if bucket.count >= limit {
            return Err(RelayError::RateLimited(format!(
                "max {limit} location updates per minute"
            )));
        }
        bucket.count += 1;
        Ok(())
    }

    /// Fresh bucket for a (re)registered connection.
    pub fn reset(&self, conn: ConnectionId) {
        self.buckets.remove(&conn);
    }

    /// Tear down on disconnect.
    pub fn remove(&self, conn: ConnectionId) {
        self.buckets.remove(&conn);
    }

    /// Drop buckets whose window has passed. Called by the reaper.
    pub fn sweep(&self, now: Instant) {
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.window_start) < WINDOW);
    }

    #[cfg(test)]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_from_limit_plus_one() {
        let gate = RateGate::new();
        let conn = ConnectionId::mint();
        let now = Instant::now();
        for _ in 0..3 {
            assert!(gate.check(conn, 3, now).is_ok());
        }
        let err = gate.check(conn, 3, now).unwrap_err();
        assert_eq!(err.kind(), "rate_limited");
    }

    #[test]
    fn window_resets_one_minute_after_first_event() {
        let gate = RateGate::new();
        let conn = ConnectionId::mint();
        let t0 = Instant::now();
        assert!(gate.check(conn, 1, t0).is_ok());
        assert!(gate.check(conn, 1, t0 + Duration::from_secs(59)).is_err());
        // Exactly one window after the first event the budget is fresh.
        assert!(gate.check(conn, 1, t0 + Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn connections_are_independent() {
        let gate = RateGate::new();
        let a = ConnectionId::mint();
        let b = ConnectionId::mint();
        let now = Instant::now();
        assert!(gate.check(a, 1, now).is_ok());
        assert!(gate.check(a, 1, now).is_err());
        assert!(gate.check(b, 1, now).is_ok());
    }

    #[test]
    fn reset_clears_the_window() {
        let gate = RateGate::new();
        let conn = ConnectionId::mint();
        let now = Instant::now();
        assert!(gate.check(conn, 1, now).is_ok());
        assert!(gate.check(conn, 1, now).is_err());
        gate.reset(conn);
        assert!(gate.check(conn, 1, now).is_ok());
    }

    #[test]
    fn sweep_drops_expired_buckets_only() {
        let gate = RateGate::new();
        let old = ConnectionId::mint();
        let fresh = ConnectionId::mint();
        let t0 = Instant::now();
        gate.check(old, 10, t0).unwrap();
        gate.check(fresh, 10, t0 + Duration::from_secs(59)).unwrap();
        gate.sweep(t0 + Duration::from_secs(61));
        assert_eq!(gate.bucket_count(), 1);
    }
}

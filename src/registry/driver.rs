//! Per-driver record and its lifecycle transitions.
//!
//! A record is created by the first authoritative update from a driver-role
//! connection and lives through reconnects (grace window) until it is reaped
//! or the driver ends its session. Broadcast anchors (`last_broadcast_*`)
//! move only when an update is actually fanned out; received positions that
//! fail the filter update `lat`/`lng` but leave the anchors alone.

use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::ws::ConnectionId;

/// A user waiting at a stop, keyed in `DriverRecord::waiting_passengers`
/// by the user's account id.
#[derive(Debug, Clone)]
pub struct WaitingPassenger {
    pub lat: f64,
    pub lng: f64,
    pub requested_count: u32,
    /// Wall-clock millis, echoed back in ping payloads.
    pub pinged_at_ms: i64,
}

/// Fields a `updateLocation` event may carry besides the position.
#[derive(Debug, Clone, Default)]
pub struct LocationPatch {
    pub destination_name: Option<String>,
    pub destination_lat: Option<f64>,
    pub destination_lng: Option<f64>,
    pub organization_name: Option<String>,
    pub passenger_count: Option<u32>,
    pub max_capacity: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct DriverRecord {
    pub account_id: String,

    /// Last received position. Absent for records created by a route or
    /// destination update that arrived before any location fix.
    pub lat: Option<f64>,
    pub lng: Option<f64>,

    /// Position and time of the most recent broadcast. Distinct from the
    /// most recent received position: the movement test always compares
    /// against the last published anchor.
    pub last_broadcast_lat: Option<f64>,
    pub last_broadcast_lng: Option<f64>,
    pub last_broadcast_at: Option<Instant>,

    pub destination_name: Option<String>,
    pub destination_lat: Option<f64>,
    pub destination_lng: Option<f64>,

    /// Opaque route geometry (encoded polyline or coordinate list).
    /// Compared structurally for change detection, never interpreted.
    pub route_geometry: Option<Value>,

    pub organization_name: Option<String>,

    pub passenger_count: u32,
    pub max_capacity: u32,

    pub last_updated_at: Instant,

    /// Current live connection, or None while in the grace window.
    pub connection: Option<ConnectionId>,
    pub disconnected: bool,
    pub disconnected_at: Option<Instant>,
    pub reconnect_attempts: u32,

    pub waiting_passengers: HashMap<String, WaitingPassenger>,

    /// True between session resumption and the first subsequent
    /// authoritative update; `driverStateRestored` is deferred until then
    /// so the merged record reflects the client's freshest occupancy.
    pub pending_state_restore: bool,
}

impl DriverRecord {
    pub fn new(account_id: String, connection: ConnectionId, now: Instant) -> Self {
        Self {
            account_id,
            lat: None,
            lng: None,
            last_broadcast_lat: None,
            last_broadcast_lng: None,
            last_broadcast_at: None,
            destination_name: None,
            destination_lat: None,
            destination_lng: None,
            route_geometry: None,
            organization_name: None,
            passenger_count: 0,
            max_capacity: 0,
            last_updated_at: now,
            connection: Some(connection),
            disconnected: false,
            disconnected_at: None,
            reconnect_attempts: 0,
            waiting_passengers: HashMap::new(),
            pending_state_restore: false,
        }
    }

    /// Rebind the record to a (possibly new) connection. Coming back from
    /// the grace window counts as a reconnect; a lingering stale handle
    /// from a preempted connection is simply overwritten.
    pub fn bind(&mut self, connection: ConnectionId) {
        if self.disconnected {
            self.reconnect_attempts += 1;
        }
        self.connection = Some(connection);
        self.disconnected = false;
        self.disconnected_at = None;
    }

    /// Transition into the disconnected-with-grace substate. All data is
    /// retained; only the transport binding is dropped.
    pub fn mark_disconnected(&mut self, now: Instant) {
        self.connection = None;
        self.disconnected = true;
        self.disconnected_at = Some(now);
    }

    /// Merge a location update. Anchors are not touched here; the caller
    /// moves them via `mark_broadcast` only when the update fans out.
    pub fn merge_location(&mut self, lat: f64, lng: f64, patch: &LocationPatch, now: Instant) {
        self.lat = Some(lat);
        self.lng = Some(lng);
        self.merge_patch(patch, now);
    }

    /// Merge the optional payload fields shared by location and
    /// destination/passenger updates.
    pub fn merge_patch(&mut self, patch: &LocationPatch, now: Instant) {
        if patch.destination_name.is_some() {
            self.destination_name = patch.destination_name.clone();
        }
        if patch.destination_lat.is_some() {
            self.destination_lat = patch.destination_lat;
        }
        if patch.destination_lng.is_some() {
            self.destination_lng = patch.destination_lng;
        }
        if patch.organization_name.is_some() {
            self.organization_name = patch.organization_name.clone();
        }
        if let Some(count) = patch.passenger_count {
            self.passenger_count = count;
        }
        if let Some(capacity) = patch.max_capacity {
            self.max_capacity = capacity;
        }
        self.last_updated_at = now;
    }

    /// Move the broadcast anchors to the current position.
    pub fn mark_broadcast(&mut self, now: Instant) {
        self.last_broadcast_lat = self.lat;
        self.last_broadcast_lng = self.lng;
        self.last_broadcast_at = Some(now);
    }

    pub fn is_stale(&self, now: Instant, stale_timeout: Duration) -> bool {
        now.duration_since(self.last_updated_at) > stale_timeout
    }

    /// Whether the record is inside an active grace window.
    pub fn in_grace(&self, now: Instant, grace_period: Duration) -> bool {
        match self.disconnected_at {
            Some(at) if self.disconnected => now.duration_since(at) <= grace_period,
            _ => false,
        }
    }
}

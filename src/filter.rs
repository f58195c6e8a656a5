//! Decides whether a received driver update is worth fanning out.
//!
//! Distances are planar Euclidean in degrees. The crude approximation is
//! intentional: the threshold calibrates stationary-jitter suppression,
//! not metric accuracy, and a great-circle formula would change that
//! calibration.

use serde_json::Value;
use std::time::{Duration, Instant};

use crate::registry::driver::DriverRecord;

/// Which rule fired for a location broadcast. Logged for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastTrigger {
    FirstUpdate,
    MissingAnchor,
    Movement,
    OccupancyChanged,
    Heartbeat,
}

impl BroadcastTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstUpdate => "first_update",
            Self::MissingAnchor => "missing_anchor",
            Self::Movement => "movement",
            Self::OccupancyChanged => "occupancy_changed",
            Self::Heartbeat => "heartbeat",
        }
    }
}

pub fn planar_distance_deg(lat_a: f64, lng_a: f64, lat_b: f64, lng_b: f64) -> f64 {
    (lat_a - lat_b).hypot(lng_a - lng_b)
}

/// Location filter. `prior` is the record as it stands before the merge;
/// `passenger_count`/`max_capacity` are the values supplied by this update,
/// if any. Short-circuit OR over the four broadcast rules.
pub fn location_trigger(
    prior: Option<&DriverRecord>,
    lat: f64,
    lng: f64,
    passenger_count: Option<u32>,
    max_capacity: Option<u32>,
    now: Instant,
    movement_threshold_deg: f64,
    heartbeat_interval: Duration,
) -> Option<BroadcastTrigger> {
    let prior = match prior {
        None => return Some(BroadcastTrigger::FirstUpdate),
        Some(record) => record,
    };

    let (anchor_lat, anchor_lng) = match (prior.last_broadcast_lat, prior.last_broadcast_lng) {
        (Some(a), Some(b)) => (a, b),
        _ => return Some(BroadcastTrigger::MissingAnchor),
    };
    if planar_distance_deg(lat, lng, anchor_lat, anchor_lng) > movement_threshold_deg {
        return Some(BroadcastTrigger::Movement);
    }

    if occupancy_changed(prior, passenger_count, max_capacity) {
        return Some(BroadcastTrigger::OccupancyChanged);
    }

    match prior.last_broadcast_at {
        Some(at) if now.duration_since(at) >= heartbeat_interval => {
            Some(BroadcastTrigger::Heartbeat)
        }
        None => Some(BroadcastTrigger::MissingAnchor),
        _ => None,
    }
}

/// Rule 3 on its own, also the whole filter for `passengerUpdate`.
pub fn occupancy_changed(
    prior: &DriverRecord,
    passenger_count: Option<u32>,
    max_capacity: Option<u32>,
) -> bool {
    let count_changed = passenger_count.is_some_and(|c| c != prior.passenger_count);
    let capacity_changed = max_capacity.is_some_and(|c| c != prior.max_capacity);
    count_changed || capacity_changed
}

/// `routeUpdate` filter: structural equality on the stored geometry plus
/// field equality on the destination coordinates. The movement threshold
/// does not apply to geometry.
pub fn route_changed(
    prior: Option<&DriverRecord>,
    geometry: &Value,
    destination_lat: Option<f64>,
    destination_lng: Option<f64>,
) -> bool {
    let prior = match prior {
        None => return true,
        Some(record) => record,
    };
    if prior.route_geometry.as_ref() != Some(geometry) {
        return true;
    }
    let lat_changed = destination_lat.is_some() && destination_lat != prior.destination_lat;
    let lng_changed = destination_lng.is_some() && destination_lng != prior.destination_lng;
    lat_changed || lng_changed
}

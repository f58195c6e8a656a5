//! Client-facing projections of driver records.
//!
//! `DriverView` is the payload shape shared by broadcasts, snapshots,
//! `busInfo`, and `driverStateRestored`. `lastUpdatedAt` is used for
//! snapshot ordering but never leaves the server; `isOnline` is derived
//! from the disconnect flag.

use serde::Serialize;
use serde_json::Value;

use super::driver::DriverRecord;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverView {
    pub account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_lng: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_geometry: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_name: Option<String>,
    pub passenger_count: u32,
    pub max_capacity: u32,
    pub is_online: bool,
}

impl DriverView {
    pub fn from_record(record: &DriverRecord) -> Self {
        Self {
            account_id: record.account_id.clone(),
            lat: record.lat,
            lng: record.lng,
            destination_name: record.destination_name.clone(),
            destination_lat: record.destination_lat,
            destination_lng: record.destination_lng,
            route_geometry: record.route_geometry.clone(),
            organization_name: record.organization_name.clone(),
            passenger_count: record.passenger_count,
            max_capacity: record.max_capacity,
            is_online: !record.disconnected,
        }
    }
}

/// Point-in-time snapshot, possibly truncated to the configured cap.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotData {
    pub drivers: Vec<DriverView>,
    pub count: usize,
    pub total: usize,
    pub limited: bool,
}

/// Compose a snapshot of drivers that have either a position or a route
/// geometry. Over the cap, the freshest (by `lastUpdatedAt`) win.
pub fn compose_snapshot<'a>(
    records: impl Iterator<Item = &'a DriverRecord>,
    max_drivers: usize,
) -> SnapshotData {
    let mut visible: Vec<&DriverRecord> = records
        .filter(|r| r.lat.is_some() || r.route_geometry.is_some())
        .collect();
    let total = visible.len();
    let limited = total > max_drivers;
    if limited {
        visible.sort_by(|a, b| b.last_updated_at.cmp(&a.last_updated_at));
        visible.truncate(max_drivers);
    }
    let drivers: Vec<DriverView> = visible.iter().map(|r| DriverView::from_record(r)).collect();
    SnapshotData {
        count: drivers.len(),
        total,
        limited,
        drivers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::driver::LocationPatch;
    use crate::ws::ConnectionId;
    use std::time::{Duration, Instant};

    fn located(account: &str, at: Instant) -> DriverRecord {
        let mut rec = DriverRecord::new(account.to_string(), ConnectionId::mint(), at);
        rec.merge_location(14.5, 121.0, &LocationPatch::default(), at);
        rec
    }

    #[test]
    fn positionless_routeless_drivers_are_hidden() {
        let now = Instant::now();
        let bare = DriverRecord::new("D1".to_string(), ConnectionId::mint(), now);
        let placed = located("D2", now);
        let snapshot = compose_snapshot([&bare, &placed].into_iter(), 10);
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.drivers[0].account_id, "D2");
        assert!(!snapshot.limited);
    }

    #[test]
    fn geometry_alone_is_visible() {
        let now = Instant::now();
        let mut rec = DriverRecord::new("D1".to_string(), ConnectionId::mint(), now);
        rec.route_geometry = Some(serde_json::json!(["a", "b"]));
        let snapshot = compose_snapshot([&rec].into_iter(), 10);
        assert_eq!(snapshot.count, 1);
    }

    #[test]
    fn truncation_keeps_freshest_and_flags_it() {
        let t0 = Instant::now();
        let old = located("old", t0);
        let mid = located("mid", t0 + Duration::from_secs(5));
        let new = located("new", t0 + Duration::from_secs(10));
        let snapshot = compose_snapshot([&old, &mid, &new].into_iter(), 2);
        assert!(snapshot.limited);
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.count, 2);
        let ids: Vec<&str> = snapshot.drivers.iter().map(|d| d.account_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid"]);
    }

    #[test]
    fn view_reports_offline_for_grace_records() {
        let now = Instant::now();
        let mut rec = located("D1", now);
        assert!(DriverView::from_record(&rec).is_online);
        rec.mark_disconnected(now);
        assert!(!DriverView::from_record(&rec).is_online);
    }

    #[test]
    fn view_omits_absent_optionals_in_json() {
        let now = Instant::now();
        let rec = located("D1", now);
        let json = serde_json::to_value(DriverView::from_record(&rec)).unwrap();
        assert_eq!(json["accountId"], "D1");
        assert!(json.get("destinationName").is_none());
        assert!(json.get("routeGeometry").is_none());
        assert_eq!(json["passengerCount"], 0);
    }
}

//! Inbound event parsing and validation.
//!
//! Clients are sloppy: `registerRole` arrives both as a bare string and as
//! an object, `resumeSession` as a bare key or `{ sessionKey }`, and
//! coordinates come as numbers or numeric strings. Everything normalizes
//! here; an unrecognized event name becomes a validation error rather than
//! a dropped connection.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::RelayError;

#[derive(Debug, Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    RegisterRole {
        role: String,
        account_id: Option<String>,
    },
    ResumeSession {
        session_key: String,
    },
    UpdateLocation(LocationUpdate),
    DestinationUpdate(DestinationUpdate),
    RouteUpdate(RouteUpdate),
    PassengerUpdate(PassengerUpdate),
    EndSession,
    GetBusInfo {
        account_id: String,
    },
    RequestDriversData,
    RequestCurrentData,
    PingDriver(PingRequest),
    UnpingDriver(UnpingRequest),
}

impl ClientEvent {
    /// Event name for logging and role admission.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RegisterRole { .. } => "registerRole",
            Self::ResumeSession { .. } => "resumeSession",
            Self::UpdateLocation(_) => "updateLocation",
            Self::DestinationUpdate(_) => "destinationUpdate",
            Self::RouteUpdate(_) => "routeUpdate",
            Self::PassengerUpdate(_) => "passengerUpdate",
            Self::EndSession => "endSession",
            Self::GetBusInfo { .. } => "getBusInfo",
            Self::RequestDriversData => "requestDriversData",
            Self::RequestCurrentData => "requestCurrentData",
            Self::PingDriver(_) => "pingDriver",
            Self::UnpingDriver(_) => "unpingDriver",
        }
    }
}

/// `registerRole` accepts `"driver"` as well as `{ role, accountId? }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RoleShape {
    Bare(String),
    Object {
        role: String,
        #[serde(default, rename = "accountId")]
        account_id: Option<String>,
    },
}

/// `resumeSession` accepts `"key"` as well as `{ sessionKey }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SessionKeyShape {
    Bare(String),
    Object {
        #[serde(rename = "sessionKey")]
        session_key: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub account_id: String,
    #[serde(deserialize_with = "lenient_f64")]
    pub lat: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub lng: f64,
    #[serde(default)]
    pub destination_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub destination_lat: Option<f64>,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub destination_lng: Option<f64>,
    #[serde(default)]
    pub organization_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_count")]
    pub passenger_count: Option<u32>,
    #[serde(default, deserialize_with = "lenient_opt_count")]
    pub max_capacity: Option<u32>,
}

impl LocationUpdate {
    pub fn validate(&self) -> Result<(), RelayError> {
        require_account(&self.account_id)?;
        validate_lat_lng(self.lat, self.lng)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationUpdate {
    pub account_id: String,
    #[serde(default)]
    pub destination_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub destination_lat: Option<f64>,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub destination_lng: Option<f64>,
}

impl DestinationUpdate {
    pub fn validate(&self) -> Result<(), RelayError> {
        require_account(&self.account_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteUpdate {
    pub account_id: String,
    pub geometry: Value,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub destination_lat: Option<f64>,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub destination_lng: Option<f64>,
}

impl RouteUpdate {
    pub fn validate(&self) -> Result<(), RelayError> {
        require_account(&self.account_id)?;
        if self.geometry.is_null() {
            return Err(RelayError::validation("geometry is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassengerUpdate {
    pub account_id: String,
    #[serde(default, deserialize_with = "lenient_opt_count")]
    pub passenger_count: Option<u32>,
    #[serde(default, deserialize_with = "lenient_opt_count")]
    pub max_capacity: Option<u32>,
}

impl PassengerUpdate {
    pub fn validate(&self) -> Result<(), RelayError> {
        require_account(&self.account_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingRequest {
    pub driver_account_id: String,
    #[serde(deserialize_with = "lenient_f64")]
    pub lat: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub lng: f64,
    /// Raw value; normalized by `requested_count`.
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub passenger_count: Option<f64>,
    #[serde(default)]
    pub user_account_id: Option<String>,
}

impl PingRequest {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.driver_account_id.is_empty() {
            return Err(RelayError::validation("driverAccountId must not be empty"));
        }
        validate_lat_lng(self.lat, self.lng)?;
        self.requested_count().map(|_| ())
    }

    /// Floor of the absolute value, bounded to [1, 20]. Out of range fails
    /// the request; absent defaults to 1.
    pub fn requested_count(&self) -> Result<u32, RelayError> {
        let raw = match self.passenger_count {
            None => return Ok(1),
            Some(raw) => raw,
        };
        let floored = raw.abs().floor();
        if !(1.0..=20.0).contains(&floored) {
            return Err(RelayError::validation(
                "passengerCount must be between 1 and 20",
            ));
        }
        Ok(floored as u32)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnpingRequest {
    pub driver_account_id: String,
    #[serde(default)]
    pub user_account_id: Option<String>,
}

impl UnpingRequest {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.driver_account_id.is_empty() {
            return Err(RelayError::validation("driverAccountId must not be empty"));
        }
        Ok(())
    }
}

/// Parse one inbound text frame into a typed event.
pub fn parse_frame(text: &str) -> Result<ClientEvent, RelayError> {
    let frame: Frame = serde_json::from_str(text)
        .map_err(|e| RelayError::validation(format!("malformed frame: {e}")))?;

    let event = match frame.event.as_str() {
        "registerRole" => match decode::<RoleShape>(frame.data)? {
            RoleShape::Bare(role) => ClientEvent::RegisterRole {
                role,
                account_id: None,
            },
            RoleShape::Object { role, account_id } => ClientEvent::RegisterRole {
                role,
                account_id,
            },
        },
        "resumeSession" => match decode::<SessionKeyShape>(frame.data)? {
            SessionKeyShape::Bare(session_key)
            | SessionKeyShape::Object { session_key } => ClientEvent::ResumeSession { session_key },
        },
        "updateLocation" => ClientEvent::UpdateLocation(decode(frame.data)?),
        "destinationUpdate" => ClientEvent::DestinationUpdate(decode(frame.data)?),
        "routeUpdate" => ClientEvent::RouteUpdate(decode(frame.data)?),
        "passengerUpdate" => ClientEvent::PassengerUpdate(decode(frame.data)?),
        "endSession" => ClientEvent::EndSession,
        "getBusInfo" => {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Payload {
                account_id: String,
            }
            let payload: Payload = decode(frame.data)?;
            ClientEvent::GetBusInfo {
                account_id: payload.account_id,
            }
        }
        "requestDriversData" => ClientEvent::RequestDriversData,
        "requestCurrentData" => ClientEvent::RequestCurrentData,
        "pingDriver" => ClientEvent::PingDriver(decode(frame.data)?),
        "unpingDriver" => ClientEvent::UnpingDriver(decode(frame.data)?),
        other => {
            return Err(RelayError::validation(format!("unknown event: {other}")));
        }
    };
    Ok(event)
}

fn decode<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, RelayError> {
    serde_json::from_value(data).map_err(|e| RelayError::validation(format!("invalid payload: {e}")))
}

fn require_account(account_id: &str) -> Result<(), RelayError> {
    if account_id.is_empty() {
        return Err(RelayError::validation("accountId must not be empty"));
    }
    Ok(())
}

fn validate_lat_lng(lat: f64, lng: f64) -> Result<(), RelayError> {
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(RelayError::validation(format!("lat out of range: {lat}")));
    }
    if !lng.is_finite() || !(-180.0..=180.0).contains(&lng) {
        return Err(RelayError::validation(format!("lng out of range: {lng}")));
    }
    Ok(())
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(f64),
        Str(String),
    }
    match NumOrStr::deserialize(deserializer)? {
        NumOrStr::Num(n) => Ok(n),
        NumOrStr::Str(s) => s
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("not a number: {s:?}"))),
    }
}

fn lenient_opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "lenient_f64")] f64);
    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
}

fn lenient_opt_count<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    match lenient_opt_f64(deserializer)? {
        None => Ok(None),
        Some(n) if n.is_finite() && n >= 0.0 && n <= u32::MAX as f64 => Ok(Some(n.floor() as u32)),
        Some(n) => Err(D::Error::custom(format!("not a non-negative count: {n}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> ClientEvent {
        parse_frame(text).expect("frame parses")
    }

    #[test]
    fn register_role_accepts_both_shapes() {
        match parse(r#"{"event":"registerRole","data":"driver"}"#) {
            ClientEvent::RegisterRole { role, account_id } => {
                assert_eq!(role, "driver");
                assert!(account_id.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
        match parse(r#"{"event":"registerRole","data":{"role":"user","accountId":"U1"}}"#) {
            ClientEvent::RegisterRole { role, account_id } => {
                assert_eq!(role, "user");
                assert_eq!(account_id.as_deref(), Some("U1"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn resume_session_accepts_both_shapes() {
        for text in [
            r#"{"event":"resumeSession","data":"abc-123"}"#,
            r#"{"event":"resumeSession","data":{"sessionKey":"abc-123"}}"#,
        ] {
            match parse(text) {
                ClientEvent::ResumeSession { session_key } => assert_eq!(session_key, "abc-123"),
                other => panic!("unexpected: {other:?}"),
            }
        }
    }

    #[test]
    fn stringly_coordinates_parse() {
        let text = r#"{"event":"updateLocation","data":{"accountId":"D1","lat":"14.5","lng":121.0,"passengerCount":"3"}}"#;
        match parse(text) {
            ClientEvent::UpdateLocation(update) => {
                assert!((update.lat - 14.5).abs() < f64::EPSILON);
                assert_eq!(update.passenger_count, Some(3));
                update.validate().expect("valid");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn boundary_coordinates() {
        let at = |lat: f64, lng: f64| {
            let update: LocationUpdate = serde_json::from_value(serde_json::json!({
                "accountId": "D1", "lat": lat, "lng": lng
            }))
            .expect("deserializes");
            update.validate()
        };
        assert!(at(90.0, 180.0).is_ok());
        assert!(at(-90.0, -180.0).is_ok());
        assert!(at(90.000001, 0.0).is_err());
        assert!(at(0.0, 180.000001).is_err());
    }

    #[test]
    fn unknown_event_is_a_validation_error() {
        let err = parse_frame(r#"{"event":"selfDestruct","data":{}}"#).unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(err.to_string().contains("selfDestruct"));
    }

    #[test]
    fn garbage_frame_is_a_validation_error() {
        assert!(parse_frame("not json").is_err());
        assert!(parse_frame(r#"{"data":{}}"#).is_err());
    }

    #[test]
    fn ping_count_is_floored_abs_and_bounded() {
        let req = |count: Value| -> PingRequest {
            serde_json::from_value(serde_json::json!({
                "driverAccountId": "D1", "lat": 14.5, "lng": 121.0, "passengerCount": count
            }))
            .expect("deserializes")
        };
        assert_eq!(req(Value::from(2)).requested_count().unwrap(), 2);
        assert_eq!(req(Value::from(2.9)).requested_count().unwrap(), 2);
        assert_eq!(req(Value::from(-3)).requested_count().unwrap(), 3);
        assert!(req(Value::from(0)).requested_count().is_err());
        assert!(req(Value::from(21)).requested_count().is_err());

        let absent: PingRequest = serde_json::from_value(serde_json::json!({
            "driverAccountId": "D1", "lat": 14.5, "lng": 121.0
        }))
        .expect("deserializes");
        assert_eq!(absent.requested_count().unwrap(), 1);
    }

    #[test]
    fn negative_count_fields_are_rejected() {
        let result: Result<PassengerUpdate, _> = serde_json::from_value(serde_json::json!({
            "accountId": "D1", "passengerCount": -1
        }));
        assert!(result.is_err());
    }

    #[test]
    fn route_update_requires_geometry() {
        let update: RouteUpdate = serde_json::from_value(serde_json::json!({
            "accountId": "D1", "geometry": null
        }))
        .expect("deserializes");
        assert!(update.validate().is_err());
    }
}

//! Typed application payloads
//!
//! A decoded packet carries a port number and opaque bytes. This module
//! interprets those bytes according to the port: UTF-8 text, position
//! reports, node identity, telemetry, waypoints, routing control and admin
//! traffic. Ports this crate does not model are surfaced as
//! [`MessageContent::Raw`] rather than dropped.

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use prost::Message;

use crate::error::DecodeError;
use crate::proto;

/// Meshtastic application port numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortNum {
    /// Unknown/invalid port
    Unknown,
    /// Text message port (UTF-8 encoded strings)
    TextMessage,
    /// Remote hardware control
    RemoteHardware,
    /// Position data
    Position,
    /// Node info (user data)
    NodeInfo,
    /// Routing protocol messages
    Routing,
    /// Admin messages
    Admin,
    /// Compressed text (not decompressed by this crate)
    TextMessageCompressed,
    /// Waypoints
    Waypoint,
    /// Telemetry data
    Telemetry,
    /// Private application ports start here
    PrivateApp,
    /// Any other port, value preserved
    Other(u32),
}

impl From<u32> for PortNum {
    fn from(value: u32) -> Self {
        match value {
            0 => Self::Unknown,
            1 => Self::TextMessage,
            2 => Self::RemoteHardware,
            3 => Self::Position,
            4 => Self::NodeInfo,
            5 => Self::Routing,
            6 => Self::Admin,
            7 => Self::TextMessageCompressed,
            8 => Self::Waypoint,
            67 => Self::Telemetry,
            256 => Self::PrivateApp,
            other => Self::Other(other),
        }
    }
}

impl From<PortNum> for u32 {
    fn from(port: PortNum) -> Self {
        match port {
            PortNum::Unknown => 0,
            PortNum::TextMessage => 1,
            PortNum::RemoteHardware => 2,
            PortNum::Position => 3,
            PortNum::NodeInfo => 4,
            PortNum::Routing => 5,
            PortNum::Admin => 6,
            PortNum::TextMessageCompressed => 7,
            PortNum::Waypoint => 8,
            PortNum::Telemetry => 67,
            PortNum::PrivateApp => 256,
            PortNum::Other(v) => v,
        }
    }
}

/// Structured interpretation of a packet payload
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    /// Text message
    Text(String),
    /// Position report
    Position(Position),
    /// Node identity announcement
    NodeInfo(UserInfo),
    /// Telemetry report
    Telemetry(Telemetry),
    /// Waypoint
    Waypoint(Waypoint),
    /// Admin traffic, left encoded
    Admin(Bytes),
    /// Routing control (acks, naks, route discovery)
    Routing(Routing),
    /// Port not modelled by this crate
    Raw {
        /// Port the payload arrived on
        portnum: PortNum,
        /// Undecoded payload
        payload: Bytes,
    },
}

impl MessageContent {
    /// Interpret `payload` according to `portnum`
    pub fn decode(portnum: PortNum, payload: &[u8]) -> Result<Self, DecodeError> {
        let mismatch = |reason: String| DecodeError::PayloadMismatch {
            portnum: portnum.into(),
            reason,
        };

        let content = match portnum {
            PortNum::TextMessage => {
                let text = std::str::from_utf8(payload)
                    .map_err(|e| mismatch(format!("invalid UTF-8: {e}")))?;
                MessageContent::Text(text.to_string())
            }
            PortNum::Position => {
                let msg = proto::Position::decode(payload).map_err(|e| mismatch(e.to_string()))?;
                MessageContent::Position(msg.into())
            }
            PortNum::NodeInfo => {
                let msg = proto::User::decode(payload).map_err(|e| mismatch(e.to_string()))?;
                MessageContent::NodeInfo(msg.into())
            }
            PortNum::Telemetry => {
                let msg = proto::Telemetry::decode(payload).map_err(|e| mismatch(e.to_string()))?;
                MessageContent::Telemetry(msg.into())
            }
            PortNum::Waypoint => {
                let msg = proto::Waypoint::decode(payload).map_err(|e| mismatch(e.to_string()))?;
                MessageContent::Waypoint(msg.into())
            }
            PortNum::Routing => {
                let msg = proto::Routing::decode(payload).map_err(|e| mismatch(e.to_string()))?;
                let routing = Routing::from_proto(msg)
                    .ok_or_else(|| mismatch("routing message without variant".to_string()))?;
                MessageContent::Routing(routing)
            }
            PortNum::Admin => MessageContent::Admin(Bytes::copy_from_slice(payload)),
            other => MessageContent::Raw {
                portnum: other,
                payload: Bytes::copy_from_slice(payload),
            },
        };
        Ok(content)
    }

    /// Port number and encoded payload for this content
    pub fn encode(&self) -> (PortNum, Bytes) {
        match self {
            MessageContent::Text(text) => (PortNum::TextMessage, Bytes::from(text.clone())),
            MessageContent::Position(p) => (
                PortNum::Position,
                proto::Position::from(p.clone()).encode_to_vec().into(),
            ),
            MessageContent::NodeInfo(u) => (
                PortNum::NodeInfo,
                proto::User::from(u.clone()).encode_to_vec().into(),
            ),
            MessageContent::Telemetry(t) => (
                PortNum::Telemetry,
                proto::Telemetry::from(*t).encode_to_vec().into(),
            ),
            MessageContent::Waypoint(w) => (
                PortNum::Waypoint,
                proto::Waypoint::from(w.clone()).encode_to_vec().into(),
            ),
            MessageContent::Admin(payload) => (PortNum::Admin, payload.clone()),
            MessageContent::Routing(r) => (
                PortNum::Routing,
                proto::Routing::from(r.clone()).encode_to_vec().into(),
            ),
            MessageContent::Raw { portnum, payload } => (*portnum, payload.clone()),
        }
    }
}

fn unix_time(secs: u32) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    Utc.timestamp_opt(i64::from(secs), 0).single()
}

fn to_unix(time: Option<DateTime<Utc>>) -> u32 {
    time.and_then(|t| u32::try_from(t.timestamp()).ok())
        .unwrap_or_default()
}

const COORD_SCALE: f64 = 1e-7;

fn to_degrees(i: Option<i32>) -> Option<f64> {
    i.map(|v| f64::from(v) * COORD_SCALE)
}

fn from_degrees(d: Option<f64>) -> Option<i32> {
    d.map(|v| (v / COORD_SCALE).round() as i32)
}

/// Geographic position report
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Position {
    /// Latitude in degrees
    pub latitude: Option<f64>,
    /// Longitude in degrees
    pub longitude: Option<f64>,
    /// Altitude in metres above MSL
    pub altitude: Option<i32>,
    /// Fix time reported by the node
    pub time: Option<DateTime<Utc>>,
    /// Ground speed in m/s
    pub ground_speed: Option<u32>,
    /// Satellites used for the fix
    pub sats_in_view: u32,
}

impl From<proto::Position> for Position {
    fn from(p: proto::Position) -> Self {
        Self {
            latitude: to_degrees(p.latitude_i),
            longitude: to_degrees(p.longitude_i),
            altitude: p.altitude,
            time: unix_time(p.time),
            ground_speed: p.ground_speed,
            sats_in_view: p.sats_in_view,
        }
    }
}

impl From<Position> for proto::Position {
    fn from(p: Position) -> Self {
        Self {
            latitude_i: from_degrees(p.latitude),
            longitude_i: from_degrees(p.longitude),
            altitude: p.altitude,
            time: to_unix(p.time),
            ground_speed: p.ground_speed,
            sats_in_view: p.sats_in_view,
        }
    }
}

/// Role a node advertises in the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NodeRole {
    /// Ordinary client
    #[default]
    Client,
    /// Client that does not rebroadcast
    ClientMute,
    /// Infrastructure router
    Router,
    /// Router that is also used as a client
    RouterClient,
    /// Repeater without its own traffic
    Repeater,
    /// Position tracker
    Tracker,
    /// Telemetry sensor
    Sensor,
    /// Any other role value
    Other(i32),
}

impl From<i32> for NodeRole {
    fn from(value: i32) -> Self {
        match value {
            0 => Self::Client,
            1 => Self::ClientMute,
            2 => Self::Router,
            3 => Self::RouterClient,
            4 => Self::Repeater,
            5 => Self::Tracker,
            6 => Self::Sensor,
            other => Self::Other(other),
        }
    }
}

impl From<NodeRole> for i32 {
    fn from(role: NodeRole) -> Self {
        match role {
            NodeRole::Client => 0,
            NodeRole::ClientMute => 1,
            NodeRole::Router => 2,
            NodeRole::RouterClient => 3,
            NodeRole::Repeater => 4,
            NodeRole::Tracker => 5,
            NodeRole::Sensor => 6,
            NodeRole::Other(v) => v,
        }
    }
}

/// Node identity announcement
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserInfo {
    /// Textual node id, e.g. `!a1b2c3d4`
    pub id: String,
    /// Long display name
    pub long_name: String,
    /// Short (up to four character) name
    pub short_name: String,
    /// Hardware model code
    pub hw_model: i32,
    /// Operator holds an amateur radio licence
    pub is_licensed: bool,
    /// Advertised role
    pub role: NodeRole,
}

impl From<proto::User> for UserInfo {
    fn from(u: proto::User) -> Self {
        Self {
            id: u.id,
            long_name: u.long_name,
            short_name: u.short_name,
            hw_model: u.hw_model,
            is_licensed: u.is_licensed,
            role: u.role.into(),
        }
    }
}

impl From<UserInfo> for proto::User {
    fn from(u: UserInfo) -> Self {
        Self {
            id: u.id,
            long_name: u.long_name,
            short_name: u.short_name,
            hw_model: u.hw_model,
            is_licensed: u.is_licensed,
            role: u.role.into(),
        }
    }
}

/// Device health metrics
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DeviceMetrics {
    /// Battery level in percent (101 = powered)
    pub battery_level: Option<u32>,
    /// Battery voltage
    pub voltage: Option<f32>,
    /// Channel utilisation in percent
    pub channel_utilization: Option<f32>,
    /// Transmit airtime utilisation in percent
    pub air_util_tx: Option<f32>,
    /// Seconds since boot
    pub uptime_seconds: Option<u32>,
}

/// Environment sensor readings
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EnvironmentMetrics {
    /// Temperature in °C
    pub temperature: Option<f32>,
    /// Relative humidity in percent
    pub relative_humidity: Option<f32>,
    /// Barometric pressure in hPa
    pub barometric_pressure: Option<f32>,
}

/// Which metrics a telemetry report carries
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TelemetryMetrics {
    /// Device health
    Device(DeviceMetrics),
    /// Environment sensors
    Environment(EnvironmentMetrics),
    /// A metrics kind this crate does not model
    Other,
}

/// Telemetry report
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Telemetry {
    /// Sample time reported by the node
    pub time: Option<DateTime<Utc>>,
    /// Reported metrics
    pub metrics: TelemetryMetrics,
}

impl From<proto::Telemetry> for Telemetry {
    fn from(t: proto::Telemetry) -> Self {
        let metrics = match t.variant {
            Some(proto::telemetry::Variant::DeviceMetrics(m)) => {
                TelemetryMetrics::Device(DeviceMetrics {
                    battery_level: m.battery_level,
                    voltage: m.voltage,
                    channel_utilization: m.channel_utilization,
                    air_util_tx: m.air_util_tx,
                    uptime_seconds: m.uptime_seconds,
                })
            }
            Some(proto::telemetry::Variant::EnvironmentMetrics(m)) => {
                TelemetryMetrics::Environment(EnvironmentMetrics {
                    temperature: m.temperature,
                    relative_humidity: m.relative_humidity,
                    barometric_pressure: m.barometric_pressure,
                })
            }
            None => TelemetryMetrics::Other,
        };
        Self {
            time: unix_time(t.time),
            metrics,
        }
    }
}

impl From<Telemetry> for proto::Telemetry {
    fn from(t: Telemetry) -> Self {
        let variant = match t.metrics {
            TelemetryMetrics::Device(m) => {
                Some(proto::telemetry::Variant::DeviceMetrics(proto::DeviceMetrics {
                    battery_level: m.battery_level,
                    voltage: m.voltage,
                    channel_utilization: m.channel_utilization,
                    air_util_tx: m.air_util_tx,
                    uptime_seconds: m.uptime_seconds,
                }))
            }
            TelemetryMetrics::Environment(m) => Some(
                proto::telemetry::Variant::EnvironmentMetrics(proto::EnvironmentMetrics {
                    temperature: m.temperature,
                    relative_humidity: m.relative_humidity,
                    barometric_pressure: m.barometric_pressure,
                }),
            ),
            TelemetryMetrics::Other => None,
        };
        Self {
            time: to_unix(t.time),
            variant,
        }
    }
}

/// Shared map marker
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Waypoint {
    /// Waypoint id, unique per originator
    pub id: u32,
    /// Latitude in degrees
    pub latitude: Option<f64>,
    /// Longitude in degrees
    pub longitude: Option<f64>,
    /// Expiry time
    pub expire: Option<DateTime<Utc>>,
    /// Node allowed to edit, if locked
    pub locked_to: Option<u32>,
    /// Short name
    pub name: String,
    /// Longer description
    pub description: String,
    /// Unicode code point used as icon
    pub icon: u32,
}

impl From<proto::Waypoint> for Waypoint {
    fn from(w: proto::Waypoint) -> Self {
        Self {
            id: w.id,
            latitude: to_degrees(w.latitude_i),
            longitude: to_degrees(w.longitude_i),
            expire: unix_time(w.expire),
            locked_to: (w.locked_to != 0).then_some(w.locked_to),
            name: w.name,
            description: w.description,
            icon: w.icon,
        }
    }
}

impl From<Waypoint> for proto::Waypoint {
    fn from(w: Waypoint) -> Self {
        Self {
            id: w.id,
            latitude_i: from_degrees(w.latitude),
            longitude_i: from_degrees(w.longitude),
            expire: to_unix(w.expire),
            locked_to: w.locked_to.unwrap_or(0),
            name: w.name,
            description: w.description,
            icon: w.icon,
        }
    }
}

/// Routing error code meaning "delivered"
pub const ROUTING_ERROR_NONE: i32 = 0;

/// Routing control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    /// Route discovery request with the hops so far
    RouteRequest(Vec<u32>),
    /// Route discovery reply with the discovered hops
    RouteReply(Vec<u32>),
    /// Delivery report; reason 0 is an acknowledgement
    Error {
        /// Routing error code
        reason: i32,
    },
}

impl Routing {
    /// Acknowledgement for a delivered packet
    pub fn ack() -> Self {
        Routing::Error {
            reason: ROUTING_ERROR_NONE,
        }
    }

    /// Whether this is a positive delivery report
    pub fn is_ack(&self) -> bool {
        matches!(self, Routing::Error { reason } if *reason == ROUTING_ERROR_NONE)
    }
}

impl Routing {
    fn from_proto(r: proto::Routing) -> Option<Self> {
        match r.variant? {
            proto::routing::Variant::RouteRequest(d) => Some(Routing::RouteRequest(d.route)),
            proto::routing::Variant::RouteReply(d) => Some(Routing::RouteReply(d.route)),
            proto::routing::Variant::ErrorReason(reason) => Some(Routing::Error { reason }),
        }
    }
}

impl From<Routing> for proto::Routing {
    fn from(r: Routing) -> Self {
        let variant = match r {
            Routing::RouteRequest(route) => {
                proto::routing::Variant::RouteRequest(proto::RouteDiscovery { route })
            }
            Routing::RouteReply(route) => {
                proto::routing::Variant::RouteReply(proto::RouteDiscovery { route })
            }
            Routing::Error { reason } => proto::routing::Variant::ErrorReason(reason),
        };
        Self {
            variant: Some(variant),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_numbers() {
        assert_eq!(PortNum::from(1), PortNum::TextMessage);
        assert_eq!(PortNum::from(8), PortNum::Waypoint);
        assert_eq!(PortNum::from(67), PortNum::Telemetry);
        assert_eq!(PortNum::from(300), PortNum::Other(300));
        assert_eq!(u32::from(PortNum::Other(300)), 300);
        assert_eq!(u32::from(PortNum::Telemetry), 67);
    }

    #[test]
    fn test_text_decode() {
        let content = MessageContent::decode(PortNum::TextMessage, b"hello mesh").unwrap();
        assert_eq!(content, MessageContent::Text("hello mesh".to_string()));
    }

    #[test]
    fn test_invalid_utf8_is_payload_mismatch() {
        let err = MessageContent::decode(PortNum::TextMessage, &[0xFF, 0xFE]).unwrap_err();
        assert!(matches!(err, DecodeError::PayloadMismatch { portnum: 1, .. }));
    }

    #[test]
    fn test_garbage_position_is_payload_mismatch() {
        // Field 1 declared as length-delimited with a length past the end
        let err = MessageContent::decode(PortNum::Position, &[0x0A, 0x7F]).unwrap_err();
        assert!(matches!(err, DecodeError::PayloadMismatch { portnum: 3, .. }));
    }

    #[test]
    fn test_position_scaling() {
        let position = Position {
            latitude: Some(37.7749),
            longitude: Some(-122.4194),
            altitude: Some(15),
            ..Default::default()
        };
        let (port, bytes) = MessageContent::Position(position).encode();
        assert_eq!(port, PortNum::Position);

        let wire = proto::Position::decode(bytes.as_ref()).unwrap();
        assert_eq!(wire.latitude_i, Some(377_749_000));
        assert_eq!(wire.longitude_i, Some(-1_224_194_000));

        match MessageContent::decode(port, &bytes).unwrap() {
            MessageContent::Position(p) => {
                assert!((p.latitude.unwrap() - 37.7749).abs() < 1e-6);
                assert_eq!(p.altitude, Some(15));
                assert_eq!(p.time, None);
            }
            other => panic!("unexpected content {other:?}"),
        }
    }

    #[test]
    fn test_node_info_role() {
        let user = UserInfo {
            id: "!0000002a".to_string(),
            long_name: "Base Camp".to_string(),
            short_name: "BC".to_string(),
            role: NodeRole::Router,
            ..Default::default()
        };
        let (port, bytes) = MessageContent::NodeInfo(user.clone()).encode();
        assert_eq!(
            MessageContent::decode(port, &bytes).unwrap(),
            MessageContent::NodeInfo(user)
        );
    }

    #[test]
    fn test_telemetry_variants() {
        let telemetry = Telemetry {
            time: None,
            metrics: TelemetryMetrics::Device(DeviceMetrics {
                battery_level: Some(87),
                voltage: Some(4.1),
                ..Default::default()
            }),
        };
        let (port, bytes) = MessageContent::Telemetry(telemetry).encode();
        match MessageContent::decode(port, &bytes).unwrap() {
            MessageContent::Telemetry(Telemetry {
                metrics: TelemetryMetrics::Device(m),
                ..
            }) => assert_eq!(m.battery_level, Some(87)),
            other => panic!("unexpected content {other:?}"),
        }
    }

    #[test]
    fn test_routing_ack() {
        let (port, bytes) = MessageContent::Routing(Routing::ack()).encode();
        // The oneof keeps a zero error reason on the wire
        assert!(!bytes.is_empty());
        match MessageContent::decode(port, &bytes).unwrap() {
            MessageContent::Routing(r) => assert!(r.is_ack()),
            other => panic!("unexpected content {other:?}"),
        }
        assert!(!Routing::Error { reason: 3 }.is_ack());
    }

    #[test]
    fn test_empty_routing_rejected() {
        let err = MessageContent::decode(PortNum::Routing, &[]).unwrap_err();
        assert!(matches!(err, DecodeError::PayloadMismatch { portnum: 5, .. }));
    }

    #[test]
    fn test_unmodelled_port_is_raw() {
        let content = MessageContent::decode(PortNum::Other(512), b"\x01\x02").unwrap();
        assert_eq!(
            content,
            MessageContent::Raw {
                portnum: PortNum::Other(512),
                payload: Bytes::from_static(b"\x01\x02"),
            }
        );
    }
}

//! Events emitted by the message processor

use bytes::Bytes;

use crate::content::{Position, Routing, Telemetry, Waypoint};
use crate::error::DecodeError;
use crate::packet::MeshPacket;
use crate::registry::NodeProfile;
use crate::transport::{ConnectionState, TransportId};

/// Something a consumer may want to react to.
///
/// Events carry the full packet so consumers can key on packet id and
/// receive time; no ordering across packets is implied.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// Text message
    MessageReceived {
        /// Transport the packet arrived on
        transport: TransportId,
        /// Envelope
        packet: MeshPacket,
        /// Decoded text
        text: String,
    },
    /// Position report
    PositionReceived {
        /// Transport the packet arrived on
        transport: TransportId,
        /// Envelope
        packet: MeshPacket,
        /// Reported position
        position: Position,
    },
    /// Telemetry report
    TelemetryReceived {
        /// Transport the packet arrived on
        transport: TransportId,
        /// Envelope
        packet: MeshPacket,
        /// Reported metrics
        telemetry: Telemetry,
    },
    /// Waypoint
    WaypointReceived {
        /// Transport the packet arrived on
        transport: TransportId,
        /// Envelope
        packet: MeshPacket,
        /// Waypoint
        waypoint: Waypoint,
    },
    /// A node's identity, position or telemetry changed
    NodeUpdated(NodeProfile),
    /// Admin payload, passed through undecoded
    AdminReceived {
        /// Transport the packet arrived on
        transport: TransportId,
        /// Envelope
        packet: MeshPacket,
        /// Raw admin message
        payload: Bytes,
    },
    /// Routing message (acks, naks, route discovery)
    RoutingReceived {
        /// Transport the packet arrived on
        transport: TransportId,
        /// Envelope
        packet: MeshPacket,
        /// Routing content
        routing: Routing,
    },
    /// Encrypted packet or unrecognised port
    PacketReceived {
        /// Transport the packet arrived on
        transport: TransportId,
        /// Envelope and undecoded payload
        packet: MeshPacket,
    },
    /// Envelope was valid but the payload did not match its port
    PayloadRejected {
        /// Transport the packet arrived on
        transport: TransportId,
        /// Envelope
        packet: MeshPacket,
        /// Why the payload was rejected
        error: DecodeError,
    },
    /// Transport came up or went away
    ConnectionChanged {
        /// Affected transport
        transport: TransportId,
        /// New state
        state: ConnectionState,
        /// Why, when the link was lost
        reason: Option<String>,
    },
}

impl MeshEvent {
    /// Packet that produced this event, if any
    pub fn packet(&self) -> Option<&MeshPacket> {
        match self {
            MeshEvent::MessageReceived { packet, .. }
            | MeshEvent::PositionReceived { packet, .. }
            | MeshEvent::TelemetryReceived { packet, .. }
            | MeshEvent::WaypointReceived { packet, .. }
            | MeshEvent::AdminReceived { packet, .. }
            | MeshEvent::RoutingReceived { packet, .. }
            | MeshEvent::PacketReceived { packet, .. }
            | MeshEvent::PayloadRejected { packet, .. } => Some(packet),
            MeshEvent::NodeUpdated(_) | MeshEvent::ConnectionChanged { .. } => None,
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            MeshEvent::MessageReceived { .. } => "message",
            MeshEvent::PositionReceived { .. } => "position",
            MeshEvent::TelemetryReceived { .. } => "telemetry",
            MeshEvent::WaypointReceived { .. } => "waypoint",
            MeshEvent::NodeUpdated(_) => "node",
            MeshEvent::AdminReceived { .. } => "admin",
            MeshEvent::RoutingReceived { .. } => "routing",
            MeshEvent::PacketReceived { .. } => "packet",
            MeshEvent::PayloadRejected { .. } => "rejected",
            MeshEvent::ConnectionChanged { .. } => "connection",
        }
    }
}

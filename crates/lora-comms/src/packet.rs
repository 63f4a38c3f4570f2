//! Mesh packet model and its binary codec
//!
//! [`MeshPacketCodec`] converts between a frame body and a [`MeshPacket`].
//! Decoding is strict about the envelope (node ids, hop limit, priority and
//! exactly one payload variant) and lazy about the payload: interpreting
//! the application bytes is a separate step, [`Data::content`], so a packet
//! with an unreadable payload still exposes its envelope metadata.

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use prost::Message;

use crate::config::BROADCAST_ADDR;
use crate::content::{MessageContent, PortNum};
use crate::error::DecodeError;
use crate::proto;

/// Transmit priority as carried on the wire (0-255)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Priority(pub u8);

impl Priority {
    /// Not set; the radio picks
    pub const UNSET: Priority = Priority(0);
    /// Lowest priority
    pub const MIN: Priority = Priority(1);
    /// Background traffic
    pub const BACKGROUND: Priority = Priority(10);
    /// Default for ordinary messages
    pub const DEFAULT: Priority = Priority(64);
    /// Messages that want an acknowledgement
    pub const RELIABLE: Priority = Priority(70);
    /// Acknowledgements
    pub const ACK: Priority = Priority(120);
    /// Highest priority
    pub const MAX: Priority = Priority(127);
}

/// Application payload of a decoded packet
#[derive(Debug, Clone, PartialEq)]
pub struct Data {
    /// Port the payload belongs to
    pub portnum: PortNum,
    /// Application bytes
    pub payload: Bytes,
    /// Sender asks the destination to respond
    pub want_response: bool,
    /// Final destination when relayed
    pub dest: Option<u32>,
    /// Original sender when relayed
    pub source: Option<u32>,
    /// Packet this one responds to (acks carry the acknowledged id here)
    pub request_id: Option<u32>,
    /// Packet this one replies to
    pub reply_id: Option<u32>,
}

impl Data {
    /// Create a payload for `portnum`
    pub fn new(portnum: PortNum, payload: impl Into<Bytes>) -> Self {
        Self {
            portnum,
            payload: payload.into(),
            want_response: false,
            dest: None,
            source: None,
            request_id: None,
            reply_id: None,
        }
    }

    /// Create a payload carrying typed content
    pub fn from_content(content: &MessageContent) -> Self {
        let (portnum, payload) = content.encode();
        Self::new(portnum, payload)
    }

    /// Set the request id
    pub fn with_request_id(mut self, request_id: u32) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Interpret the payload according to its port
    pub fn content(&self) -> Result<MessageContent, DecodeError> {
        MessageContent::decode(self.portnum, &self.payload)
    }
}

fn nonzero(v: u32) -> Option<u32> {
    (v != 0).then_some(v)
}

impl From<proto::Data> for Data {
    fn from(d: proto::Data) -> Self {
        Self {
            portnum: PortNum::from(d.portnum as u32),
            payload: Bytes::from(d.payload),
            want_response: d.want_response,
            dest: nonzero(d.dest),
            source: nonzero(d.source),
            request_id: nonzero(d.request_id),
            reply_id: nonzero(d.reply_id),
        }
    }
}

impl From<&Data> for proto::Data {
    fn from(d: &Data) -> Self {
        Self {
            portnum: u32::from(d.portnum) as i32,
            payload: d.payload.to_vec(),
            want_response: d.want_response,
            dest: d.dest.unwrap_or(0),
            source: d.source.unwrap_or(0),
            request_id: d.request_id.unwrap_or(0),
            reply_id: d.reply_id.unwrap_or(0),
            emoji: 0,
        }
    }
}

/// Packet payload: decrypted by the radio, or still ciphertext
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Ciphertext the radio could not decrypt (foreign channel key)
    Encrypted(Bytes),
    /// Cleartext application payload
    Decoded(Data),
}

/// A unit of mesh traffic
#[derive(Debug, Clone, PartialEq)]
pub struct MeshPacket {
    /// Originating node
    pub from: u32,
    /// Destination node; broadcast is `0` or `0xFFFFFFFF`
    pub to: u32,
    /// Packet id, unique per originator within the dedup window
    pub id: u32,
    /// Channel index
    pub channel: u8,
    /// Payload
    pub payload: Payload,
    /// Remaining hops
    pub hop_limit: u8,
    /// Sender wants a delivery acknowledgement
    pub want_ack: bool,
    /// Transmit priority
    pub priority: Priority,
    /// Local receipt time
    pub rx_time: Option<DateTime<Utc>>,
    /// SNR of the received signal
    pub rx_snr: f32,
    /// RSSI of the received signal
    pub rx_rssi: i32,
}

impl MeshPacket {
    /// Create a packet with default radio metadata
    pub fn new(from: u32, to: u32, id: u32, payload: Payload) -> Self {
        Self {
            from,
            to,
            id,
            channel: 0,
            payload,
            hop_limit: crate::config::DEFAULT_HOP_LIMIT,
            want_ack: false,
            priority: Priority::UNSET,
            rx_time: None,
            rx_snr: 0.0,
            rx_rssi: 0,
        }
    }

    /// Check if this is a broadcast packet
    pub fn is_broadcast(&self) -> bool {
        self.to == 0 || self.to == BROADCAST_ADDR
    }

    /// Decoded payload, if the radio decrypted it
    pub fn decoded(&self) -> Option<&Data> {
        match &self.payload {
            Payload::Decoded(data) => Some(data),
            Payload::Encrypted(_) => None,
        }
    }

    /// Port of the decoded payload
    pub fn portnum(&self) -> Option<PortNum> {
        self.decoded().map(|d| d.portnum)
    }
}

/// Converts between frame bodies and [`MeshPacket`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct MeshPacketCodec;

impl MeshPacketCodec {
    /// Decode a frame body into a packet
    pub fn decode(body: &[u8]) -> Result<MeshPacket, DecodeError> {
        let wire = proto::MeshPacket::decode(body)?;

        let payload = match wire.payload_variant {
            Some(proto::mesh_packet::PayloadVariant::Decoded(data)) => {
                Payload::Decoded(data.into())
            }
            Some(proto::mesh_packet::PayloadVariant::Encrypted(bytes)) => {
                Payload::Encrypted(Bytes::from(bytes))
            }
            None => return Err(DecodeError::Malformed("packet has no payload".to_string())),
        };

        let channel = narrow(wire.channel, "channel")?;
        let hop_limit = narrow(wire.hop_limit, "hop_limit")?;
        let priority = u8::try_from(wire.priority)
            .map(Priority)
            .map_err(|_| DecodeError::Malformed(format!("priority {} out of range", wire.priority)))?;

        Ok(MeshPacket {
            from: wire.from,
            to: wire.to,
            id: wire.id,
            channel,
            payload,
            hop_limit,
            want_ack: wire.want_ack,
            priority,
            rx_time: (wire.rx_time != 0)
                .then(|| Utc.timestamp_opt(i64::from(wire.rx_time), 0).single())
                .flatten(),
            rx_snr: wire.rx_snr,
            rx_rssi: wire.rx_rssi,
        })
    }

    /// Encode a packet into a frame body
    pub fn encode(packet: &MeshPacket) -> Bytes {
        let payload_variant = match &packet.payload {
            Payload::Decoded(data) => proto::mesh_packet::PayloadVariant::Decoded(data.into()),
            Payload::Encrypted(bytes) => proto::mesh_packet::PayloadVariant::Encrypted(bytes.to_vec()),
        };

        let wire = proto::MeshPacket {
            from: packet.from,
            to: packet.to,
            channel: u32::from(packet.channel),
            id: packet.id,
            rx_time: packet
                .rx_time
                .and_then(|t| u32::try_from(t.timestamp()).ok())
                .unwrap_or(0),
            rx_snr: packet.rx_snr,
            hop_limit: u32::from(packet.hop_limit),
            want_ack: packet.want_ack,
            priority: i32::from(packet.priority.0),
            rx_rssi: packet.rx_rssi,
            payload_variant: Some(payload_variant),
        };
        Bytes::from(wire.encode_to_vec())
    }
}

fn narrow(value: u32, field: &str) -> Result<u8, DecodeError> {
    u8::try_from(value).map_err(|_| DecodeError::Malformed(format!("{field} {value} out of range")))
}

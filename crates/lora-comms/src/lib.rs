//! Device communication core for Meshtastic LoRa mesh radios
//!
//! This crate talks to a Meshtastic radio over a serial port or Bluetooth
//! LE, turns the byte stream into typed mesh packets and events, keeps a
//! registry of nodes heard on the mesh, and validates radio settings
//! against regional rules before they are applied.
//!
//! # Architecture
//!
//! The crate operates in four layers:
//!
//! 1. **Transport** - [`SerialSession`] (baud probing) and [`BleSession`]
//!    (GATT state machine, chunked writes) move raw bytes
//! 2. **Framing** - [`FrameCodec`] reassembles and checks frames,
//!    [`MeshPacketCodec`] converts frame bodies to [`MeshPacket`]s
//! 3. **Processing** - [`MessageProcessor`] drops duplicates, updates the
//!    [`NodeRegistry`] and publishes [`MeshEvent`]s
//! 4. **Radio settings** - [`RadioConfigValidator`] checks presets, power
//!    and duty cycle per [`Region`]
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // Enable the `serial` feature to use TokioSerialOpener
//! // Cargo.toml: lora-comms = { version = "0.1", features = ["serial"] }
//!
//! use lora_comms::{
//!     Destination, LoraCommsConfigBuilder, MeshEvent, MessageProcessor, Priority,
//!     SerialSession, TokioSerialOpener,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LoraCommsConfigBuilder::new().local_node_id(0x1234_5678).build();
//!
//!     let opener = TokioSerialOpener::default();
//!     let session = SerialSession::open("/dev/ttyUSB0", &opener, &config.serial).await?;
//!
//!     let processor = MessageProcessor::new(config.processor);
//!     let mut events = processor.subscribe();
//!     processor.attach(Arc::new(session));
//!
//!     processor.send_text(Destination::Broadcast, "hello mesh", Priority::DEFAULT).await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let MeshEvent::MessageReceived { packet, text, .. } = event {
//!             println!("{:08x}: {}", packet.from, text);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `serial` - Serial ports via `tokio-serial` (requires `libudev-dev` on Linux)
//! - `ble` - Bluetooth LE via `btleplug`
//! - `full` - Enable all backends
//!
//! # Wire Format
//!
//! Frames look the same on every transport:
//!
//! - `0x94` start marker
//! - protobuf body followed by its CRC-16 (little-endian), with `0x94`,
//!   `0x7E` and `0x7D` escaped as `0x7D, byte ^ 0x20`
//! - `0x7E` end marker
//!
//! Maximum LoRa payload is **237 bytes**.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Core
pub mod config;
pub mod error;

// Framing and packets
pub mod content;
pub mod crc;
pub mod frame;
pub mod packet;
#[allow(missing_docs)]
pub mod proto;

// Processing
pub mod dedup;
pub mod event;
pub mod processor;
pub mod registry;

// Links to the radio
pub mod discovery;
pub mod reconnect;
pub mod transport;

// Radio settings
pub mod radio;

// Testing utilities
pub mod test_utils;

pub use config::{
    BleConfig, LoraCommsConfig, LoraCommsConfigBuilder, ProcessorConfig, SerialConfig,
};
pub use error::{
    ConfigError, ConnectError, ConnectFailureReason, DecodeError, FrameError, LoraCommsError,
    Result, SendError, TransportError,
};

pub use content::{
    DeviceMetrics, EnvironmentMetrics, MessageContent, NodeRole, PortNum, Position, Routing,
    Telemetry, TelemetryMetrics, UserInfo, Waypoint,
};
pub use frame::{CodecStats, FrameCodec};
pub use packet::{Data, MeshPacket, MeshPacketCodec, Payload, Priority};

pub use dedup::{DedupStats, DeduplicationCache};
pub use event::MeshEvent;
pub use processor::{Destination, MessageProcessor, ProcessorStats, SendOptions};
pub use registry::{NodeProfile, NodeRegistry};

pub use discovery::{DeviceInfo, DeviceKind};
pub use reconnect::{reconnect_with, ReconnectPolicy};
pub use transport::ble::{BleCentral, BlePeripheral, BleSession, BleState};
pub use transport::serial::{SerialOpener, SerialSession, SerialState};
pub use transport::{ConnectionState, TransportId, TransportKind, TransportSession};

#[cfg(feature = "ble")]
pub use transport::BtleplugCentral;
#[cfg(feature = "serial")]
pub use transport::TokioSerialOpener;

pub use radio::{ModemPreset, RadioConfig, RadioConfigValidator, Region};

// Protocol constants re-exports
pub use config::{BROADCAST_ADDR, DEFAULT_HOP_LIMIT, LORA_MAX_PAYLOAD, MAX_HOP_LIMIT};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_constants() {
        assert_eq!(config::FRAME_START, 0x94);
        assert_eq!(config::FRAME_END, 0x7E);
        assert_eq!(LORA_MAX_PAYLOAD, 237);
        assert_eq!(BROADCAST_ADDR, 0xFFFF_FFFF);
        assert_eq!(MAX_HOP_LIMIT, 7);
    }
}

//! Byte transports to a radio
//!
//! A [`TransportSession`] is an established link that moves raw framed
//! bytes. Sessions never retry on their own: a failed read surfaces as an
//! error, the session is `Disconnected`, and the caller decides whether to
//! reconnect (see [`crate::reconnect`]).
//!
//! - [`serial::SerialSession`] - serial port with baud rate probing
//! - [`ble::BleSession`] - Bluetooth LE GATT with chunked, throttled writes
//!
//! Hardware backends sit behind features:
//!
//! - `serial`: [`TokioSerialOpener`] on `tokio-serial`. Requires
//!   `libudev-dev` and `pkg-config` on Linux.
//! - `ble`: [`BtleplugCentral`] on `btleplug`. Requires BlueZ development
//!   files (`libdbus-1-dev`) on Linux.
//!
//! Without the features both sessions still work against any
//! [`serial::SerialOpener`] / [`ble::BleCentral`] implementation.

pub mod ble;
pub mod serial;

#[cfg(feature = "ble")]
mod btle;
#[cfg(feature = "ble")]
pub use btle::BtleplugCentral;

#[cfg(feature = "serial")]
pub use serial::TokioSerialOpener;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;

/// Physical link type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Serial port (USB CDC / UART bridge)
    Serial,
    /// Bluetooth LE GATT
    Ble,
    /// In-memory link, used by tests
    Virtual,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Serial => write!(f, "serial"),
            TransportKind::Ble => write!(f, "ble"),
            TransportKind::Virtual => write!(f, "virtual"),
        }
    }
}

/// Identifies one transport for decode state and event attribution
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(String);

impl TransportId {
    /// Create an id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TransportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransportId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// An established link to a radio
///
/// Implementations must be safe to share: one task reads while others
/// write, and `close` may be called from anywhere.
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Identifier used in logs and events
    fn id(&self) -> TransportId;

    /// Link type
    fn kind(&self) -> TransportKind;

    /// Check if the link is currently usable
    fn is_connected(&self) -> bool;

    /// Wait for the next chunk of inbound bytes.
    ///
    /// Chunk boundaries carry no meaning; the caller reassembles frames.
    /// Returns [`TransportError::Closed`] once the session was closed
    /// locally and another error when the link was lost.
    async fn recv(&self) -> Result<Bytes, TransportError>;

    /// Write already framed bytes
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Stop reads, release the link. Idempotent.
    async fn close(&self);
}

/// Whether the processor has a live session, as reported in
/// `ConnectionChanged` events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Session ended or was lost
    Disconnected,
    /// Session attached
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
    }

    #[test]
    fn test_transport_id() {
        let id = TransportId::from("serial:/dev/ttyUSB0");
        assert_eq!(id.as_str(), "serial:/dev/ttyUSB0");
        assert_eq!(id.to_string(), "serial:/dev/ttyUSB0");
        assert_eq!(TransportKind::Ble.to_string(), "ble");
    }
}

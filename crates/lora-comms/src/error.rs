//! Error types for the device communication core
//!
//! Each concern gets its own error enum so callers can match on exactly the
//! failures an operation can produce:
//!
//! - [`FrameError`] - a span of the inbound byte stream could not be framed
//! - [`DecodeError`] - a frame body is not a valid mesh packet or payload
//! - [`TransportError`] - read/write failures on an open session
//! - [`ConnectError`] - a session could not be established
//! - [`SendError`] - an outbound message was not delivered
//! - [`ConfigError`] - configuration was rejected
//!
//! [`LoraCommsError`] wraps all of them for callers that only need `?`.

use thiserror::Error;
use uuid::Uuid;

/// A span of inbound bytes that could not be turned into a frame.
///
/// Frame errors never terminate a session; the codec resynchronises on the
/// next start marker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Checksum over the de-stuffed body did not match the trailer
    #[error("CRC mismatch: expected 0x{expected:04X}, computed 0x{actual:04X}")]
    CrcMismatch {
        /// CRC carried by the frame
        expected: u16,
        /// CRC computed over the received body
        actual: u16,
    },

    /// No end marker within the bounded reassembly window
    #[error("Frame exceeds maximum size: {size} bytes buffered (max {max})")]
    FrameTooLarge {
        /// Bytes discarded
        size: usize,
        /// Configured bound on the wire size of a frame
        max: usize,
    },

    /// A new start marker arrived before the current frame ended
    #[error("Truncated frame: {discarded} bytes discarded")]
    Truncated {
        /// Bytes discarded
        discarded: usize,
    },

    /// Escape byte followed by a byte that is never escaped, or trailing escape
    #[error("Invalid escape sequence at offset {offset}")]
    InvalidEscape {
        /// Offset within the stuffed body
        offset: usize,
    },

    /// Body too short to carry a CRC trailer
    #[error("Frame too short: {len} bytes")]
    TooShort {
        /// De-stuffed length
        len: usize,
    },
}

/// A frame body that is not a usable mesh packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The envelope itself failed to decode
    #[error("Malformed packet: {0}")]
    Malformed(String),

    /// The envelope decoded but its payload does not match its port number
    #[error("Payload does not match port {portnum}: {reason}")]
    PayloadMismatch {
        /// Raw port number of the packet
        portnum: u32,
        /// Why interpretation failed
        reason: String,
    },
}

impl From<prost::DecodeError> for DecodeError {
    fn from(err: prost::DecodeError) -> Self {
        DecodeError::Malformed(err.to_string())
    }
}

/// Failures on an established (or closing) session.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Operation on a session that is not connected
    #[error("Transport is not connected")]
    NotConnected,

    /// Session was closed locally
    #[error("Transport closed")]
    Closed,

    /// Remote end went away (EOF, link loss)
    #[error("Transport disconnected: {0}")]
    Disconnected(String),

    /// Read failure
    #[error("Read error: {0}")]
    Read(String),

    /// Write failure
    #[error("Write error: {0}")]
    Write(String),

    /// Error reported by the Bluetooth stack
    #[error("BLE error: {0}")]
    Ble(String),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse connect failure categories surfaced to user interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectFailureReason {
    /// No usable Bluetooth adapter
    BluetoothUnavailable,
    /// Requested device was not found
    PeripheralNotFound,
    /// Required GATT service or characteristic missing
    CharacteristicNotFound,
    /// Link could not be established
    UnableToConnect,
    /// Link established but data could not be exchanged
    TransmissionError,
}

impl std::fmt::Display for ConnectFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectFailureReason::BluetoothUnavailable => write!(f, "bluetooth unavailable"),
            ConnectFailureReason::PeripheralNotFound => write!(f, "peripheral not found"),
            ConnectFailureReason::CharacteristicNotFound => write!(f, "characteristic not found"),
            ConnectFailureReason::UnableToConnect => write!(f, "unable to connect"),
            ConnectFailureReason::TransmissionError => write!(f, "transmission error"),
        }
    }
}

/// A session could not be established.
#[derive(Error, Debug)]
pub enum ConnectError {
    // ===== Serial Errors =====
    /// Serial port not found
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// Serial port open failed
    #[error("Failed to open serial port {port}: {reason}")]
    PortOpenFailed {
        /// Port path
        port: String,
        /// Failure reason
        reason: String,
    },

    /// No candidate baud rate produced a valid frame
    #[error("No response from {port} at any of {tried:?} baud")]
    NoResponse {
        /// Port path
        port: String,
        /// Baud rates probed, in order
        tried: Vec<u32>,
    },

    // ===== BLE Errors =====
    /// No Bluetooth adapter available
    #[error("Bluetooth unavailable: {0}")]
    BluetoothUnavailable(String),

    /// Peripheral not found during scan
    #[error("Peripheral not found: {0}")]
    PeripheralNotFound(String),

    /// Radio service missing from the peripheral
    #[error("Service {0} not found on peripheral")]
    MissingService(Uuid),

    /// Required characteristic missing from the peripheral
    #[error("Characteristic {0} not found on peripheral")]
    MissingCharacteristic(Uuid),

    // ===== General Errors =====
    /// Link could not be established
    #[error("Unable to connect: {0}")]
    UnableToConnect(String),

    /// Connect attempt timed out
    #[error("Connection timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Transport failure during setup
    #[error("Transport error during connect: {0}")]
    Transport(#[from] TransportError),
}

impl ConnectError {
    /// Map to the coarse category shown to users
    pub fn reason(&self) -> ConnectFailureReason {
        match self {
            ConnectError::BluetoothUnavailable(_) => ConnectFailureReason::BluetoothUnavailable,
            ConnectError::PeripheralNotFound(_) | ConnectError::PortNotFound(_) => {
                ConnectFailureReason::PeripheralNotFound
            }
            ConnectError::MissingService(_) | ConnectError::MissingCharacteristic(_) => {
                ConnectFailureReason::CharacteristicNotFound
            }
            ConnectError::PortOpenFailed { .. }
            | ConnectError::NoResponse { .. }
            | ConnectError::UnableToConnect(_)
            | ConnectError::Timeout { .. } => ConnectFailureReason::UnableToConnect,
            ConnectError::Transport(_) => ConnectFailureReason::TransmissionError,
        }
    }
}

/// An outbound message was not delivered.
#[derive(Error, Debug)]
pub enum SendError {
    /// No session attached
    #[error("No transport session attached")]
    NotConnected,

    /// Encoded packet exceeds the packet-size ceiling
    #[error("Message too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge {
        /// Actual size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Write to the session failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Destination (or a relay) rejected the packet
    #[error("Packet 0x{packet_id:08X} rejected with routing error {error_reason}")]
    Nak {
        /// Packet that was rejected
        packet_id: u32,
        /// Routing error code
        error_reason: i32,
    },

    /// No acknowledgement within the ack timeout
    #[error("No acknowledgement for packet 0x{packet_id:08X} after {duration_ms}ms")]
    AckTimeout {
        /// Packet awaiting acknowledgement
        packet_id: u32,
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Session closed while the send was outstanding
    #[error("Send cancelled: session closed")]
    Cancelled,
}

/// Configuration was rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Spreading factor outside 7..=12
    #[error("Invalid spreading factor {0} (must be 7-12)")]
    InvalidSpreadingFactor(u8),

    /// Bandwidth not in the supported set
    #[error("Invalid bandwidth {0} Hz")]
    InvalidBandwidth(u32),

    /// Coding rate outside 5..=8
    #[error("Invalid coding rate 4/{0} (must be 4/5-4/8)")]
    InvalidCodingRate(u8),

    /// TX power above the absolute or regional ceiling
    #[error("TX power {power_dbm} dBm exceeds limit of {max_dbm} dBm")]
    TxPowerTooHigh {
        /// Requested power
        power_dbm: u8,
        /// Applicable ceiling
        max_dbm: u8,
    },

    /// Frequency outside the region's band
    #[error("Frequency {frequency_mhz} MHz outside {region} band {start_mhz}-{end_mhz} MHz")]
    FrequencyOutOfRange {
        /// Requested frequency
        frequency_mhz: f32,
        /// Region name
        region: String,
        /// Band start
        start_mhz: f32,
        /// Band end
        end_mhz: f32,
    },

    /// Expected airtime exceeds the region's duty cycle
    #[error("Duty cycle {used_percent:.2}% exceeds regional limit of {limit_percent}%")]
    DutyCycleExceeded {
        /// Estimated share of airtime per hour
        used_percent: f32,
        /// Regional limit
        limit_percent: f32,
    },

    /// Configuration text could not be parsed
    #[error("Invalid configuration: {0}")]
    Parse(String),
}

/// Umbrella error for the crate
#[derive(Error, Debug)]
pub enum LoraCommsError {
    /// Framing error
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Packet decode error
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Transport error
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Connect error
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Send error
    #[error(transparent)]
    Send(#[from] SendError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl LoraCommsError {
    /// Check if this error is recoverable/retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            LoraCommsError::Transport(
                TransportError::Disconnected(_) | TransportError::Read(_) | TransportError::Write(_)
            ) | LoraCommsError::Connect(
                ConnectError::Timeout { .. }
                    | ConnectError::NoResponse { .. }
                    | ConnectError::UnableToConnect(_)
                    | ConnectError::PeripheralNotFound(_)
            ) | LoraCommsError::Send(SendError::AckTimeout { .. } | SendError::Transport(_))
        )
    }

    /// Check if this is a protocol error (bad data from device)
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, LoraCommsError::Frame(_) | LoraCommsError::Decode(_))
    }

    /// Get an error code for logging/metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            LoraCommsError::Frame(e) => match e {
                FrameError::CrcMismatch { .. } => "CRC_MISMATCH",
                FrameError::FrameTooLarge { .. } => "FRAME_TOO_LARGE",
                FrameError::Truncated { .. } => "FRAME_TRUNCATED",
                FrameError::InvalidEscape { .. } => "INVALID_ESCAPE",
                FrameError::TooShort { .. } => "FRAME_TOO_SHORT",
            },
            LoraCommsError::Decode(e) => match e {
                DecodeError::Malformed(_) => "MALFORMED_PACKET",
                DecodeError::PayloadMismatch { .. } => "PAYLOAD_MISMATCH",
            },
            LoraCommsError::Transport(e) => match e {
                TransportError::NotConnected => "NOT_CONNECTED",
                TransportError::Closed => "CLOSED",
                TransportError::Disconnected(_) => "DISCONNECTED",
                TransportError::Read(_) => "READ_ERROR",
                TransportError::Write(_) => "WRITE_ERROR",
                TransportError::Ble(_) => "BLE_ERROR",
                TransportError::Io(_) => "IO_ERROR",
            },
            LoraCommsError::Connect(e) => match e {
                ConnectError::PortNotFound(_) => "PORT_NOT_FOUND",
                ConnectError::PortOpenFailed { .. } => "PORT_OPEN_FAILED",
                ConnectError::NoResponse { .. } => "NO_RESPONSE",
                ConnectError::BluetoothUnavailable(_) => "BLUETOOTH_UNAVAILABLE",
                ConnectError::PeripheralNotFound(_) => "PERIPHERAL_NOT_FOUND",
                ConnectError::MissingService(_) => "MISSING_SERVICE",
                ConnectError::MissingCharacteristic(_) => "MISSING_CHARACTERISTIC",
                ConnectError::UnableToConnect(_) => "UNABLE_TO_CONNECT",
                ConnectError::Timeout { .. } => "CONNECTION_TIMEOUT",
                ConnectError::Transport(_) => "CONNECT_TRANSPORT_ERROR",
            },
            LoraCommsError::Send(e) => match e {
                SendError::NotConnected => "SEND_NOT_CONNECTED",
                SendError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
                SendError::Transport(_) => "SEND_TRANSPORT_ERROR",
                SendError::Nak { .. } => "NAK",
                SendError::AckTimeout { .. } => "ACK_TIMEOUT",
                SendError::Cancelled => "SEND_CANCELLED",
            },
            LoraCommsError::Config(e) => match e {
                ConfigError::InvalidSpreadingFactor(_) => "INVALID_SPREADING_FACTOR",
                ConfigError::InvalidBandwidth(_) => "INVALID_BANDWIDTH",
                ConfigError::InvalidCodingRate(_) => "INVALID_CODING_RATE",
                ConfigError::TxPowerTooHigh { .. } => "TX_POWER_TOO_HIGH",
                ConfigError::FrequencyOutOfRange { .. } => "FREQUENCY_OUT_OF_RANGE",
                ConfigError::DutyCycleExceeded { .. } => "DUTY_CYCLE_EXCEEDED",
                ConfigError::Parse(_) => "CONFIG_PARSE",
            },
        }
    }
}

/// Result type alias for crate operations
pub type Result<T> = std::result::Result<T, LoraCommsError>;

// Conversion from serialport error (only when serial feature is enabled)
#[cfg(feature = "serial")]
impl From<serialport::Error> for ConnectError {
    fn from(err: serialport::Error) -> Self {
        match err.kind {
            serialport::ErrorKind::NoDevice => ConnectError::PortNotFound(err.description),
            serialport::ErrorKind::Io(kind) => ConnectError::Transport(TransportError::Io(
                std::io::Error::new(kind, err.description),
            )),
            _ => ConnectError::PortOpenFailed {
                port: String::new(),
                reason: err.description,
            },
        }
    }
}

//! Configuration types for the device communication core
//!
//! This module provides the protocol constants and the configuration tree
//! for serial probing, BLE chunking, message processing and reconnection.
//! Durations are written as human-readable strings ("300s", "20ms").

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;
use crate::reconnect::ReconnectPolicy;

/// Frame start marker
pub const FRAME_START: u8 = 0x94;

/// Frame end marker
pub const FRAME_END: u8 = 0x7E;

/// Escape byte used for byte-stuffing
pub const FRAME_ESCAPE: u8 = 0x7D;

/// Value XORed into an escaped byte
pub const ESCAPE_XOR: u8 = 0x20;

/// Default ceiling on a frame body (encoded packet) in bytes
pub const DEFAULT_MAX_PACKET_SIZE: usize = 512;

/// Maximum payload size for Meshtastic LoRa packets
pub const LORA_MAX_PAYLOAD: usize = 237;

/// Baud rates probed when opening a serial port, in order
pub const SERIAL_BAUD_RATES: [u32; 5] = [115200, 921600, 57600, 38400, 19200];

/// Default hop limit for outgoing packets
pub const DEFAULT_HOP_LIMIT: u8 = 3;

/// Maximum allowed hops in Meshtastic protocol
pub const MAX_HOP_LIMIT: u8 = 7;

/// Firmware broadcast node number
pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

/// Default BLE write size when the stack does not report one
pub const DEFAULT_BLE_WRITE_SIZE: usize = 512;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoraCommsConfig {
    /// Serial session settings
    #[serde(default)]
    pub serial: SerialConfig,

    /// BLE session settings
    #[serde(default)]
    pub ble: BleConfig,

    /// Message processor settings
    #[serde(default)]
    pub processor: ProcessorConfig,

    /// Reconnection policy
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl LoraCommsConfig {
    /// Parse configuration from a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Serialize configuration to TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Serial session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Candidate baud rates, probed in order
    #[serde(default = "default_baud_rates")]
    pub baud_rates: Vec<u32>,

    /// How long to wait for a valid frame at each baud rate
    #[serde(with = "humantime_serde", default = "default_probe_timeout")]
    pub probe_timeout: Duration,

    /// Size of the read buffer
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Frame body ceiling used while probing
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

fn default_baud_rates() -> Vec<u32> {
    SERIAL_BAUD_RATES.to_vec()
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_read_buffer_size() -> usize {
    512
}

fn default_max_packet_size() -> usize {
    DEFAULT_MAX_PACKET_SIZE
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rates: default_baud_rates(),
            probe_timeout: default_probe_timeout(),
            read_buffer_size: default_read_buffer_size(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

/// BLE session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleConfig {
    /// How long to scan for the requested peripheral
    #[serde(with = "humantime_serde", default = "default_scan_timeout")]
    pub scan_timeout: Duration,

    /// Bound on connect plus discovery
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Packet-size ceiling applied to each write
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    /// Pause between consecutive chunks of one write
    #[serde(with = "humantime_serde", default = "default_chunk_delay")]
    pub chunk_delay: Duration,

    /// Capacity of the inbound notification queue
    #[serde(default = "default_notify_queue")]
    pub notify_queue_size: usize,
}

fn default_scan_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_chunk_delay() -> Duration {
    Duration::from_millis(20)
}

fn default_notify_queue() -> usize {
    256
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            scan_timeout: default_scan_timeout(),
            connect_timeout: default_connect_timeout(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            chunk_delay: default_chunk_delay(),
            notify_queue_size: default_notify_queue(),
        }
    }
}

/// Message processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Node number of the attached radio, used as `from` on sent packets
    #[serde(default)]
    pub local_node_id: u32,

    /// Ceiling on an encoded packet
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    /// Size of deduplication cache (number of packets)
    #[serde(default = "default_dedup_cache_size")]
    pub dedup_cache_size: usize,

    /// Retention window for deduplication entries
    #[serde(with = "humantime_serde", default = "default_dedup_ttl")]
    pub dedup_ttl: Duration,

    /// Nodes not heard from within this window are reported offline
    #[serde(with = "humantime_serde", default = "default_node_timeout")]
    pub node_offline_timeout: Duration,

    /// How long `send_text` waits for an acknowledgement
    #[serde(with = "humantime_serde", default = "default_ack_timeout")]
    pub ack_timeout: Duration,

    /// Hop limit for outgoing packets
    #[serde(default = "default_hop_limit")]
    pub hop_limit: u8,

    /// Capacity of the event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_dedup_cache_size() -> usize {
    1000
}

fn default_dedup_ttl() -> Duration {
    Duration::from_secs(300) // 5 minutes
}

fn default_node_timeout() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_hop_limit() -> u8 {
    DEFAULT_HOP_LIMIT
}

fn default_event_capacity() -> usize {
    256
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            local_node_id: 0,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            dedup_cache_size: default_dedup_cache_size(),
            dedup_ttl: default_dedup_ttl(),
            node_offline_timeout: default_node_timeout(),
            ack_timeout: default_ack_timeout(),
            hop_limit: DEFAULT_HOP_LIMIT,
            event_capacity: default_event_capacity(),
        }
    }
}

/// Builder for LoraCommsConfig
#[derive(Debug, Default)]
pub struct LoraCommsConfigBuilder {
    config: LoraCommsConfig,
}

impl LoraCommsConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the node number of the attached radio
    pub fn local_node_id(mut self, node_id: u32) -> Self {
        self.config.processor.local_node_id = node_id;
        self
    }

    /// Set the packet-size ceiling for every layer
    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.config.processor.max_packet_size = size;
        self.config.serial.max_packet_size = size;
        self.config.ble.max_packet_size = size;
        self
    }

    /// Set hop limit for outgoing packets
    pub fn hop_limit(mut self, hops: u8) -> Self {
        self.config.processor.hop_limit = hops.min(MAX_HOP_LIMIT);
        self
    }

    /// Set deduplication cache size and retention window
    pub fn dedup(mut self, size: usize, ttl: Duration) -> Self {
        self.config.processor.dedup_cache_size = size;
        self.config.processor.dedup_ttl = ttl;
        self
    }

    /// Set acknowledgement timeout
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.processor.ack_timeout = timeout;
        self
    }

    /// Set node offline timeout
    pub fn node_offline_timeout(mut self, timeout: Duration) -> Self {
        self.config.processor.node_offline_timeout = timeout;
        self
    }

    /// Set candidate baud rates
    pub fn baud_rates(mut self, rates: impl Into<Vec<u32>>) -> Self {
        self.config.serial.baud_rates = rates.into();
        self
    }

    /// Set per-rate probe timeout
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.serial.probe_timeout = timeout;
        self
    }

    /// Set delay between BLE write chunks
    pub fn ble_chunk_delay(mut self, delay: Duration) -> Self {
        self.config.ble.chunk_delay = delay;
        self
    }

    /// Set reconnection policy
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    /// Build the configuration
    pub fn build(self) -> LoraCommsConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
pub(crate) mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoraCommsConfig::default();
        assert_eq!(config.processor.hop_limit, DEFAULT_HOP_LIMIT);
        assert_eq!(config.processor.dedup_ttl, Duration::from_secs(300));
        assert_eq!(config.serial.baud_rates, SERIAL_BAUD_RATES.to_vec());
        assert_eq!(config.ble.max_packet_size, DEFAULT_MAX_PACKET_SIZE);
    }

    #[test]
    fn test_config_builder() {
        let config = LoraCommsConfigBuilder::new()
            .local_node_id(0x1234)
            .max_packet_size(256)
            .ack_timeout(Duration::from_secs(5))
            .build();

        assert_eq!(config.processor.local_node_id, 0x1234);
        assert_eq!(config.processor.max_packet_size, 256);
        assert_eq!(config.serial.max_packet_size, 256);
        assert_eq!(config.ble.max_packet_size, 256);
        assert_eq!(config.processor.ack_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_hop_limit_clamping() {
        let config = LoraCommsConfigBuilder::new().hop_limit(10).build();
        assert_eq!(config.processor.hop_limit, MAX_HOP_LIMIT);
    }

    #[test]
    fn test_from_toml_with_humantime() {
        let config = LoraCommsConfig::from_toml_str(
            r#"
            [serial]
            baud_rates = [921600]
            probe_timeout = "500ms"

            [ble]
            chunk_delay = "5ms"

            [processor]
            local_node_id = 42
            dedup_ttl = "10m"
            "#,
        )
        .unwrap();

        assert_eq!(config.serial.baud_rates, vec![921600]);
        assert_eq!(config.serial.probe_timeout, Duration::from_millis(500));
        assert_eq!(config.ble.chunk_delay, Duration::from_millis(5));
        assert_eq!(config.processor.local_node_id, 42);
        assert_eq!(config.processor.dedup_ttl, Duration::from_secs(600));
        // Untouched sections keep their defaults
        assert_eq!(config.processor.ack_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_from_toml_rejects_bad_duration() {
        let err = LoraCommsConfig::from_toml_str("[processor]\ndedup_ttl = \"soon\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = LoraCommsConfigBuilder::new().local_node_id(7).build();
        let text = config.to_toml_string().unwrap();
        let parsed = LoraCommsConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.processor.local_node_id, 7);
        assert_eq!(parsed.reconnect, config.reconnect);
    }
}

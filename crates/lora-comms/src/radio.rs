//! LoRa radio parameters and regulatory validation
//!
//! [`RadioConfigValidator`] is consulted before a connection is attempted:
//! it rejects parameter sets the modem cannot use and parameter sets a
//! region's regulations forbid. Nothing is ever clamped into range; an
//! invalid config is an error for the caller to fix.
//!
//! # Airtime
//!
//! [`RadioConfigValidator::estimate_airtime`] implements the Semtech
//! time-on-air formula for explicit-header packets with CRC enabled:
//!
//! ```text
//! Tsym      = 2^SF / BW
//! Tpreamble = (Npreamble + 4.25) * Tsym
//! Npayload  = 8 + max(ceil((8*PL - 4*SF + 28 + 16) / (4*(SF - 2*DE))) * CR, 0)
//! ```
//!
//! where `CR` is the coding-rate denominator (5 for 4/5 .. 8 for 4/8) and
//! `DE` (low data rate optimisation) is on when `Tsym` exceeds 16 ms.

use bytes::Bytes;
use prost::Message;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::{DEFAULT_HOP_LIMIT, LORA_MAX_PAYLOAD};
use crate::error::ConfigError;
use crate::proto;

/// Absolute transmit power ceiling in dBm, regardless of region
pub const MAX_TX_POWER_DBM: u8 = 30;

/// Bandwidths the modem supports, in Hz
pub const VALID_BANDWIDTHS: [u32; 10] = [
    7_800, 10_400, 15_600, 20_800, 31_250, 41_700, 62_500, 125_000, 250_000, 500_000,
];

/// Regulatory region
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Region {
    US,
    EU433,
    EU868,
    CN,
    JP,
    ANZ,
    KR,
    TW,
    RU,
    IN,
    NZ865,
    TH,
    UA433,
    UA868,
    MY433,
    MY919,
    SG923,
    /// User-supplied centre frequency in MHz; band checks are skipped
    Custom(f32),
}

/// Regulatory limits for a region
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionLimits {
    /// Lowest allowed frequency (MHz)
    pub start_mhz: f32,
    /// Highest allowed frequency (MHz)
    pub end_mhz: f32,
    /// Transmit power ceiling (dBm)
    pub max_power_dbm: u8,
    /// Share of airtime allowed, in percent (100 = unrestricted)
    pub duty_cycle_percent: f32,
}

impl Region {
    /// Every named region
    pub const ALL: [Region; 17] = [
        Region::US,
        Region::EU433,
        Region::EU868,
        Region::CN,
        Region::JP,
        Region::ANZ,
        Region::KR,
        Region::TW,
        Region::RU,
        Region::IN,
        Region::NZ865,
        Region::TH,
        Region::UA433,
        Region::UA868,
        Region::MY433,
        Region::MY919,
        Region::SG923,
    ];

    /// Band, power and duty-cycle limits; `None` for custom frequencies
    pub fn limits(&self) -> Option<RegionLimits> {
        let (start_mhz, end_mhz, max_power_dbm) = match self {
            Region::US => (902.0, 928.0, 30),
            Region::EU433 => (433.05, 434.79, 12),
            Region::EU868 => (863.0, 870.0, 27),
            Region::CN => (470.0, 510.0, 19),
            Region::JP => (920.0, 925.0, 13),
            Region::ANZ => (915.0, 928.0, 30),
            Region::KR => (920.0, 925.0, 23),
            Region::TW => (920.0, 925.0, 27),
            Region::RU => (868.0, 870.0, 20),
            Region::IN => (865.0, 867.0, 30),
            Region::NZ865 => (864.0, 868.0, 30),
            Region::TH => (920.0, 925.0, 16),
            Region::UA433 => (433.05, 434.79, 10),
            Region::UA868 => (868.0, 870.0, 14),
            Region::MY433 => (433.05, 434.79, 20),
            Region::MY919 => (919.0, 924.0, 27),
            Region::SG923 => (917.0, 925.0, 20),
            Region::Custom(_) => return None,
        };
        Some(RegionLimits {
            start_mhz,
            end_mhz,
            max_power_dbm,
            duty_cycle_percent: self.duty_cycle_percent(),
        })
    }

    /// Allowed share of airtime in percent
    pub fn duty_cycle_percent(&self) -> f32 {
        match self {
            Region::EU433 | Region::EU868 | Region::UA433 | Region::UA868 => 1.0,
            _ => 100.0,
        }
    }

    /// Transmit power ceiling for this region
    pub fn max_power_dbm(&self) -> u8 {
        self.limits()
            .map(|l| l.max_power_dbm)
            .unwrap_or(MAX_TX_POWER_DBM)
    }

    /// Region code the radio firmware uses
    pub fn region_code(&self) -> i32 {
        match self {
            Region::Custom(_) => 0,
            Region::US => 1,
            Region::EU433 => 2,
            Region::EU868 => 3,
            Region::CN => 4,
            Region::JP => 5,
            Region::ANZ => 6,
            Region::KR => 7,
            Region::TW => 8,
            Region::RU => 9,
            Region::IN => 10,
            Region::NZ865 => 11,
            Region::TH => 12,
            Region::UA433 => 14,
            Region::UA868 => 15,
            Region::MY433 => 16,
            Region::MY919 => 17,
            Region::SG923 => 18,
        }
    }

    /// Presets whose region defaults pass validation here, fastest first.
    ///
    /// Duty-cycled regions lose the slow presets.
    pub fn presets(&self) -> Vec<ModemPreset> {
        ModemPreset::ALL
            .into_iter()
            .filter(|preset| RadioConfig::for_region(*self).with_preset(*preset).validate().is_ok())
            .collect()
    }

    /// Conventional centre frequency in MHz
    pub fn default_frequency_mhz(&self) -> f32 {
        match self {
            Region::US | Region::ANZ => 915.0,
            Region::EU433 | Region::UA433 | Region::MY433 => 433.175,
            Region::EU868 | Region::NZ865 => 866.0,
            Region::RU | Region::UA868 => 869.0,
            Region::IN => 866.0,
            Region::CN => 490.0,
            Region::JP | Region::KR | Region::TW | Region::TH => 923.0,
            Region::MY919 => 921.0,
            Region::SG923 => 923.0,
            Region::Custom(freq) => *freq,
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Region::US => write!(f, "US"),
            Region::EU433 => write!(f, "EU_433"),
            Region::EU868 => write!(f, "EU_868"),
            Region::CN => write!(f, "CN"),
            Region::JP => write!(f, "JP"),
            Region::ANZ => write!(f, "ANZ"),
            Region::KR => write!(f, "KR"),
            Region::TW => write!(f, "TW"),
            Region::RU => write!(f, "RU"),
            Region::IN => write!(f, "IN"),
            Region::NZ865 => write!(f, "NZ_865"),
            Region::TH => write!(f, "TH"),
            Region::UA433 => write!(f, "UA_433"),
            Region::UA868 => write!(f, "UA_868"),
            Region::MY433 => write!(f, "MY_433"),
            Region::MY919 => write!(f, "MY_919"),
            Region::SG923 => write!(f, "SG_923"),
            Region::Custom(freq) => write!(f, "CUSTOM({freq} MHz)"),
        }
    }
}

/// Named modem settings
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModemPreset {
    ShortFast,
    ShortSlow,
    MediumFast,
    MediumSlow,
    LongFast,
    LongModerate,
    LongSlow,
    VeryLongSlow,
}

impl ModemPreset {
    /// Every preset, fastest first
    pub const ALL: [ModemPreset; 8] = [
        ModemPreset::ShortFast,
        ModemPreset::ShortSlow,
        ModemPreset::MediumFast,
        ModemPreset::MediumSlow,
        ModemPreset::LongFast,
        ModemPreset::LongModerate,
        ModemPreset::LongSlow,
        ModemPreset::VeryLongSlow,
    ];

    /// Preset code the radio firmware uses
    pub fn preset_code(&self) -> i32 {
        match self {
            ModemPreset::LongFast => 0,
            ModemPreset::LongSlow => 1,
            ModemPreset::VeryLongSlow => 2,
            ModemPreset::MediumSlow => 3,
            ModemPreset::MediumFast => 4,
            ModemPreset::ShortSlow => 5,
            ModemPreset::ShortFast => 6,
            ModemPreset::LongModerate => 7,
        }
    }

    /// `(spreading_factor, bandwidth_hz, coding_rate)`
    pub fn modem_params(&self) -> (u8, u32, u8) {
        match self {
            ModemPreset::ShortFast => (7, 250_000, 5),
            ModemPreset::ShortSlow => (8, 250_000, 5),
            ModemPreset::MediumFast => (9, 250_000, 5),
            ModemPreset::MediumSlow => (10, 250_000, 5),
            ModemPreset::LongFast => (11, 250_000, 5),
            ModemPreset::LongModerate => (11, 125_000, 8),
            ModemPreset::LongSlow => (12, 125_000, 8),
            ModemPreset::VeryLongSlow => (12, 62_500, 8),
        }
    }
}

/// LoRa radio configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioConfig {
    /// Regulatory region
    pub region: Region,
    /// Centre frequency in MHz
    pub frequency_mhz: f32,
    /// Spreading factor (7-12)
    pub spreading_factor: u8,
    /// Bandwidth in Hz
    pub bandwidth: u32,
    /// Coding rate denominator: 5 means 4/5, 8 means 4/8
    pub coding_rate: u8,
    /// Transmit power in dBm
    pub tx_power: u8,
    /// Preamble length in symbols
    #[serde(default = "default_preamble_len")]
    pub preamble_len: u16,
    /// Channel slot within the band
    #[serde(default)]
    pub channel_num: u32,
    /// Preset these parameters came from, if any
    #[serde(default)]
    pub preset: Option<ModemPreset>,
}

fn default_preamble_len() -> u16 {
    16
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self::for_region(Region::US)
    }
}

impl RadioConfig {
    /// Defaults for a region: its centre frequency, the long-fast preset and
    /// the smaller of 20 dBm and the region ceiling
    pub fn for_region(region: Region) -> Self {
        Self {
            region,
            frequency_mhz: region.default_frequency_mhz(),
            spreading_factor: 11,
            bandwidth: 250_000,
            coding_rate: 5,
            tx_power: region.max_power_dbm().min(20),
            preamble_len: default_preamble_len(),
            channel_num: 0,
            preset: None,
        }
        .with_preset(ModemPreset::LongFast)
    }

    /// Apply a modem preset
    pub fn with_preset(mut self, preset: ModemPreset) -> Self {
        let (sf, bw, cr) = preset.modem_params();
        self.spreading_factor = sf;
        self.bandwidth = bw;
        self.coding_rate = cr;
        self.preset = Some(preset);
        self
    }

    /// Set transmit power
    pub fn with_tx_power(mut self, dbm: u8) -> Self {
        self.tx_power = dbm;
        self
    }

    /// Allowed airtime share for the configured region
    pub fn duty_cycle_percent(&self) -> f32 {
        self.region.duty_cycle_percent()
    }

    /// Raw bit rate: `SF * BW / 2^SF * 4 / CR`
    pub fn data_rate_bps(&self) -> f32 {
        let sf = f32::from(self.spreading_factor);
        let bw = self.bandwidth as f32;
        let cr = f32::from(self.coding_rate.max(1));
        sf * (bw / 2f32.powf(sf)) * (4.0 / cr)
    }

    /// Time on air for one packet of `payload_bytes`
    pub fn airtime(&self, payload_bytes: usize) -> Duration {
        RadioConfigValidator::estimate_airtime(self, payload_bytes)
    }

    /// Check that sending `packets_per_hour` packets of `payload_bytes`
    /// stays within the region's duty cycle
    pub fn check_duty_cycle(
        &self,
        packets_per_hour: u32,
        payload_bytes: usize,
    ) -> Result<(), ConfigError> {
        let limit_percent = self.duty_cycle_percent();
        if limit_percent >= 100.0 {
            return Ok(());
        }
        let per_packet = self.airtime(payload_bytes).as_secs_f64();
        let used_percent = (per_packet * f64::from(packets_per_hour) / 3600.0 * 100.0) as f32;
        if used_percent > limit_percent {
            return Err(ConfigError::DutyCycleExceeded {
                used_percent,
                limit_percent,
            });
        }
        Ok(())
    }

    /// Validate with the default validator
    pub fn validate(&self) -> Result<(), ConfigError> {
        RadioConfigValidator::default().validate(self)
    }

    /// Named starting points for common deployments in `region`.
    ///
    /// Entries the region's rules reject are left out.
    pub fn recommendations(region: Region) -> Vec<(&'static str, RadioConfig)> {
        RECOMMENDED_PRESETS
            .iter()
            .map(|(label, preset)| (*label, RadioConfig::for_region(region).with_preset(*preset)))
            .filter(|(_, config)| config.validate().is_ok())
            .collect()
    }

    /// Encode as an admin `set_config` request for the local radio.
    ///
    /// Explicit modem parameters are sent (`use_preset` off) so custom
    /// settings survive; the preset code is informational.
    pub fn to_admin_payload(&self) -> Bytes {
        let lora = proto::LoRaConfig {
            use_preset: false,
            modem_preset: self.preset.unwrap_or(ModemPreset::LongFast).preset_code(),
            bandwidth: self.bandwidth,
            spread_factor: u32::from(self.spreading_factor),
            coding_rate: u32::from(self.coding_rate),
            frequency_offset: 0.0,
            region: self.region.region_code(),
            hop_limit: u32::from(DEFAULT_HOP_LIMIT),
            tx_enabled: true,
            tx_power: i32::from(self.tx_power),
            channel_num: self.channel_num,
            override_duty_cycle: false,
            override_frequency: match self.region {
                Region::Custom(_) => self.frequency_mhz,
                _ => 0.0,
            },
        };
        let admin = proto::AdminMessage {
            set_config: Some(proto::Config { lora: Some(lora) }),
        };
        admin.encode_to_vec().into()
    }
}

const RECOMMENDED_PRESETS: [(&str, ModemPreset); 4] = [
    ("City/Urban - Short Range", ModemPreset::ShortFast),
    ("Suburban - Medium Range", ModemPreset::MediumSlow),
    ("Rural - Long Range", ModemPreset::LongSlow),
    ("Remote - Maximum Range", ModemPreset::VeryLongSlow),
];

/// Validates [`RadioConfig`]s against modem and regional limits
#[derive(Debug, Clone)]
pub struct RadioConfigValidator {
    /// Payload size assumed for the duty-cycle check
    pub representative_payload: usize,
    /// Transmissions per hour assumed for the duty-cycle check
    pub packets_per_hour: u32,
}

impl Default for RadioConfigValidator {
    fn default() -> Self {
        Self {
            representative_payload: LORA_MAX_PAYLOAD,
            packets_per_hour: 10,
        }
    }
}

impl RadioConfigValidator {
    /// Create a validator with a custom traffic assumption
    pub fn new(packets_per_hour: u32, representative_payload: usize) -> Self {
        Self {
            representative_payload,
            packets_per_hour,
        }
    }

    /// Reject configs the modem cannot use or the region forbids
    pub fn validate(&self, config: &RadioConfig) -> Result<(), ConfigError> {
        if !(7..=12).contains(&config.spreading_factor) {
            return Err(ConfigError::InvalidSpreadingFactor(config.spreading_factor));
        }
        if !VALID_BANDWIDTHS.contains(&config.bandwidth) {
            return Err(ConfigError::InvalidBandwidth(config.bandwidth));
        }
        if !(5..=8).contains(&config.coding_rate) {
            return Err(ConfigError::InvalidCodingRate(config.coding_rate));
        }

        let max_dbm = config.region.max_power_dbm().min(MAX_TX_POWER_DBM);
        if config.tx_power > max_dbm {
            return Err(ConfigError::TxPowerTooHigh {
                power_dbm: config.tx_power,
                max_dbm,
            });
        }

        if let Some(limits) = config.region.limits() {
            if config.frequency_mhz < limits.start_mhz || config.frequency_mhz > limits.end_mhz {
                return Err(ConfigError::FrequencyOutOfRange {
                    frequency_mhz: config.frequency_mhz,
                    region: config.region.to_string(),
                    start_mhz: limits.start_mhz,
                    end_mhz: limits.end_mhz,
                });
            }
        }

        config.check_duty_cycle(self.packets_per_hour, self.representative_payload)?;

        debug!(
            region = %config.region,
            sf = config.spreading_factor,
            bw = config.bandwidth,
            "Radio config valid"
        );
        Ok(())
    }

    /// Time on air for one packet of `payload_bytes` with `config`'s modem
    /// parameters
    pub fn estimate_airtime(config: &RadioConfig, payload_bytes: usize) -> Duration {
        let sf = f64::from(config.spreading_factor);
        let bw = f64::from(config.bandwidth.max(1));
        let cr = f64::from(config.coding_rate);

        let t_sym = 2f64.powf(sf) / bw;
        let de = if t_sym > 0.016 { 1.0 } else { 0.0 };
        let t_preamble = (f64::from(config.preamble_len) + 4.25) * t_sym;

        let numerator = 8.0 * payload_bytes as f64 - 4.0 * sf + 28.0 + 16.0;
        let denominator = 4.0 * (sf - 2.0 * de);
        let payload_symbols = if denominator > 0.0 {
            8.0 + ((numerator / denominator).ceil() * cr).max(0.0)
        } else {
            8.0
        };

        // Out-of-range modem parameters can overflow; saturate
        Duration::try_from_secs_f64(t_preamble + payload_symbols * t_sym).unwrap_or(Duration::MAX)
    }
}

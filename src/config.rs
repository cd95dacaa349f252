use crate::error::{Result, StreamError};
use modular_bitfield::prelude::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum_macros::Display;

/// Largest channel list a StreamConfig command frame can carry.
pub const MAX_CHANNELS: usize = 25;

/// Largest number of samples the U3 packs into one StreamData response.
pub const MAX_SAMPLES_PER_PACKET: u8 = 25;

/// Negative channel number selecting a single-ended (ground referenced) reading.
pub const SINGLE_ENDED: u8 = 31;

/// Negative channel number selecting the Vref reference.
pub const VREF_REFERENCED: u8 = 30;

const HIGHEST_FLEXIBLE_IO: u8 = 15;

/// Bits of the ScanConfig byte in a StreamConfig command.
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanConfigBits {
    pub resolution: B2,
    pub divide_clock_by_256: bool,
    pub clock_48mhz: bool,
    #[skip]
    reserved: B4,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum Resolution {
    #[strum(to_string = "12.8-bit effective")]
    Bits12_8 = 0,
    #[default]
    #[strum(to_string = "11.9-bit effective")]
    Bits11_9 = 1,
    #[strum(to_string = "11.3-bit effective")]
    Bits11_3 = 2,
    #[strum(to_string = "10.5-bit effective")]
    Bits10_5 = 3,
}

/// Stream clock and resolution settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub resolution: Resolution,
    /// Use the 48 MHz internal clock instead of 4 MHz.
    pub clock_48mhz: bool,
    pub divide_clock_by_256: bool,
}

impl ScanConfig {
    pub fn to_byte(&self) -> u8 {
        ScanConfigBits::new()
            .with_resolution(self.resolution.into())
            .with_divide_clock_by_256(self.divide_clock_by_256)
            .with_clock_48mhz(self.clock_48mhz)
            .into_bytes()[0]
    }

    pub fn from_byte(byte: u8) -> Self {
        let bits = ScanConfigBits::from_bytes([byte]);
        Self {
            // Two bits always map onto one of the four variants
            resolution: Resolution::try_from(bits.resolution()).unwrap_or_default(),
            clock_48mhz: bits.clock_48mhz(),
            divide_clock_by_256: bits.divide_clock_by_256(),
        }
    }

    /// Effective stream clock in Hz.
    pub fn clock_hz(&self) -> f64 {
        let base = if self.clock_48mhz { 48_000_000.0 } else { 4_000_000.0 };
        if self.divide_clock_by_256 { base / 256.0 } else { base }
    }
}

/// One analog input: a positive line measured against a negative line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPair {
    pub positive: u8,
    pub negative: u8,
}

impl ChannelPair {
    pub fn single_ended(positive: u8) -> Self {
        Self {
            positive,
            negative: SINGLE_ENDED,
        }
    }

    pub fn is_single_ended(&self) -> bool {
        self.negative == SINGLE_ENDED
    }
}

/// Stream layout sent with StreamConfig. Fixed for as long as the stream runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub channels: Vec<ChannelPair>,
    /// Must be a multiple of the channel count so every packet holds whole scans.
    pub samples_per_packet: u8,
    /// Scan period in stream clock ticks.
    pub scan_interval: u16,
    pub scan: ScanConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::single_ended(4)
    }
}

impl StreamConfig {
    /// AIN0 through AIN(n-1), single ended, one scan per packet.
    pub fn single_ended(num_channels: u8) -> Self {
        Self {
            channels: (0..num_channels).map(ChannelPair::single_ended).collect(),
            samples_per_packet: num_channels,
            scan_interval: 4000,
            scan: ScanConfig::default(),
        }
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn scans_per_packet(&self) -> usize {
        self.samples_per_packet as usize / self.num_channels().max(1)
    }

    /// Size in bytes of one StreamData response.
    pub fn response_size(&self) -> usize {
        14 + 2 * self.samples_per_packet as usize
    }

    pub fn scan_rate_hz(&self) -> f64 {
        self.scan.clock_hz() / self.scan_interval.max(1) as f64
    }

    pub fn validate(&self) -> Result<()> {
        let n = self.num_channels();
        if n == 0 || n > MAX_CHANNELS {
            return Err(StreamError::InvalidConfig(format!(
                "channel count {} outside 1..={}",
                n, MAX_CHANNELS
            )));
        }
        if self.samples_per_packet == 0 || self.samples_per_packet > MAX_SAMPLES_PER_PACKET {
            return Err(StreamError::InvalidConfig(format!(
                "samples per packet {} outside 1..={}",
                self.samples_per_packet, MAX_SAMPLES_PER_PACKET
            )));
        }
        if self.samples_per_packet as usize % n != 0 {
            return Err(StreamError::InvalidConfig(format!(
                "samples per packet {} is not a multiple of {} channels",
                self.samples_per_packet, n
            )));
        }
        if self.scan_interval == 0 {
            return Err(StreamError::InvalidConfig("scan interval must be nonzero".to_string()));
        }
        for (index, pair) in self.channels.iter().enumerate() {
            if pair.positive > HIGHEST_FLEXIBLE_IO {
                return Err(StreamError::InvalidConfig(format!(
                    "channel {}: positive line {} is not an analog input",
                    index, pair.positive
                )));
            }
            let negative_ok =
                pair.negative <= HIGHEST_FLEXIBLE_IO || pair.negative == VREF_REFERENCED || pair.negative == SINGLE_ENDED;
            if !negative_ok {
                return Err(StreamError::InvalidConfig(format!(
                    "channel {}: negative line {} is not supported",
                    index, pair.negative
                )));
            }
        }
        Ok(())
    }
}

/// How to find and talk to the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Open the U3 with this serial number, or the first one found.
    pub serial: Option<u32>,
    pub timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            serial: None,
            timeout_ms: 1000,
        }
    }
}

impl DeviceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = StreamConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_channels(), 4);
        assert_eq!(config.samples_per_packet, 4);
        assert_eq!(config.response_size(), 22);
        assert_eq!(config.scans_per_packet(), 1);
        assert_eq!(config.scan.to_byte(), 0x01);
        assert!((config.scan_rate_hz() - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_samples_must_be_multiple_of_channels() {
        let mut config = StreamConfig::single_ended(4);
        config.samples_per_packet = 6;
        assert!(matches!(config.validate(), Err(StreamError::InvalidConfig(_))));
        config.samples_per_packet = 24;
        assert!(config.validate().is_ok());
        assert_eq!(config.scans_per_packet(), 6);
    }

    #[test]
    fn test_rejects_bad_channels() {
        let mut config = StreamConfig::single_ended(1);
        config.channels[0].positive = 16;
        assert!(config.validate().is_err());

        config.channels[0] = ChannelPair {
            positive: 0,
            negative: 20,
        };
        assert!(config.validate().is_err());

        config.channels[0].negative = VREF_REFERENCED;
        assert!(config.validate().is_ok());

        let empty = StreamConfig {
            channels: Vec::new(),
            ..StreamConfig::default()
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_scan_config_bits() {
        let scan = ScanConfig {
            resolution: Resolution::Bits10_5,
            clock_48mhz: true,
            divide_clock_by_256: true,
        };
        assert_eq!(scan.to_byte(), 0b0000_1111);
        assert_eq!(ScanConfig::from_byte(0b0000_1111), scan);
        assert_eq!(ScanConfig::from_byte(0x01), ScanConfig::default());
    }

    #[test]
    fn test_stream_config_from_partial_json() {
        let config: StreamConfig = serde_json::from_str(r#"{"scan_interval": 2000}"#).unwrap();
        assert_eq!(config.scan_interval, 2000);
        assert_eq!(config.num_channels(), 4);
    }
}

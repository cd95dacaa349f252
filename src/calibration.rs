//! Raw ADC code to volts, using the constants stored in the U3's flash.

use crate::config::{ChannelPair, StreamConfig};
use crate::error::{Result, StreamError};
use crate::frame::{DeviceInfo, ReadCalibrationBlock, ReadDeviceInfo};
use crate::transport::{Transport, transact};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tracing::info;

pub const NUM_CONSTANTS: usize = 20;
pub const NUM_BLOCKS: u8 = 5;

/// Hardware revisions from here on use [`VoltageScale::Hw130`].
pub const HW130_THRESHOLD: f64 = 1.30;

// Indices into the constant table
const LV_SINGLE_ENDED_SLOPE: usize = 0;
const LV_SINGLE_ENDED_OFFSET: usize = 1;
const LV_DIFFERENTIAL_SLOPE: usize = 2;
const LV_DIFFERENTIAL_OFFSET: usize = 3;
const VREG: usize = 11;
const HV_SLOPE: usize = 12;
const HV_OFFSET: usize = 16;
const HV_CHANNELS: u8 = 4;

/// Calibration constants and the hardware facts that decide how to apply them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationInfo {
    pub hardware_version: f64,
    pub high_voltage: bool,
    pub constants: [f64; NUM_CONSTANTS],
}

impl CalibrationInfo {
    /// Datasheet nominal constants for a low-voltage U3 at hardware 1.30.
    pub fn nominal() -> Self {
        let mut constants = [0.0; NUM_CONSTANTS];
        constants[LV_SINGLE_ENDED_SLOPE] = 3.7231e-5;
        constants[LV_SINGLE_ENDED_OFFSET] = 0.0;
        constants[LV_DIFFERENTIAL_SLOPE] = 7.4463e-5;
        constants[LV_DIFFERENTIAL_OFFSET] = -2.44;
        constants[4] = 51.717; // DAC0 slope
        constants[6] = 51.717; // DAC1 slope
        constants[8] = 0.013021; // temperature slope
        constants[9] = 2.44; // Vref
        constants[10] = 3.66; // 1.5 * Vref
        constants[VREG] = 3.3;
        for ch in 0..HV_CHANNELS as usize {
            constants[HV_SLOPE + ch] = 3.14e-4;
            constants[HV_OFFSET + ch] = -10.3;
        }
        Self {
            hardware_version: HW130_THRESHOLD,
            high_voltage: false,
            constants,
        }
    }

    pub fn from_device(info: &DeviceInfo, constants: [f64; NUM_CONSTANTS]) -> Self {
        Self {
            hardware_version: info.hardware_version,
            high_voltage: info.high_voltage,
            constants,
        }
    }
}

/// Reads the device identity and all five calibration blocks.
pub fn read_calibration<T: Transport + ?Sized>(transport: &mut T) -> Result<(DeviceInfo, CalibrationInfo)> {
    let device = transact(transport, &ReadDeviceInfo)?;
    info!(
        serial = device.serial_number,
        hardware = device.hardware_version,
        firmware = device.firmware_version,
        high_voltage = device.high_voltage,
        "Read device info"
    );

    let mut constants = [0.0; NUM_CONSTANTS];
    for block in 0..NUM_BLOCKS {
        let values = transact(transport, &ReadCalibrationBlock { block })?;
        let offset = block as usize * 4;
        constants[offset..offset + 4].copy_from_slice(&values);
    }
    Ok((device, CalibrationInfo::from_device(&device, constants)))
}

/// Conversion formula family, chosen once from the hardware version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum VoltageScale {
    /// Before 1.30: an enabled DAC1 moves the analog reference to Vreg.
    Legacy { dac1_enabled: bool },
    /// 1.30 and later: high-voltage units calibrate AIN0-3 separately.
    Hw130 { high_voltage: bool },
}

/// Per-stream voltage conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct VoltageCalibration {
    scale: VoltageScale,
    constants: [f64; NUM_CONSTANTS],
}

impl VoltageCalibration {
    pub fn new(info: &CalibrationInfo, dac1_enabled: bool) -> Self {
        let scale = if info.hardware_version >= HW130_THRESHOLD {
            VoltageScale::Hw130 {
                high_voltage: info.high_voltage,
            }
        } else {
            VoltageScale::Legacy { dac1_enabled }
        };
        Self {
            scale,
            constants: info.constants,
        }
    }

    pub fn scale(&self) -> VoltageScale {
        self.scale
    }

    /// Rejects channel pairs this hardware has no calibration for.
    pub fn check(&self, config: &StreamConfig) -> Result<()> {
        if let VoltageScale::Hw130 { high_voltage: true } = self.scale {
            for pair in &config.channels {
                if !pair.is_single_ended() && pair.positive < HV_CHANNELS {
                    return Err(StreamError::InvalidConfig(format!(
                        "differential reading on high-voltage AIN{} is not supported",
                        pair.positive
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn to_volts(&self, channel: &ChannelPair, raw: u16) -> f64 {
        let c = &self.constants;
        let raw = raw as f64;
        match (self.scale, channel.is_single_ended()) {
            (VoltageScale::Legacy { dac1_enabled: true }, true) => raw / 65536.0 * c[VREG],
            (VoltageScale::Legacy { dac1_enabled: true }, false) => raw / 65536.0 * c[VREG] * 2.0 - c[VREG],
            (VoltageScale::Hw130 { high_voltage: true }, true) if channel.positive < HV_CHANNELS => {
                let ch = channel.positive as usize;
                c[HV_SLOPE + ch] * raw + c[HV_OFFSET + ch]
            }
            (_, true) => c[LV_SINGLE_ENDED_SLOPE] * raw + c[LV_SINGLE_ENDED_OFFSET],
            (_, false) => c[LV_DIFFERENTIAL_SLOPE] * raw + c[LV_DIFFERENTIAL_OFFSET],
        }
    }
}

//! Command frames for the U3 low-level function interface.
//!
//! Every command is a [`Transaction`]: a request frame plus the parser for the
//! fixed-size response it produces. Parsers check, in this order, the
//! checksums, the echoed command bytes and the device errorcode, and stop at
//! the first failure.

use crate::checksum::{
    apply_checksum8, apply_extended_checksum, checksum8, embedded_checksum16, extended_checksum8,
    extended_checksum16,
};
use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use strum_macros::Display;
use zerocopy::FromBytes;
use zerocopy::byteorder::little_endian::{I64, U16, U32};
use zerocopy::{Immutable, IntoBytes, KnownLayout, Unaligned};

/// Command byte of every extended request and response.
pub const EXTENDED_COMMAND: u8 = 0xF8;

/// Command byte of StreamData responses.
pub const STREAM_DATA_COMMAND: u8 = 0xF9;

/// Extended command number of StreamData responses.
pub const STREAM_DATA_ID: u8 = 0xC0;

const STREAM_START: u8 = 0xA8;
const STREAM_START_ACK: u8 = 0xA9;
const STREAM_STOP: u8 = 0xB0;
const STREAM_STOP_ACK: u8 = 0xB1;

/// Offset of the errorcode in extended responses.
const ERRORCODE_OFFSET: usize = 6;

/// Low-level functions this crate speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Command {
    ConfigIo,
    StreamConfig,
    StreamStart,
    StreamStop,
    StreamData,
    ConfigU3,
    ReadMem,
}

/// Extended command numbers (byte 3 of an extended frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ExtendedCommand {
    ConfigU3 = 0x08,
    ConfigIo = 0x0B,
    StreamConfig = 0x11,
    ReadMem = 0x2D,
}

/// A request frame and the parser for its fixed-size response.
pub trait Transaction {
    const COMMAND: Command;
    const RESPONSE_LEN: usize;
    type Response;

    fn request(&self) -> Bytes;

    fn parse(&self, response: &[u8]) -> Result<Self::Response>;
}

/// Allocates an extended frame with the header filled in and zeroed checksums.
fn extended_frame(id: ExtendedCommand, length: usize) -> BytesMut {
    debug_assert!(length >= 6 && (length - 6) % 2 == 0);
    let mut frame = BytesMut::with_capacity(length);
    frame.put_u8(0);
    frame.put_u8(EXTENDED_COMMAND);
    frame.put_u8(((length - 6) / 2) as u8);
    frame.put_u8(id.into());
    frame.put_u16_le(0);
    frame
}

fn finish_extended(mut frame: BytesMut) -> Bytes {
    apply_extended_checksum(&mut frame);
    frame.freeze()
}

fn expect_len(command: Command, frame: &[u8], expected: usize) -> Result<()> {
    if frame.len() < expected {
        return Err(StreamError::ShortRead {
            command,
            expected,
            actual: frame.len(),
        });
    }
    Ok(())
}

/// Recomputes checksum16 then checksum8 of an extended frame.
pub(crate) fn verify_extended_checksums(command: Command, frame: &[u8]) -> Result<()> {
    let computed = extended_checksum16(frame, frame.len());
    let received = embedded_checksum16(frame);
    if computed != received {
        return Err(StreamError::Checksum16 {
            command,
            computed,
            received,
        });
    }
    let computed = extended_checksum8(frame);
    if computed != frame[0] {
        return Err(StreamError::Checksum8 {
            command,
            computed,
            received: frame[0],
        });
    }
    Ok(())
}

fn verify_extended_echo(command: Command, frame: &[u8], word_count: u8, id: ExtendedCommand) -> Result<()> {
    if frame[1..4] != [EXTENDED_COMMAND, word_count, id.into()] {
        return Err(StreamError::WrongCommandBytes {
            command,
            received: frame[1..4].to_vec(),
        });
    }
    Ok(())
}

fn verify_errorcode(command: Command, code: u8) -> Result<()> {
    if code != 0 {
        return Err(StreamError::DeviceError { command, code });
    }
    Ok(())
}

/// Checks a 4-byte StreamStart/StreamStop acknowledgement.
fn verify_stream_ack(command: Command, frame: &[u8], ack: u8) -> Result<()> {
    expect_len(command, frame, 4)?;
    let frame = &frame[..4];
    let computed = checksum8(frame);
    if computed != frame[0] {
        return Err(StreamError::Checksum8 {
            command,
            computed,
            received: frame[0],
        });
    }
    if frame[1] != ack || frame[3] != 0x00 {
        return Err(StreamError::WrongCommandBytes {
            command,
            received: frame.to_vec(),
        });
    }
    verify_errorcode(command, frame[2])
}

/// ConfigIO: every FIO/EIO line to analog input, timers and counters off.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigIo;

/// What ConfigIO read back from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoConfig {
    /// DAC1 shares its reference with the analog inputs on pre-1.30 hardware.
    pub dac1_enabled: bool,
    pub fio_analog: u8,
    pub eio_analog: u8,
}

impl ConfigIo {
    /// TimerCounterConfig (bit 0), FIOAnalog (bit 2) and EIOAnalog (bit 3).
    const WRITE_MASK: u8 = 13;
    /// All timers and counters disabled, pin offset 4.
    const TIMER_COUNTER_CONFIG: u8 = 64;
    const ALL_ANALOG: u8 = 255;
    /// Hardware without EIO-capable FIO4-7 only reports the low nibble.
    const LOW_NIBBLE_ANALOG: u8 = 0x0F;
}

impl Transaction for ConfigIo {
    const COMMAND: Command = Command::ConfigIo;
    const RESPONSE_LEN: usize = 12;
    type Response = IoConfig;

    fn request(&self) -> Bytes {
        let mut frame = extended_frame(ExtendedCommand::ConfigIo, 12);
        frame.put_u8(Self::WRITE_MASK);
        frame.put_u8(0); // reserved
        frame.put_u8(Self::TIMER_COUNTER_CONFIG);
        frame.put_u8(0); // DAC1Enable, not in the write mask
        frame.put_u8(Self::ALL_ANALOG);
        frame.put_u8(Self::ALL_ANALOG);
        finish_extended(frame)
    }

    fn parse(&self, response: &[u8]) -> Result<IoConfig> {
        expect_len(Self::COMMAND, response, Self::RESPONSE_LEN)?;
        let frame = &response[..Self::RESPONSE_LEN];
        verify_extended_checksums(Self::COMMAND, frame)?;
        verify_extended_echo(Self::COMMAND, frame, 0x03, ExtendedCommand::ConfigIo)?;
        verify_errorcode(Self::COMMAND, frame[ERRORCODE_OFFSET])?;

        if frame[8] != Self::TIMER_COUNTER_CONFIG {
            return Err(StreamError::ConfigMismatch {
                command: Self::COMMAND,
                field: "TimerCounterConfig",
                actual: frame[8],
            });
        }
        if frame[10] != Self::ALL_ANALOG && frame[10] != Self::LOW_NIBBLE_ANALOG {
            return Err(StreamError::ConfigMismatch {
                command: Self::COMMAND,
                field: "FIOAnalog",
                actual: frame[10],
            });
        }
        if frame[11] != Self::ALL_ANALOG {
            return Err(StreamError::ConfigMismatch {
                command: Self::COMMAND,
                field: "EIOAnalog",
                actual: frame[11],
            });
        }

        Ok(IoConfig {
            dac1_enabled: frame[9] != 0,
            fio_analog: frame[10],
            eio_analog: frame[11],
        })
    }
}

/// StreamConfig for a validated [`StreamConfig`].
#[derive(Debug, Clone, Copy)]
pub struct ConfigureStream<'a> {
    pub config: &'a StreamConfig,
}

impl Transaction for ConfigureStream<'_> {
    const COMMAND: Command = Command::StreamConfig;
    const RESPONSE_LEN: usize = 8;
    type Response = ();

    fn request(&self) -> Bytes {
        let config = self.config;
        let num_channels = config.num_channels();
        let mut frame = extended_frame(ExtendedCommand::StreamConfig, 12 + 2 * num_channels);
        frame.put_u8(num_channels as u8);
        frame.put_u8(config.samples_per_packet);
        frame.put_u8(0); // reserved
        frame.put_u8(config.scan.to_byte());
        frame.put_u16_le(config.scan_interval);
        for pair in &config.channels {
            frame.put_u8(pair.positive);
            frame.put_u8(pair.negative);
        }
        finish_extended(frame)
    }

    fn parse(&self, response: &[u8]) -> Result<()> {
        expect_len(Self::COMMAND, response, Self::RESPONSE_LEN)?;
        let frame = &response[..Self::RESPONSE_LEN];
        verify_extended_checksums(Self::COMMAND, frame)?;
        verify_extended_echo(Self::COMMAND, frame, 0x01, ExtendedCommand::StreamConfig)?;
        if frame[7] != 0x00 {
            return Err(StreamError::WrongCommandBytes {
                command: Self::COMMAND,
                received: frame[1..8].to_vec(),
            });
        }
        verify_errorcode(Self::COMMAND, frame[ERRORCODE_OFFSET])
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StartStream;

impl Transaction for StartStream {
    const COMMAND: Command = Command::StreamStart;
    const RESPONSE_LEN: usize = 4;
    type Response = ();

    fn request(&self) -> Bytes {
        let mut frame = [0, STREAM_START];
        apply_checksum8(&mut frame);
        Bytes::copy_from_slice(&frame)
    }

    fn parse(&self, response: &[u8]) -> Result<()> {
        verify_stream_ack(Self::COMMAND, response, STREAM_START_ACK)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StopStream;

impl Transaction for StopStream {
    const COMMAND: Command = Command::StreamStop;
    const RESPONSE_LEN: usize = 4;
    type Response = ();

    fn request(&self) -> Bytes {
        let mut frame = [0, STREAM_STOP];
        apply_checksum8(&mut frame);
        Bytes::copy_from_slice(&frame)
    }

    fn parse(&self, response: &[u8]) -> Result<()> {
        verify_stream_ack(Self::COMMAND, response, STREAM_STOP_ACK)
    }
}

/// ConfigU3 with an empty write mask: reads the device identity without changing anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadDeviceInfo;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceInfo {
    pub firmware_version: f64,
    pub bootloader_version: f64,
    pub hardware_version: f64,
    pub serial_number: u32,
    pub product_id: u16,
    /// U3-HV: AIN0-3 are high-voltage inputs with their own calibration.
    pub high_voltage: bool,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct DeviceInfoRaw {
    header: [u8; 6],
    errorcode: u8,
    reserved: [u8; 2],
    firmware_minor: u8,
    firmware_major: u8,
    bootloader_minor: u8,
    bootloader_major: u8,
    hardware_minor: u8,
    hardware_major: u8,
    serial_number: U32,
    product_id: U16,
    rest: [u8; 16],
    version_info: u8,
}

impl ReadDeviceInfo {
    const HIGH_VOLTAGE_MASK: u8 = 18;
}

fn version(major: u8, minor: u8) -> f64 {
    major as f64 + minor as f64 / 100.0
}

impl Transaction for ReadDeviceInfo {
    const COMMAND: Command = Command::ConfigU3;
    const RESPONSE_LEN: usize = 38;
    type Response = DeviceInfo;

    fn request(&self) -> Bytes {
        let mut frame = extended_frame(ExtendedCommand::ConfigU3, 26);
        frame.put_bytes(0, 20);
        finish_extended(frame)
    }

    fn parse(&self, response: &[u8]) -> Result<DeviceInfo> {
        expect_len(Self::COMMAND, response, Self::RESPONSE_LEN)?;
        let frame = &response[..Self::RESPONSE_LEN];
        verify_extended_checksums(Self::COMMAND, frame)?;
        verify_extended_echo(Self::COMMAND, frame, 0x10, ExtendedCommand::ConfigU3)?;
        verify_errorcode(Self::COMMAND, frame[ERRORCODE_OFFSET])?;

        let raw = DeviceInfoRaw::ref_from_bytes(frame).map_err(|_| StreamError::ShortRead {
            command: Self::COMMAND,
            expected: Self::RESPONSE_LEN,
            actual: frame.len(),
        })?;
        Ok(DeviceInfo {
            firmware_version: version(raw.firmware_major, raw.firmware_minor),
            bootloader_version: version(raw.bootloader_major, raw.bootloader_minor),
            hardware_version: version(raw.hardware_major, raw.hardware_minor),
            serial_number: raw.serial_number.get(),
            product_id: raw.product_id.get(),
            high_voltage: raw.version_info & Self::HIGH_VOLTAGE_MASK == Self::HIGH_VOLTAGE_MASK,
        })
    }
}

/// ReadMem of one 32-byte calibration block.
#[derive(Debug, Clone, Copy)]
pub struct ReadCalibrationBlock {
    pub block: u8,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct CalibrationBlockRaw {
    header: [u8; 6],
    errorcode: u8,
    reserved: u8,
    /// Signed 32.32 fixed point: fraction in the low word, whole part in the high word.
    constants: [I64; 4],
}

const FIXED_POINT_ONE: f64 = 4_294_967_296.0;

impl Transaction for ReadCalibrationBlock {
    const COMMAND: Command = Command::ReadMem;
    const RESPONSE_LEN: usize = 40;
    type Response = [f64; 4];

    fn request(&self) -> Bytes {
        let mut frame = extended_frame(ExtendedCommand::ReadMem, 8);
        frame.put_u8(0);
        frame.put_u8(self.block);
        finish_extended(frame)
    }

    fn parse(&self, response: &[u8]) -> Result<[f64; 4]> {
        expect_len(Self::COMMAND, response, Self::RESPONSE_LEN)?;
        let frame = &response[..Self::RESPONSE_LEN];
        verify_extended_checksums(Self::COMMAND, frame)?;
        verify_extended_echo(Self::COMMAND, frame, 0x11, ExtendedCommand::ReadMem)?;
        verify_errorcode(Self::COMMAND, frame[ERRORCODE_OFFSET])?;

        let raw = CalibrationBlockRaw::ref_from_bytes(frame).map_err(|_| StreamError::ShortRead {
            command: Self::COMMAND,
            expected: Self::RESPONSE_LEN,
            actual: frame.len(),
        })?;
        Ok(raw.constants.map(|c| c.get() as f64 / FIXED_POINT_ONE))
    }
}

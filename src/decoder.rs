//! StreamData response decoding.
//!
//! A response is `14 + 2 * samples_per_packet` bytes:
//!
//! | offset          | content                                         |
//! |-----------------|-------------------------------------------------|
//! | 0               | checksum8                                       |
//! | 1..4            | `0xF9`, `4 + samples_per_packet`, `0xC0`        |
//! | 4..6            | checksum16                                      |
//! | 6..8            | dropped scans (auto-recovery reports only)      |
//! | 10              | packet number                                   |
//! | 11              | status                                          |
//! | 12..12+2n       | raw samples, little endian                      |
//! | 12+2n           | backlog                                         |
//!
//! Nothing about a packet (counter, auto-recovery, backlog) is committed unless
//! every check on it passed.

use crate::calibration::VoltageCalibration;
use crate::config::{ChannelPair, StreamConfig};
use crate::error::{Result, StreamError};
use crate::frame::{Command, STREAM_DATA_COMMAND, STREAM_DATA_ID, verify_extended_checksums};
use crate::transport::Transport;
use num_enum::FromPrimitive;
use serde::Serialize;
use std::slice::ChunksExact;
use tracing::{trace, warn};
use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

const HEADER_SIZE: usize = 12;

/// Status byte of a StreamData response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, Serialize)]
#[repr(u8)]
pub enum StreamStatus {
    Normal = 0,
    /// The device buffer overflowed; it keeps streaming buffered scans.
    AutoRecoverActive = 59,
    /// Auto-recovery ended; the packet carries the number of dropped scans.
    AutoRecoverEnd = 60,
    #[num_enum(catch_all)]
    Error(u8),
}

#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct StreamHeaderRaw {
    checksum8: u8,
    command: u8,
    word_count: u8,
    extended_command: u8,
    checksum16: U16,
    dropped_scans: U16,
    reserved: [u8; 2],
    packet_number: u8,
    status: u8,
}

/// Counters kept across decode calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub packets_decoded: u64,
    pub scans_decoded: u64,
    /// Packets dropped for a bad checksum.
    pub checksum_errors: u64,
    /// Stream reads that failed or came back short.
    pub transport_errors: u64,
    pub auto_recovery_events: u64,
    pub last_dropped_scans: u16,
    pub total_dropped_scans: u64,
    pub backlog: u8,
    pub expected_packet_number: u8,
    pub auto_recovery_active: bool,
}

/// One successfully decoded response. Voltages are scan-major in channel order.
#[derive(Debug, Clone, Copy)]
pub struct DecodedPacket<'a> {
    pub packet_number: u8,
    pub status: StreamStatus,
    pub backlog: u8,
    /// Set on auto-recovery end reports.
    pub dropped_scans: Option<u16>,
    num_channels: usize,
    voltages: &'a [f64],
}

#[derive(Debug, Clone, Copy)]
struct PacketMeta {
    packet_number: u8,
    status: StreamStatus,
    backlog: u8,
    dropped_scans: Option<u16>,
}

impl<'a> DecodedPacket<'a> {
    pub fn voltages(&self) -> &'a [f64] {
        self.voltages
    }

    pub fn scans(&self) -> ChunksExact<'a, f64> {
        self.voltages.chunks_exact(self.num_channels)
    }

    pub fn num_scans(&self) -> usize {
        self.voltages.len() / self.num_channels
    }

    pub fn last_scan(&self) -> Option<&'a [f64]> {
        self.scans().last()
    }
}

pub struct StreamDecoder {
    channels: Vec<ChannelPair>,
    samples_per_packet: usize,
    response_size: usize,
    calibration: VoltageCalibration,
    expected_packet: u8,
    auto_recovery: bool,
    voltages: Vec<f64>,
    last: Option<PacketMeta>,
    stats: StreamStats,
}

impl StreamDecoder {
    pub fn new(config: &StreamConfig, calibration: VoltageCalibration) -> Result<Self> {
        config.validate()?;
        calibration.check(config)?;
        let samples_per_packet = config.samples_per_packet as usize;
        Ok(Self {
            channels: config.channels.clone(),
            samples_per_packet,
            response_size: config.response_size(),
            calibration,
            expected_packet: 0,
            auto_recovery: false,
            voltages: vec![0.0; samples_per_packet],
            last: None,
            stats: StreamStats::default(),
        })
    }

    /// Forgets stream position; called whenever the device (re)starts streaming.
    pub fn reset(&mut self) {
        self.expected_packet = 0;
        self.auto_recovery = false;
        self.last = None;
        self.stats.expected_packet_number = 0;
        self.stats.auto_recovery_active = false;
    }

    pub fn response_size(&self) -> usize {
        self.response_size
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn expected_packet_number(&self) -> u8 {
        self.expected_packet
    }

    pub fn auto_recovery_active(&self) -> bool {
        self.auto_recovery
    }

    pub fn backlog(&self) -> u8 {
        self.stats.backlog
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Swaps the conversion formulas, e.g. once ConfigIO reported the DAC1 state.
    pub fn set_calibration(&mut self, calibration: VoltageCalibration) {
        self.calibration = calibration;
    }

    /// The most recently decoded packet since the last reset.
    pub fn last_packet(&self) -> Option<DecodedPacket<'_>> {
        self.last.map(|meta| self.view(meta))
    }

    fn view(&self, meta: PacketMeta) -> DecodedPacket<'_> {
        DecodedPacket {
            packet_number: meta.packet_number,
            status: meta.status,
            backlog: meta.backlog,
            dropped_scans: meta.dropped_scans,
            num_channels: self.channels.len(),
            voltages: &self.voltages,
        }
    }

    /// Pulls one response from the stream endpoint and decodes it.
    pub fn read_packet<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<DecodedPacket<'_>> {
        let bytes = match transport.stream_read(self.response_size) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.stats.transport_errors += 1;
                return Err(e);
            }
        };
        if bytes.len() < self.response_size {
            self.stats.transport_errors += 1;
            return Err(StreamError::ShortRead {
                command: Command::StreamData,
                expected: self.response_size,
                actual: bytes.len(),
            });
        }
        self.decode(&bytes)
    }

    pub fn decode(&mut self, frame: &[u8]) -> Result<DecodedPacket<'_>> {
        if frame.len() < self.response_size {
            return Err(StreamError::ShortRead {
                command: Command::StreamData,
                expected: self.response_size,
                actual: frame.len(),
            });
        }
        let frame = &frame[..self.response_size];

        if let Err(e) = verify_extended_checksums(Command::StreamData, frame) {
            self.stats.checksum_errors += 1;
            warn!(packet = self.expected_packet, "Dropping packet: {}", e);
            return Err(e);
        }

        let (header, _) = StreamHeaderRaw::ref_from_prefix(frame).map_err(|_| StreamError::ShortRead {
            command: Command::StreamData,
            expected: HEADER_SIZE,
            actual: frame.len(),
        })?;

        let word_count = 4 + self.samples_per_packet as u8;
        if header.command != STREAM_DATA_COMMAND
            || header.word_count != word_count
            || header.extended_command != STREAM_DATA_ID
        {
            return Err(StreamError::WrongCommandBytes {
                command: Command::StreamData,
                received: frame[1..4].to_vec(),
            });
        }

        let status = StreamStatus::from_primitive(header.status);
        if let StreamStatus::Error(code) = status {
            return Err(StreamError::DeviceError {
                command: Command::StreamData,
                code,
            });
        }

        if header.packet_number != self.expected_packet {
            return Err(StreamError::SequenceMismatch {
                expected: self.expected_packet,
                received: header.packet_number,
            });
        }

        let mut dropped_scans = None;
        match status {
            StreamStatus::AutoRecoverActive => {
                if !self.auto_recovery {
                    warn!(
                        packet = header.packet_number,
                        "Device buffer overflow, reading buffered samples in auto-recovery"
                    );
                    self.auto_recovery = true;
                    self.stats.auto_recovery_events += 1;
                }
            }
            StreamStatus::AutoRecoverEnd => {
                let dropped = header.dropped_scans.get();
                warn!(
                    packet = header.packet_number,
                    dropped, "Auto-recovery report, auto-recovery is now off"
                );
                self.auto_recovery = false;
                self.stats.last_dropped_scans = dropped;
                self.stats.total_dropped_scans += dropped as u64;
                dropped_scans = Some(dropped);
            }
            StreamStatus::Normal | StreamStatus::Error(_) => {}
        }

        let num_channels = self.channels.len();
        let samples = &frame[HEADER_SIZE..HEADER_SIZE + 2 * self.samples_per_packet];
        for (i, bytes) in samples.chunks_exact(2).enumerate() {
            let raw = u16::from_le_bytes([bytes[0], bytes[1]]);
            self.voltages[i] = self.calibration.to_volts(&self.channels[i % num_channels], raw);
        }

        let backlog = frame[HEADER_SIZE + 2 * self.samples_per_packet];
        self.expected_packet = self.expected_packet.wrapping_add(1);

        let scans = (self.samples_per_packet / num_channels) as u64;
        self.stats.packets_decoded += 1;
        self.stats.scans_decoded += scans;
        self.stats.backlog = backlog;
        self.stats.expected_packet_number = self.expected_packet;
        self.stats.auto_recovery_active = self.auto_recovery;
        trace!(packet = header.packet_number, backlog, "Decoded stream packet");

        let meta = PacketMeta {
            packet_number: header.packet_number,
            status,
            backlog,
            dropped_scans,
        };
        self.last = Some(meta);
        Ok(self.view(meta))
    }
}

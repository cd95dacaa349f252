//! Scripted transport and frame builders shared by the integration tests.

// Not every test file uses every helper
#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use hex;
#[allow(unused_imports)]
pub use u3stream::calibration::CalibrationInfo;
#[allow(unused_imports)]
pub use u3stream::config::{ChannelPair, StreamConfig};
#[allow(unused_imports)]
pub use u3stream::controller::{StreamController, StreamState};
#[allow(unused_imports)]
pub use u3stream::error::{ErrorKind, StreamError};
#[allow(unused_imports)]
pub use u3stream::transport::Transport;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use u3stream::checksum::{apply_checksum8, apply_extended_checksum};

#[allow(dead_code)]
pub const STREAM_START_ACK: u8 = 0xA9;
#[allow(dead_code)]
pub const STREAM_STOP_ACK: u8 = 0xB1;

/// Everything the mock has been told and has left to say.
#[derive(Debug, Default)]
pub struct MockState {
    pub writes: Vec<Bytes>,
    pub responses: VecDeque<Bytes>,
    pub stream: VecDeque<Bytes>,
    pub stream_reads: usize,
}

/// A [`Transport`] replaying scripted responses. Clones share state, so a test
/// can keep one handle after moving the other into a controller.
///
/// An exhausted script behaves like a timed-out transfer: zero bytes.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    pub state: Arc<Mutex<MockState>>,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, frame: Bytes) -> &Self {
        self.state.lock().responses.push_back(frame);
        self
    }

    pub fn stream(&self, frame: Bytes) -> &Self {
        self.state.lock().stream.push_back(frame);
        self
    }

    /// Responses for StreamStop, ConfigIO and StreamConfig.
    pub fn script_initialize(&self) -> &Self {
        self.respond(stream_ack(STREAM_STOP_ACK, 0))
            .respond(config_io_response(false))
            .respond(stream_config_response(0))
    }

    /// [`Self::script_initialize`] followed by a StreamStart acknowledgement.
    pub fn script_startup(&self) -> &Self {
        self.script_initialize().respond(stream_ack(STREAM_START_ACK, 0))
    }

    pub fn writes(&self) -> Vec<Bytes> {
        self.state.lock().writes.clone()
    }

    /// Command byte of every write (byte 3 for extended frames, byte 1 otherwise).
    pub fn commands(&self) -> Vec<u8> {
        self.writes()
            .iter()
            .map(|w| if w[1] == 0xF8 { w[3] } else { w[1] })
            .collect()
    }

    pub fn pending_responses(&self) -> usize {
        self.state.lock().responses.len()
    }

    pub fn pending_stream(&self) -> usize {
        self.state.lock().stream.len()
    }
}

impl Transport for MockTransport {
    fn write(&mut self, data: &[u8]) -> u3stream::error::Result<usize> {
        self.state.lock().writes.push(Bytes::copy_from_slice(data));
        Ok(data.len())
    }

    fn read(&mut self, _max_len: usize) -> u3stream::error::Result<Bytes> {
        Ok(self.state.lock().responses.pop_front().unwrap_or_default())
    }

    fn stream_read(&mut self, _expected_len: usize) -> u3stream::error::Result<Bytes> {
        let next = {
            let mut state = self.state.lock();
            state.stream_reads += 1;
            state.stream.pop_front()
        };
        if next.is_none() {
            // stand-in for the transfer timeout
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(next.unwrap_or_default())
    }
}

/// Nominal constants with a 1 mV/code single-ended slope and no offset.
#[allow(dead_code)]
pub fn millivolt_calibration() -> CalibrationInfo {
    let mut info = CalibrationInfo::nominal();
    info.constants[0] = 0.001;
    info.constants[1] = 0.0;
    info
}

#[allow(dead_code)]
pub fn hex_to_bytes(hex_data: &str) -> Bytes {
    Bytes::from(hex::decode(hex_data).expect("Failed to decode hex"))
}

#[allow(dead_code)]
pub fn extended(mut frame: Vec<u8>) -> Bytes {
    apply_extended_checksum(&mut frame);
    Bytes::from(frame)
}

#[allow(dead_code)]
pub fn stream_ack(ack: u8, errorcode: u8) -> Bytes {
    let mut frame = vec![0, ack, errorcode, 0];
    apply_checksum8(&mut frame);
    Bytes::from(frame)
}

#[allow(dead_code)]
pub fn config_io_response(dac1_enabled: bool) -> Bytes {
    extended(vec![0, 0xF8, 0x03, 0x0B, 0, 0, 0, 0, 64, dac1_enabled as u8, 255, 255])
}

#[allow(dead_code)]
pub fn stream_config_response(errorcode: u8) -> Bytes {
    extended(vec![0, 0xF8, 0x01, 0x11, 0, 0, errorcode, 0])
}

/// ConfigU3 response for hardware `major.minor`.
#[allow(dead_code)]
pub fn device_info_response(major: u8, minor: u8, serial: u32, high_voltage: bool) -> Bytes {
    let mut frame = vec![0u8; 38];
    frame[1..4].copy_from_slice(&[0xF8, 0x10, 0x08]);
    frame[9] = 26; // firmware 1.26
    frame[10] = 1;
    frame[13] = minor;
    frame[14] = major;
    frame[15..19].copy_from_slice(&serial.to_le_bytes());
    frame[19..21].copy_from_slice(&3u16.to_le_bytes());
    frame[37] = if high_voltage { 18 } else { 0 };
    extended(frame)
}

/// ReadMem response holding four 32.32 fixed-point constants.
#[allow(dead_code)]
pub fn calibration_block_response(values: [f64; 4]) -> Bytes {
    let mut frame = vec![0, 0xF8, 0x11, 0x2D, 0, 0, 0, 0];
    for value in values {
        let fixed = (value * 4_294_967_296.0) as i64;
        frame.extend_from_slice(&fixed.to_le_bytes());
    }
    extended(frame)
}

/// StreamData packet carrying `samples` (length = samples per packet).
#[allow(dead_code)]
pub fn stream_packet(packet_number: u8, status: u8, dropped_scans: u16, samples: &[u16], backlog: u8) -> Bytes {
    let mut frame = vec![0, 0xF9, 4 + samples.len() as u8, 0xC0, 0, 0];
    frame.extend_from_slice(&dropped_scans.to_le_bytes());
    frame.extend_from_slice(&[0, 0, packet_number, status]);
    for sample in samples {
        frame.extend_from_slice(&sample.to_le_bytes());
    }
    frame.push(backlog);
    frame.push(0);
    extended(frame)
}

#[allow(dead_code)]
pub fn normal_packet(packet_number: u8, samples: &[u16]) -> Bytes {
    stream_packet(packet_number, 0, 0, samples, 0)
}

/// A controller over a fresh mock, with millivolt calibration.
#[allow(dead_code)]
pub fn controller(config: StreamConfig) -> (StreamController<MockTransport>, MockTransport) {
    let mock = MockTransport::new();
    let controller =
        StreamController::new(mock.clone(), config, millivolt_calibration()).expect("valid test configuration");
    (controller, mock)
}

/// A controller already in `Running`.
#[allow(dead_code)]
pub fn running_controller(config: StreamConfig) -> (StreamController<MockTransport>, MockTransport) {
    let (mut controller, mock) = controller(config);
    mock.script_startup();
    controller.initialize().expect("initialize");
    controller.start().expect("start");
    (controller, mock)
}

pub mod calibration;
pub mod checksum;
pub mod config;
pub mod controller;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod ft;
pub mod handoff;
pub mod transport;
pub mod worker;

pub use calibration::{CalibrationInfo, VoltageCalibration, read_calibration};
pub use config::{ChannelPair, DeviceConfig, Resolution, ScanConfig, StreamConfig};
pub use controller::{StreamController, StreamState};
pub use decoder::{DecodedPacket, StreamDecoder, StreamStats, StreamStatus};
pub use error::{ErrorKind, StreamError};
pub use handoff::{JsonLinesSink, SampleHandoff, TelemetrySink, VoltageSnapshot};
pub use transport::{NusbTransport, Transport};
pub use worker::{RestartPolicy, StreamWorker, WorkerReport};

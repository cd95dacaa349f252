//! Stream lifecycle: `Idle -> Configured -> Running -> Idle`, plus `Failed`.

use crate::calibration::{CalibrationInfo, VoltageCalibration, read_calibration};
use crate::config::StreamConfig;
use crate::decoder::{DecodedPacket, StreamDecoder, StreamStats};
use crate::error::{ErrorKind, Result, StreamError};
use crate::frame::{ConfigIo, ConfigureStream, DeviceInfo, IoConfig, StartStream, StopStream};
use crate::handoff::SampleHandoff;
use crate::transport::{Transport, transact};
use serde::Serialize;
use strum_macros::Display;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
pub enum StreamState {
    Idle,
    Configured,
    Running,
    /// Left only through [`StreamController::initialize`] or [`StreamController::reinitialize`].
    Failed,
}

/// Why the controller entered `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    /// Lifecycle step that failed, e.g. "ConfigIO".
    pub step: &'static str,
    pub kind: ErrorKind,
    pub message: String,
}

/// Owns the device handle and drives one stream through its lifecycle.
///
/// Every decoded scan is published to the [`SampleHandoff`]. The handle is
/// released exactly once, when the controller is dropped; a running stream is
/// stopped first.
pub struct StreamController<T: Transport> {
    transport: T,
    config: StreamConfig,
    calibration: CalibrationInfo,
    device: Option<DeviceInfo>,
    io: Option<IoConfig>,
    decoder: StreamDecoder,
    handoff: SampleHandoff,
    state: StreamState,
    failure: Option<Failure>,
}

impl<T: Transport> StreamController<T> {
    /// Uses calibration constants obtained elsewhere, e.g. [`CalibrationInfo::nominal`].
    pub fn new(transport: T, config: StreamConfig, calibration: CalibrationInfo) -> Result<Self> {
        // DAC1 state is only known after ConfigIO; configure() swaps in the final formulas.
        let decoder = StreamDecoder::new(&config, VoltageCalibration::new(&calibration, false))?;
        Ok(Self {
            transport,
            config,
            calibration,
            device: None,
            io: None,
            decoder,
            handoff: SampleHandoff::new(),
            state: StreamState::Idle,
            failure: None,
        })
    }

    /// Reads identity and calibration from the device before building the controller.
    pub fn connect(mut transport: T, config: StreamConfig) -> Result<Self> {
        config.validate()?;
        let (device, calibration) = read_calibration(&mut transport)?;
        let mut controller = Self::new(transport, config, calibration)?;
        controller.device = Some(device);
        Ok(controller)
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn calibration(&self) -> &CalibrationInfo {
        &self.calibration
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device.as_ref()
    }

    /// What the last successful ConfigIO read back.
    pub fn io_config(&self) -> Option<&IoConfig> {
        self.io.as_ref()
    }

    pub fn stats(&self) -> StreamStats {
        self.decoder.stats()
    }

    /// A reader handle on the latest scan.
    pub fn handoff(&self) -> SampleHandoff {
        self.handoff.clone()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn require(&self, operation: &'static str, allowed: &[StreamState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(StreamError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn fail(&mut self, step: &'static str, err: StreamError) -> StreamError {
        error!(step, kind = %err.kind(), "Stream failed: {}", err);
        self.state = StreamState::Failed;
        self.failure = Some(Failure {
            step,
            kind: err.kind(),
            message: err.to_string(),
        });
        err
    }

    /// Sends StreamStop and only logs a failure.
    fn stop_best_effort(&mut self) -> bool {
        match transact(&mut self.transport, &StopStream) {
            Ok(()) => {
                debug!("Stream stopped on device");
                true
            }
            Err(e) => {
                warn!("StreamStop failed: {}", e);
                false
            }
        }
    }

    /// Stops whatever stream the device may still be running, then configures.
    ///
    /// Valid from `Idle` and `Failed`.
    pub fn initialize(&mut self) -> Result<()> {
        self.require("initialize", &[StreamState::Idle, StreamState::Failed])?;
        self.stop_best_effort();
        self.state = StreamState::Idle;
        self.failure = None;
        self.configure()
    }

    /// ConfigIO then StreamConfig.
    pub fn configure(&mut self) -> Result<()> {
        self.require("configure", &[StreamState::Idle])?;

        let io = transact(&mut self.transport, &ConfigIo).map_err(|e| self.fail("ConfigIO", e))?;
        debug!(dac1 = io.dac1_enabled, fio = io.fio_analog, eio = io.eio_analog, "ConfigIO done");
        let calibration = VoltageCalibration::new(&self.calibration, io.dac1_enabled);
        info!(scale = %calibration.scale(), "Voltage calibration selected");
        self.decoder.set_calibration(calibration);
        self.io = Some(io);

        let configured = transact(&mut self.transport, &ConfigureStream { config: &self.config });
        configured.map_err(|e| self.fail("StreamConfig", e))?;

        info!(
            channels = self.config.num_channels(),
            samples_per_packet = self.config.samples_per_packet,
            scan_rate_hz = self.config.scan_rate_hz(),
            "Stream configured"
        );
        self.state = StreamState::Configured;
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        self.require("start", &[StreamState::Configured])?;
        transact(&mut self.transport, &StartStream).map_err(|e| self.fail("StreamStart", e))?;
        self.decoder.reset();
        self.state = StreamState::Running;
        info!("Stream started");
        Ok(())
    }

    /// Reads and decodes one packet, publishing each of its scans.
    ///
    /// Transport and checksum failures leave the stream running. Any other
    /// failure stops the device stream and moves to `Failed`.
    pub fn read(&mut self) -> Result<DecodedPacket<'_>> {
        self.require("read", &[StreamState::Running])?;

        let outcome = self.decoder.read_packet(&mut self.transport).map(|_| ());
        if let Err(e) = outcome {
            if e.is_recoverable() {
                debug!("Stream read failed: {}", e);
                return Err(e);
            }
            let err = self.fail("StreamData", e);
            self.stop_best_effort();
            return Err(err);
        }

        let Some(packet) = self.decoder.last_packet() else {
            return Err(StreamError::InvalidState {
                operation: "read",
                state: self.state,
            });
        };
        for scan in packet.scans() {
            self.handoff.publish(scan);
        }
        Ok(packet)
    }

    /// Stops the device stream. Never fails; a StreamStop error is only logged.
    ///
    /// `Failed` stays `Failed`.
    pub fn stop(&mut self) {
        match self.state {
            StreamState::Idle => {}
            StreamState::Configured | StreamState::Running => {
                self.stop_best_effort();
                self.state = StreamState::Idle;
                info!("Stream idle");
            }
            StreamState::Failed => {
                self.stop_best_effort();
            }
        }
    }

    /// Stop, configure and start, from any state.
    pub fn reinitialize(&mut self) -> Result<()> {
        info!(from = %self.state, "Reinitializing stream");
        if matches!(self.state, StreamState::Configured | StreamState::Running) {
            // initialize() issues the StreamStop
            self.state = StreamState::Idle;
        }
        self.initialize()?;
        self.start()
    }

    /// Replaces the stream layout. Not allowed while running.
    pub fn reconfigure(&mut self, config: StreamConfig) -> Result<()> {
        self.require(
            "reconfigure",
            &[StreamState::Idle, StreamState::Configured, StreamState::Failed],
        )?;
        let calibration = VoltageCalibration::new(&self.calibration, self.io.is_some_and(|io| io.dac1_enabled));
        self.decoder = StreamDecoder::new(&config, calibration)?;
        self.config = config;
        if self.state == StreamState::Configured {
            self.state = StreamState::Idle;
        }
        Ok(())
    }

    /// Stops a running stream and releases the device.
    pub fn shutdown(mut self) {
        self.stop();
    }
}

impl<T: Transport> Drop for StreamController<T> {
    fn drop(&mut self) {
        if self.state == StreamState::Running {
            self.stop_best_effort();
        }
    }
}

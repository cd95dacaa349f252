use crate::controller::StreamState;
use crate::frame::Command;
use nusb::transfer::TransferError;
use serde::Serialize;
use strum_macros::Display;
use thiserror::Error;

/// Coarse classification used to decide how a failure is handled.
///
/// Transport and framing failures are scoped to a single call and leave the
/// device handle usable. Protocol and desynchronization failures put the
/// controller into `Failed` and need an explicit reinitialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
pub enum ErrorKind {
    Transport,
    Framing,
    Protocol,
    Desync,
    Usage,
}

/// The primary error type for the `u3stream` library.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("USB device not found. Is the LabJack U3 connected?")]
    DeviceNotFound,

    #[error("USB error: {0}")]
    Usb(#[from] nusb::Error),

    #[error("USB transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Timeout during USB operation: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("{command}: short write, sent {actual} of {expected} bytes")]
    ShortWrite {
        command: Command,
        expected: usize,
        actual: usize,
    },

    #[error("{command}: short read, received {actual} of {expected} bytes")]
    ShortRead {
        command: Command,
        expected: usize,
        actual: usize,
    },

    #[error("{command}: bad checksum16, computed {computed:#06x}, frame carries {received:#06x}")]
    Checksum16 {
        command: Command,
        computed: u16,
        received: u16,
    },

    #[error("{command}: bad checksum8, computed {computed:#04x}, frame carries {received:#04x}")]
    Checksum8 {
        command: Command,
        computed: u8,
        received: u8,
    },

    #[error("{command}: wrong command bytes {received:02x?}")]
    WrongCommandBytes { command: Command, received: Vec<u8> },

    #[error("{command}: device returned errorcode {code}")]
    DeviceError { command: Command, code: u8 },

    #[error("{command}: {field} did not get set correctly (read back {actual:#04x})")]
    ConfigMismatch {
        command: Command,
        field: &'static str,
        actual: u8,
    },

    #[error("Packet counter mismatch: expected {expected}, device sent {received}")]
    SequenceMismatch { expected: u8, received: u8 },

    #[error("Invalid stream configuration: {0}")]
    InvalidConfig(String),

    #[error("Cannot {operation} while stream is {state}")]
    InvalidState {
        operation: &'static str,
        state: StreamState,
    },

    #[error("Failed to spawn stream thread: {0}")]
    Spawn(std::io::Error),

    #[error("Failed to start USB transfer runtime: {0}")]
    Runtime(std::io::Error),
}

impl StreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StreamError::DeviceNotFound
            | StreamError::Usb(_)
            | StreamError::Transfer(_)
            | StreamError::Timeout(_)
            | StreamError::ShortWrite { .. }
            | StreamError::ShortRead { .. } => ErrorKind::Transport,
            StreamError::Checksum16 { .. } | StreamError::Checksum8 { .. } => ErrorKind::Framing,
            StreamError::WrongCommandBytes { .. }
            | StreamError::DeviceError { .. }
            | StreamError::ConfigMismatch { .. } => ErrorKind::Protocol,
            StreamError::SequenceMismatch { .. } => ErrorKind::Desync,
            StreamError::InvalidConfig(_)
            | StreamError::InvalidState { .. }
            | StreamError::Spawn(_)
            | StreamError::Runtime(_) => ErrorKind::Usage,
        }
    }

    /// Whether the failure is scoped to one call and the stream can keep going.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Framing)
    }
}

pub type Result<T, E = StreamError> = std::result::Result<T, E>;

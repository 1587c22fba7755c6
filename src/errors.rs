use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("serial port not found: {0}")]
    PortNotFound(String),
    #[error("timeout waiting for response: got {received} of {expected} bytes")]
    Timeout { expected: usize, received: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("checksum mismatch: expected {expected:#04X}, received {received:#04X}")]
    ChecksumMismatch { expected: u8, received: u8 },
    #[error("device still busy after {attempts} attempts")]
    DeviceBusy { attempts: u32 },
    #[error("unexpected status byte {0:#04X}")]
    UnexpectedStatus(u8),
    #[error("response too short: expected {expected} bytes, got {actual}")]
    ShortResponse { expected: usize, actual: usize },
    #[error("invalid device timestamp {0:02X?}")]
    InvalidTimestamp([u8; 6]),
    #[error("unsupported baud rate {0}")]
    UnsupportedBaudRate(u32),
}

impl DriverError {
    /// True when the error came from a read that never completed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DriverError::Transport(TransportError::Timeout { .. }))
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

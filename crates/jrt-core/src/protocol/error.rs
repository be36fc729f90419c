//! Protocol errors

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during sensor communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("Not connected to sensor")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("No device selected, call connect() first")]
    NoDeviceSelected,

    #[error("Stream closed by device")]
    StreamClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Reasons a received frame could not be classified
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("frame too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },

    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("unknown header {0}")]
    UnknownHeader(String),

    #[error("unknown register {0}")]
    UnknownRegister(String),
}

//! Error types for the PCM relay

use thiserror::Error;

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio device boundary errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Stream transport errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Peer idle for {0} consecutive read timeouts")]
    Timeout(u32),

    #[error("Connection closed")]
    Closed,
}

/// Wire format errors
#[derive(Error, Debug, PartialEq)]
pub enum ProtocolError {
    #[error("Audio format descriptor must be {expected} bytes, got {actual}")]
    InvalidFormatLength { expected: usize, actual: usize },

    #[error("Invalid audio format: {0}")]
    InvalidFormat(String),

    #[error("Bad frame signature: {0:02x?}")]
    BadMagic([u8; 2]),

    #[error("Unknown packet tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

impl From<cpal::BuildStreamError> for AudioError {
    fn from(e: cpal::BuildStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

impl From<cpal::PlayStreamError> for AudioError {
    fn from(e: cpal::PlayStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for AudioError {
    fn from(e: cpal::DefaultStreamConfigError) -> Self {
        AudioError::CpalError(e.to_string())
    }
}

/// Result type alias for the relay
pub type Result<T> = std::result::Result<T, Error>;

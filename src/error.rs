//! Error types for mqpeek.

use std::io;

use thiserror::Error;

/// Main error type for mqpeek.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// MQTT protocol errors.
///
/// These cover malformed frames only. An incomplete frame is not an error:
/// the codec reports it as `Ok(None)` so the session buffer can wait for
/// more bytes.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid remaining length encoding")]
    InvalidRemainingLength,

    #[error("Remaining length {0} exceeds maximum encodable value")]
    RemainingLengthTooLarge(usize),

    #[error("Truncated packet body: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
}

pub type Result<T> = std::result::Result<T, Error>;

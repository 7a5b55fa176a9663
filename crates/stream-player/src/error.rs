//! Error taxonomy for the streaming pipeline.
//!
//! Transient conditions (decoder needs more input, empty ring, no processed device buffers)
//! are not errors; they show up as no-op ticks. Everything here ends the session.

use thiserror::Error;

use crate::format::SampleEncoding;

#[derive(Error, Debug)]
pub enum PlayerError {
    /// Channel count or sample encoding outside mono/stereo x 8/16-bit.
    #[error("unsupported stream format: {channels} channel(s), {encoding}")]
    FormatUnsupported {
        channels: u16,
        encoding: SampleEncoding,
    },

    /// Malformed bitstream or decoder failure.
    #[error("decode error: {0}")]
    Decode(String),

    /// Buffer submission or device query failure.
    #[error("audio device error: {0}")]
    Device(String),

    /// Rejected tuning parameters.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PlayerError {
    pub(crate) fn device(err: impl std::fmt::Display) -> Self {
        Self::Device(err.to_string())
    }

    pub(crate) fn decode(err: impl std::fmt::Display) -> Self {
        Self::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;

//! Stream format description and the one-shot negotiation onto a device format.

use std::fmt;

use crate::error::{PlayerError, Result};

/// PCM sample encoding reported by a decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleEncoding {
    Unsigned8,
    Signed16,
    Signed24,
    Signed32,
    Float32,
}

impl SampleEncoding {
    pub fn bits(self) -> u16 {
        match self {
            Self::Unsigned8 => 8,
            Self::Signed16 => 16,
            Self::Signed24 => 24,
            Self::Signed32 | Self::Float32 => 32,
        }
    }
}

impl fmt::Display for SampleEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unsigned8 => "u8",
            Self::Signed16 => "s16",
            Self::Signed24 => "s24",
            Self::Signed32 => "s32",
            Self::Float32 => "f32",
        };
        f.write_str(label)
    }
}

/// Sample rate, channel count, and encoding of a decoded stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamFormat {
    pub rate: u32,
    pub channels: u16,
    pub encoding: SampleEncoding,
}

impl StreamFormat {
    pub fn new(rate: u32, channels: u16, encoding: SampleEncoding) -> Self {
        Self {
            rate,
            channels,
            encoding,
        }
    }
}

/// The four device formats the pipeline can drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Mono8,
    Mono16,
    Stereo8,
    Stereo16,
}

impl OutputFormat {
    pub fn channels(self) -> u16 {
        match self {
            Self::Mono8 | Self::Mono16 => 1,
            Self::Stereo8 | Self::Stereo16 => 2,
        }
    }

    pub fn encoding(self) -> SampleEncoding {
        match self {
            Self::Mono8 | Self::Stereo8 => SampleEncoding::Unsigned8,
            Self::Mono16 | Self::Stereo16 => SampleEncoding::Signed16,
        }
    }

    pub fn bytes_per_sample(self) -> usize {
        match self.encoding() {
            SampleEncoding::Unsigned8 => 1,
            _ => 2,
        }
    }

    pub fn bytes_per_frame(self) -> usize {
        self.bytes_per_sample() * self.channels() as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Mono8 => "mono8",
            Self::Mono16 => "mono16",
            Self::Stereo8 => "stereo8",
            Self::Stereo16 => "stereo16",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Map a decoder-reported format onto one of the supported device formats.
///
/// Only mono/stereo with 8- or 16-bit samples are accepted; anything else is fatal.
pub fn negotiate(format: StreamFormat) -> Result<OutputFormat> {
    let unsupported = || PlayerError::FormatUnsupported {
        channels: format.channels,
        encoding: format.encoding,
    };
    match (format.channels, format.encoding) {
        (1, SampleEncoding::Unsigned8) => Ok(OutputFormat::Mono8),
        (1, SampleEncoding::Signed16) => Ok(OutputFormat::Mono16),
        (2, SampleEncoding::Unsigned8) => Ok(OutputFormat::Stereo8),
        (2, SampleEncoding::Signed16) => Ok(OutputFormat::Stereo16),
        _ => Err(unsupported()),
    }
}

/// Bytes per device buffer for `seconds` of audio, rounded up to whole frames.
///
/// Non-finite or non-positive durations fall back to a quarter second.
pub fn block_bytes(format: OutputFormat, rate: u32, seconds: f32) -> usize {
    let secs = if seconds.is_finite() && seconds > 0.0 {
        seconds
    } else {
        0.25
    };
    let frames = ((rate as f64 * secs as f64).ceil() as usize).max(1);
    frames.saturating_mul(format.bytes_per_frame())
}

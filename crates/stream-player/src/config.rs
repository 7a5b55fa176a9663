use std::time::Duration;

use crate::error::{PlayerError, Result};

/// Pipeline tuning parameters shared by the ring, flow control, decode, and output stages.
#[derive(Clone, Debug)]
pub struct PlaybackConfig {
    /// Compressed-byte ring capacity. Sized for network jitter, not for block sizes.
    pub ring_capacity: usize,
    /// Undrained producer bytes (`received - consumed`) above which the producer is paused.
    pub max_gap: u64,
    /// Number of device buffers primed before playback starts.
    pub device_buffers: usize,
    /// Audio duration carried by each device buffer.
    pub buffer_seconds: f32,
    /// Max compressed bytes moved from the ring to the decoder per feed.
    pub feed_chunk: usize,
    /// Pause between ticks when a tick found no work.
    pub tick_interval: Duration,
    /// Rate converter input chunk size in frames.
    pub chunk_frames: usize,
    /// Compressed bytes the decoder keeps buffered ahead of its read position while the
    /// stream is still arriving.
    pub decode_lookahead: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 5 * 1024 * 1024,
            max_gap: 1_000_000,
            device_buffers: 5,
            buffer_seconds: 0.25,
            feed_chunk: 16 * 1024,
            tick_interval: Duration::from_millis(50),
            chunk_frames: 1024,
            decode_lookahead: 64 * 1024,
        }
    }
}

impl PlaybackConfig {
    /// Reject combinations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.ring_capacity == 0 {
            return Err(PlayerError::Config("ring capacity must be non-zero".into()));
        }
        if self.feed_chunk == 0 {
            return Err(PlayerError::Config("feed chunk must be non-zero".into()));
        }
        if self.tick_interval.is_zero() {
            return Err(PlayerError::Config("tick interval must be non-zero".into()));
        }
        if self.device_buffers < 2 {
            return Err(PlayerError::Config(format!(
                "at least 2 device buffers are required (got {})",
                self.device_buffers
            )));
        }
        if self.max_gap >= self.ring_capacity as u64 {
            return Err(PlayerError::Config(format!(
                "max gap ({}) must be below ring capacity ({})",
                self.max_gap, self.ring_capacity
            )));
        }
        Ok(())
    }
}

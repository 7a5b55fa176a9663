use serde::{Deserialize, Serialize};

/// Reason why a streaming playback session ended.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEndReason {
    /// The producer completed and the device queue ran dry.
    Eof,
    /// The user quit, or the transfer was aborted before the stream ended.
    Aborted,
    /// Format, decoder, or device failure interrupted playback.
    Error,
}

/// Pipeline state as reported in status snapshots.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    AwaitingFormat,
    PrimingOutput,
    Playing,
    Paused,
    Finished,
}

/// Point-in-time view of a streaming session.
///
/// Byte counters describe the compressed side (network to ring to decoder); buffer counters
/// describe the PCM side (device queue).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionStatus {
    /// Source URL or path.
    pub source: Option<String>,
    /// Current pipeline state.
    pub phase: SessionPhase,
    /// Negotiated sample rate (Hz).
    pub sample_rate: Option<u32>,
    /// Negotiated channel count.
    pub channels: Option<u16>,
    /// Negotiated device format label, e.g. `stereo16`.
    pub output_format: Option<String>,
    /// Bytes per device buffer.
    pub block_bytes: Option<usize>,
    /// Device buffers currently queued.
    pub queued_buffers: Option<usize>,
    /// Total compressed bytes accepted into the ring.
    pub bytes_received: u64,
    /// Total compressed bytes handed to the decoder.
    pub bytes_consumed: u64,
    /// `true` while the flow controller holds the producer paused.
    pub producer_paused: bool,
    /// Times the device stopped on an empty queue and was restarted.
    pub underrun_restarts: u64,
    /// Device buffers submitted since the session started.
    pub buffers_submitted: u64,
    /// Terminal reason once the session has finished.
    pub end_reason: Option<PlaybackEndReason>,
    /// Error text when `end_reason` is `Error`.
    pub error: Option<String>,
}

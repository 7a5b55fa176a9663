use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use stream_player_types::{PlaybackEndReason, SessionPhase, SessionStatus};

use crate::format::OutputFormat;
use crate::ring::ByteCounters;

/// Shared status updated by the session and pipeline drivers.
#[derive(Debug, Default)]
pub struct PlayerStatusState {
    /// Source URL or path being played.
    pub source: Option<String>,
    pub phase: SessionPhase,
    /// Negotiated stream rate in Hz.
    pub sample_rate: Option<u32>,
    pub output_format: Option<OutputFormat>,
    /// Bytes per device buffer.
    pub block_bytes: Option<usize>,
    pub queued_buffers: Option<usize>,
    pub counters: ByteCounters,
    pub producer_paused: bool,
    pub underrun_restarts: u64,
    pub buffers_submitted: u64,
    pub end_reason: Option<PlaybackEndReason>,
    pub error: Option<String>,
}

/// Status handle shared between threads.
pub type SharedStatus = Arc<Mutex<PlayerStatusState>>;

impl PlayerStatusState {
    /// Create a shared, mutex-protected status store.
    pub fn shared() -> SharedStatus {
        Arc::new(Mutex::new(Self::default()))
    }

    /// Lock a shared store, recovering from a poisoned lock.
    pub fn lock(status: &SharedStatus) -> MutexGuard<'_, Self> {
        status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> SessionStatus {
        SessionStatus {
            source: self.source.clone(),
            phase: self.phase,
            sample_rate: self.sample_rate,
            channels: self.output_format.map(|f| f.channels()),
            output_format: self.output_format.map(|f| f.label().to_string()),
            block_bytes: self.block_bytes,
            queued_buffers: self.queued_buffers,
            bytes_received: self.counters.received,
            bytes_consumed: self.counters.consumed,
            producer_paused: self.producer_paused,
            underrun_restarts: self.underrun_restarts,
            buffers_submitted: self.buffers_submitted,
            end_reason: self.end_reason,
            error: self.error.clone(),
        }
    }

    /// Record how the session ended. The first recorded reason wins.
    pub fn record_end(&mut self, reason: PlaybackEndReason, error: Option<String>) {
        self.phase = SessionPhase::Finished;
        if self.end_reason.is_none() {
            self.end_reason = Some(reason);
            self.error = error;
        }
    }
}

//! Playback session state machine.
//!
//! One [`PlaybackSession::tick`] performs at most one decode-and-submit unit of work:
//!
//! ```text
//! AwaitingFormat -> PrimingOutput -> Playing <-> Paused -> Finished
//! ```
//!
//! - `AwaitingFormat`: decode until the decoder reports a format, negotiate it, configure the
//!   device, size the output block.
//! - `PrimingOutput`: fill one device buffer per tick; start playback once all are queued.
//! - `Playing`: when the device finished a buffer, reclaim it, refill it and queue it again;
//!   restart the device after an underrun; finish once input, decoder and queue are exhausted.
//! - `Paused`: device paused, no output work.
//!
//! A unit of work is one device buffer: the decoder is read repeatedly until the block is full.
//! Compressed bytes are pulled from the ring one feed chunk at a time, and only when the decoder
//! asks for more, so they stay visible to the flow controller until the decoder needs them.

use stream_player_types::{PlaybackEndReason, SessionPhase};

use crate::config::PlaybackConfig;
use crate::decode::{Decoder, ReadStatus};
use crate::device::{AudioDevice, DeviceState};
use crate::error::{PlayerError, Result};
use crate::format::{self, OutputFormat, StreamFormat};
use crate::output::OutputQueue;
use crate::ring::SharedRing;
use crate::status::{PlayerStatusState, SharedStatus};

/// Scratch size for decoder reads before the output block is sized.
const SCRATCH_BYTES: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    AwaitingFormat,
    PrimingOutput,
    Playing,
    Paused,
    Finished(PlaybackEndReason),
}

impl SessionState {
    pub fn phase(self) -> SessionPhase {
        match self {
            Self::AwaitingFormat => SessionPhase::AwaitingFormat,
            Self::PrimingOutput => SessionPhase::PrimingOutput,
            Self::Playing => SessionPhase::Playing,
            Self::Paused => SessionPhase::Paused,
            Self::Finished(_) => SessionPhase::Finished,
        }
    }
}

/// Interactive commands, polled once per tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserCommand {
    TogglePause,
    Quit,
    Rewind,
}

/// Non-blocking source of user commands.
pub trait CommandSource {
    fn poll(&mut self) -> Option<UserCommand>;
}

impl<F> CommandSource for F
where
    F: FnMut() -> Option<UserCommand>,
{
    fn poll(&mut self) -> Option<UserCommand> {
        self()
    }
}

/// Result of one tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to do; the driver may sleep before the next tick.
    Idle,
    Progressed,
    Finished(PlaybackEndReason),
}

/// Format fixed at negotiation time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Negotiated {
    /// Stream format the decoder is locked to.
    pub stream: StreamFormat,
    pub output: OutputFormat,
    pub block_bytes: usize,
}

enum DecodeStep {
    Produced(usize),
    Starved,
    NewFormat,
    Ended,
}

pub struct PlaybackSession<D: Decoder, A: AudioDevice> {
    config: PlaybackConfig,
    decoder: D,
    device: A,
    state: SessionState,
    negotiated: Option<Negotiated>,
    output: Option<OutputQueue>,
    feed_buf: Vec<u8>,
    scratch: Vec<u8>,
    /// The decoder was told no more input follows.
    input_ended: bool,
    /// The decoder reported [`ReadStatus::Done`].
    decoder_done: bool,
    device_flushed: bool,
    underrun_restarts: u64,
    status: Option<SharedStatus>,
}

impl<D: Decoder, A: AudioDevice> PlaybackSession<D, A> {
    /// Validate `config` and open `device`. Both collaborators stay owned by the session.
    pub fn new(config: PlaybackConfig, decoder: D, mut device: A) -> Result<Self> {
        config.validate()?;
        device.open()?;
        Ok(Self {
            feed_buf: vec![0; config.feed_chunk],
            scratch: vec![0; SCRATCH_BYTES],
            config,
            decoder,
            device,
            state: SessionState::AwaitingFormat,
            negotiated: None,
            output: None,
            input_ended: false,
            decoder_done: false,
            device_flushed: false,
            underrun_restarts: 0,
            status: None,
        })
    }

    /// Publish progress into `status` after every tick.
    pub fn with_status(mut self, status: SharedStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, SessionState::Finished(_))
    }

    pub fn negotiated(&self) -> Option<Negotiated> {
        self.negotiated
    }

    pub fn underrun_restarts(&self) -> u64 {
        self.underrun_restarts
    }

    pub fn device(&self) -> &A {
        &self.device
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    #[cfg(test)]
    pub(crate) fn device_mut(&mut self) -> &mut A {
        &mut self.device
    }

    /// Run one unit of work, applying `command` first.
    ///
    /// Any error is fatal: the session moves to `Finished(Error)`, the device is stopped, and
    /// the error is returned.
    pub fn tick(&mut self, ring: &SharedRing, command: Option<UserCommand>) -> Result<TickOutcome> {
        if let SessionState::Finished(reason) = self.state {
            return Ok(TickOutcome::Finished(reason));
        }
        match self.step(ring, command) {
            Ok(outcome) => {
                self.publish(ring);
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!("playback failed: {e}");
                if let Err(stop_err) = self.device.stop() {
                    tracing::warn!("device stop after failure: {stop_err}");
                }
                self.state = SessionState::Finished(PlaybackEndReason::Error);
                self.publish(ring);
                if let Some(status) = &self.status {
                    PlayerStatusState::lock(status)
                        .record_end(PlaybackEndReason::Error, Some(e.to_string()));
                }
                Err(e)
            }
        }
    }

    /// End the session as aborted without consulting the device queue, e.g. after the
    /// transfer was cancelled.
    pub fn abort(&mut self) -> Result<()> {
        if self.is_finished() {
            return Ok(());
        }
        self.device.stop()?;
        self.finish(PlaybackEndReason::Aborted);
        Ok(())
    }

    fn step(&mut self, ring: &SharedRing, command: Option<UserCommand>) -> Result<TickOutcome> {
        if let Some(cmd) = command {
            self.apply_command(cmd, ring)?;
        }
        let progressed = match self.state {
            SessionState::AwaitingFormat => self.await_format(ring)?,
            SessionState::PrimingOutput => self.prime(ring)?,
            SessionState::Playing => self.refill(ring)?,
            SessionState::Paused | SessionState::Finished(_) => false,
        };
        Ok(match self.state {
            SessionState::Finished(reason) => TickOutcome::Finished(reason),
            _ if progressed => TickOutcome::Progressed,
            _ => TickOutcome::Idle,
        })
    }

    fn apply_command(&mut self, cmd: UserCommand, ring: &SharedRing) -> Result<()> {
        match cmd {
            UserCommand::Quit => {
                tracing::info!("quit requested");
                self.device.stop()?;
                self.finish(PlaybackEndReason::Aborted);
            }
            UserCommand::TogglePause => match self.state {
                SessionState::Playing => {
                    self.device.pause()?;
                    self.state = SessionState::Paused;
                    tracing::info!("paused");
                }
                SessionState::Paused => {
                    self.device.resume()?;
                    self.state = SessionState::Playing;
                    tracing::info!("resumed");
                }
                _ => tracing::debug!(state = ?self.state, "pause ignored before playback"),
            },
            UserCommand::Rewind => self.rewind(ring)?,
        }
        Ok(())
    }

    fn rewind(&mut self, ring: &SharedRing) -> Result<()> {
        if !ring.holds_stream_start() {
            tracing::warn!("rewind ignored: start of stream no longer buffered");
            return Ok(());
        }
        self.decoder.seek(0)?;
        ring.seek(0);
        if let Some(output) = self.output.as_mut() {
            output.clear_carry();
        }
        self.input_ended = false;
        self.decoder_done = false;
        self.device_flushed = false;
        tracing::info!("rewound to start of stream");
        Ok(())
    }

    /// Decode until the decoder reports a format or runs out of input.
    fn await_format(&mut self, ring: &SharedRing) -> Result<bool> {
        let mut progressed = false;
        loop {
            match self.decode_step(ring)? {
                DecodeStep::NewFormat => {
                    self.negotiate()?;
                    return Ok(true);
                }
                DecodeStep::Produced(0) | DecodeStep::Starved => return Ok(progressed),
                DecodeStep::Produced(n) => {
                    tracing::warn!(bytes = n, "audio before format report dropped");
                    progressed = true;
                }
                DecodeStep::Ended => {
                    return Err(PlayerError::decode(
                        "stream ended before a format was found",
                    ));
                }
            }
        }
    }

    fn negotiate(&mut self) -> Result<()> {
        let stream = self.decoder.format()?;
        if stream.rate == 0 {
            return Err(PlayerError::decode("stream reports a zero sample rate"));
        }
        let output = format::negotiate(stream)?;
        let locked = StreamFormat::new(stream.rate, output.channels(), output.encoding());
        self.decoder.set_format(locked)?;
        self.device.configure(output, stream.rate)?;

        let block_bytes = format::block_bytes(output, stream.rate, self.config.buffer_seconds);
        let handles = self.device.generate_buffers(self.config.device_buffers)?;
        tracing::info!(
            rate_hz = stream.rate,
            channels = stream.channels,
            encoding = %stream.encoding,
            output = %output,
            block_bytes,
            buffers = handles.len(),
            "format negotiated"
        );
        self.output = Some(OutputQueue::new(handles, block_bytes));
        self.negotiated = Some(Negotiated {
            stream: locked,
            output,
            block_bytes,
        });
        self.state = SessionState::PrimingOutput;
        Ok(())
    }

    fn prime(&mut self, ring: &SharedRing) -> Result<bool> {
        let mut progressed = self.decode_into_carry(ring)?;
        let Some(output) = self.output.as_mut() else {
            return Err(PlayerError::device("priming without output buffers"));
        };
        let tail = self.decoder_done && output.carried() > 0;
        if (output.is_block_full() || tail) && output.submit_priming(&mut self.device)? {
            progressed = true;
        }

        let exhausted = self.decoder_done && output.carried() == 0;
        if output.is_primed() || exhausted {
            self.device.play()?;
            tracing::info!(buffers = output.primed(), "playback started");
            self.state = SessionState::Playing;
            progressed = true;
        }
        Ok(progressed)
    }

    fn refill(&mut self, ring: &SharedRing) -> Result<bool> {
        let mut progressed = false;
        if self.device.processed_count()? > 0 {
            if let Some(id) = self.device.unqueue_processed()? {
                self.output_mut()?.reclaim(id);
                progressed = true;
            }
        }

        if self.output_mut()?.has_reclaimed() {
            progressed |= self.decode_into_carry(ring)?;
            let decoder_done = self.decoder_done;
            let Some(output) = self.output.as_mut() else {
                return Err(PlayerError::device("refill without output buffers"));
            };
            let tail = decoder_done && output.carried() > 0;
            if (output.is_block_full() || tail) && output.submit_refill(&mut self.device)? {
                progressed = true;
            }
        }

        let carried = self.output_mut()?.carried();
        if self.decoder_done && carried == 0 && !self.device_flushed {
            self.device.flush()?;
            self.device_flushed = true;
        }

        if self.device.state()? == DeviceState::Stopped {
            let pending = self
                .device
                .queued_count()?
                .saturating_sub(self.device.processed_count()?);
            if pending > 0 {
                self.underrun_restarts += 1;
                tracing::warn!(pending, "device stopped with buffers queued; restarting");
                self.device.play()?;
                progressed = true;
            } else if self.decoder_done && carried == 0 {
                tracing::info!("stream finished");
                self.finish(PlaybackEndReason::Eof);
            }
        }
        Ok(progressed)
    }

    /// Decode until the carry block is full, the decoder is drained, or the ring has nothing
    /// more to feed it.
    fn decode_into_carry(&mut self, ring: &SharedRing) -> Result<bool> {
        let mut progressed = false;
        while !self.decoder_done && !self.output_mut()?.is_block_full() {
            match self.decode_step(ring)? {
                DecodeStep::Produced(0) | DecodeStep::Starved => break,
                DecodeStep::Produced(_) => progressed = true,
                DecodeStep::NewFormat => {
                    tracing::debug!("format change after negotiation ignored");
                }
                DecodeStep::Ended => {
                    progressed = true;
                    break;
                }
            }
        }
        Ok(progressed)
    }

    /// One decoder read, feeding it from the ring for as long as it asks for more.
    fn decode_step(&mut self, ring: &SharedRing) -> Result<DecodeStep> {
        loop {
            let read = {
                let out: &mut [u8] = match self.output.as_mut() {
                    Some(output) => output.spare(),
                    None => self.scratch.as_mut_slice(),
                };
                self.decoder.read_block(out)?
            };
            match read.status {
                ReadStatus::Ok => {
                    if let Some(output) = self.output.as_mut() {
                        output.commit(read.produced);
                    }
                    return Ok(DecodeStep::Produced(read.produced));
                }
                ReadStatus::NewFormat => return Ok(DecodeStep::NewFormat),
                ReadStatus::Done => {
                    if !self.decoder_done {
                        tracing::debug!("decoder drained");
                    }
                    self.decoder_done = true;
                    return Ok(DecodeStep::Ended);
                }
                ReadStatus::NeedMore => {
                    if !self.feed_decoder(ring)? {
                        return Ok(DecodeStep::Starved);
                    }
                }
            }
        }
    }

    /// Move up to one feed chunk from the ring into the decoder.
    ///
    /// Once the producer has finished and the ring is empty, signals end of input instead.
    fn feed_decoder(&mut self, ring: &SharedRing) -> Result<bool> {
        if self.input_ended {
            return Ok(false);
        }
        let n = ring.read(&mut self.feed_buf);
        if n > 0 {
            self.decoder.feed(&self.feed_buf[..n])?;
            return Ok(true);
        }
        if ring.is_drained() {
            tracing::debug!("input exhausted");
            self.decoder.end_of_input();
            self.input_ended = true;
            return Ok(true);
        }
        Ok(false)
    }

    fn output_mut(&mut self) -> Result<&mut OutputQueue> {
        self.output
            .as_mut()
            .ok_or_else(|| PlayerError::device("output buffers not allocated"))
    }

    fn finish(&mut self, reason: PlaybackEndReason) {
        self.state = SessionState::Finished(reason);
        if let Some(status) = &self.status {
            PlayerStatusState::lock(status).record_end(reason, None);
        }
    }

    fn publish(&self, ring: &SharedRing) {
        let Some(status) = &self.status else {
            return;
        };
        let queued = self.device.queued_count().ok();
        let mut s = PlayerStatusState::lock(status);
        s.phase = self.state.phase();
        s.counters = ring.counters();
        s.underrun_restarts = self.underrun_restarts;
        if let Some(n) = self.negotiated {
            s.sample_rate = Some(n.stream.rate);
            s.output_format = Some(n.output);
            s.block_bytes = Some(n.block_bytes);
        }
        if let Some(output) = &self.output {
            s.buffers_submitted = output.submitted();
            s.queued_buffers = queued;
        }
    }
}

impl<D: Decoder, A: AudioDevice> Drop for PlaybackSession<D, A> {
    fn drop(&mut self) {
        self.device.close();
    }
}

//! Pipeline drivers: ring, flow control and session wired to a byte transfer.
//!
//! Two scheduling models:
//! - [`StreamPipeline::run_cooperative`]: the transfer runs on the calling thread and its
//!   progress callback performs one session tick per chunk. After the transfer ends, the
//!   driver keeps ticking until the device queue drains.
//! - [`StreamPipeline::run_threaded`]: the transfer runs on its own thread writing into the
//!   shared ring; the calling thread ticks the session, sleeping between idle ticks.
//!
//! Either way the flow controller is evaluated after each tick and its signal becomes the
//! transfer's pause/resume state.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use stream_player_types::{PlaybackEndReason, SessionStatus};

use crate::config::PlaybackConfig;
use crate::decode::Decoder;
use crate::device::AudioDevice;
use crate::error::{PlayerError, Result};
use crate::flow::{FlowController, FlowSignal};
use crate::ring::SharedRing;
use crate::session::{CommandSource, PlaybackSession, SessionState, TickOutcome};
use crate::status::{PlayerStatusState, SharedStatus};
use crate::transfer::{
    ByteTransfer, TransferAction, TransferControl, TransferEnd, TransferError, TransferSink,
};

/// How long a cancelled producer thread gets to notice before it is detached.
const PRODUCER_JOIN_GRACE: Duration = Duration::from_secs(2);

/// Outcome of a whole pipeline run.
#[derive(Debug)]
pub struct PlaybackReport {
    pub end_reason: PlaybackEndReason,
    /// Fatal session error, when `end_reason` is `Error`.
    pub error: Option<PlayerError>,
    /// Transfer failure; playback still drains what arrived before it.
    pub transfer_error: Option<TransferError>,
    pub status: SessionStatus,
}

pub struct StreamPipeline<D: Decoder, A: AudioDevice> {
    config: PlaybackConfig,
    session: PlaybackSession<D, A>,
    ring: Arc<SharedRing>,
    flow: FlowController,
    status: SharedStatus,
}

impl<D: Decoder, A: AudioDevice> StreamPipeline<D, A> {
    /// Build the ring and session. Fails on invalid config or if the device cannot be opened.
    pub fn new(config: PlaybackConfig, decoder: D, device: A) -> Result<Self> {
        let status = PlayerStatusState::shared();
        let session = PlaybackSession::new(config.clone(), decoder, device)?
            .with_status(status.clone());
        tracing::debug!(
            ring_capacity = config.ring_capacity,
            max_gap = config.max_gap,
            buffers = config.device_buffers,
            "pipeline ready"
        );
        Ok(Self {
            ring: Arc::new(SharedRing::new(config.ring_capacity)),
            flow: FlowController::new(config.max_gap),
            session,
            status,
            config,
        })
    }

    /// Label the source in status snapshots.
    pub fn with_source(self, source: impl Into<String>) -> Self {
        PlayerStatusState::lock(&self.status).source = Some(source.into());
        self
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    /// Run with the transfer driving ticks from its progress callback.
    pub fn run_cooperative(
        mut self,
        transfer: &mut dyn ByteTransfer,
        commands: &mut dyn CommandSource,
    ) -> PlaybackReport {
        let mut error = None;
        let result = {
            let mut sink = CooperativeSink {
                pipeline: &mut self,
                commands: &mut *commands,
                error: &mut error,
            };
            transfer.run(&mut sink)
        };
        self.ring.close();

        let transfer_error = self.log_transfer_result(result);
        if error.is_none() && !self.session.is_finished() {
            error = self.drain(commands).err();
        }
        self.report(error, transfer_error)
    }

    /// Run the transfer on a producer thread and tick on the calling thread.
    pub fn run_threaded(
        mut self,
        mut transfer: Box<dyn ByteTransfer + Send>,
        commands: &mut dyn CommandSource,
    ) -> PlaybackReport {
        let control = TransferControl::new();
        let producer = {
            let ring = self.ring.clone();
            let control = control.clone();
            let wait = self.config.tick_interval;
            thread::Builder::new()
                .name("stream-transfer".into())
                .spawn(move || {
                    let mut sink = RingSink {
                        ring: &ring,
                        control,
                        wait,
                    };
                    let result = transfer.run(&mut sink);
                    ring.close();
                    result
                })
        };
        let mut producer = match producer {
            Ok(handle) => Some(handle),
            Err(e) => {
                let err = PlayerError::Config(format!("spawn transfer thread: {e}"));
                return self.report(Some(err), None);
            }
        };

        let mut error = None;
        let mut transfer_error = None;
        loop {
            let outcome = match self.consume(commands) {
                Ok((outcome, signal)) => {
                    if let Some(signal) = signal {
                        control.apply(signal);
                    }
                    outcome
                }
                Err(e) => {
                    error = Some(e);
                    break;
                }
            };

            if producer.as_ref().is_some_and(|h| h.is_finished()) {
                if let Some(handle) = producer.take() {
                    transfer_error = self.join_producer(handle);
                }
            }

            match outcome {
                TickOutcome::Finished(_) => break,
                TickOutcome::Progressed => {}
                TickOutcome::Idle => {
                    self.ring.wait_for_data(self.config.tick_interval);
                    thread::sleep(self.config.tick_interval);
                }
            }
        }

        control.cancel();
        if let Some(handle) = producer.take() {
            let deadline = Instant::now() + PRODUCER_JOIN_GRACE;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                transfer_error = self.join_producer(handle).or(transfer_error);
            } else {
                tracing::warn!("transfer thread still blocked; detaching");
            }
        }
        self.report(error, transfer_error)
    }

    /// One session tick followed by a flow-control evaluation.
    fn consume(
        &mut self,
        commands: &mut dyn CommandSource,
    ) -> Result<(TickOutcome, Option<FlowSignal>)> {
        let outcome = self.session.tick(&self.ring, commands.poll())?;
        let signal = if self.ring.is_closed() {
            self.flow.reset();
            None
        } else {
            self.flow.evaluate(self.ring.counters())
        };
        if signal.is_some() || self.ring.is_closed() {
            PlayerStatusState::lock(&self.status).producer_paused = self.flow.is_paused();
        }
        Ok((outcome, signal))
    }

    /// Tick until the session finishes once no more bytes will arrive.
    fn drain(&mut self, commands: &mut dyn CommandSource) -> Result<()> {
        loop {
            match self.consume(commands)?.0 {
                TickOutcome::Finished(_) => return Ok(()),
                TickOutcome::Progressed => {}
                TickOutcome::Idle => thread::sleep(self.config.tick_interval),
            }
        }
    }

    fn join_producer(
        &self,
        handle: thread::JoinHandle<std::result::Result<TransferEnd, TransferError>>,
    ) -> Option<TransferError> {
        match handle.join() {
            Ok(result) => self.log_transfer_result(result),
            Err(_) => {
                tracing::error!("transfer thread panicked");
                None
            }
        }
    }

    fn log_transfer_result(
        &self,
        result: std::result::Result<TransferEnd, TransferError>,
    ) -> Option<TransferError> {
        let counters = self.ring.counters();
        match result {
            Ok(TransferEnd::Completed) => {
                tracing::info!(bytes = counters.received, "transfer complete");
                None
            }
            Ok(TransferEnd::Aborted) => {
                tracing::info!(bytes = counters.received, "transfer aborted");
                None
            }
            Err(e) => {
                tracing::warn!(
                    bytes = counters.received,
                    "transfer failed: {e}; playing what arrived"
                );
                Some(e)
            }
        }
    }

    fn report(
        mut self,
        error: Option<PlayerError>,
        transfer_error: Option<TransferError>,
    ) -> PlaybackReport {
        let end_reason = match self.session.state() {
            SessionState::Finished(reason) => reason,
            _ => {
                if let Err(e) = self.session.abort() {
                    tracing::warn!("device stop: {e}");
                }
                PlaybackEndReason::Aborted
            }
        };
        let status = {
            let mut s = PlayerStatusState::lock(&self.status);
            s.counters = self.ring.counters();
            s.record_end(end_reason, error.as_ref().map(|e| e.to_string()));
            s.snapshot()
        };
        tracing::info!(
            reason = ?end_reason,
            received = status.bytes_received,
            consumed = status.bytes_consumed,
            underruns = status.underrun_restarts,
            "session ended"
        );
        PlaybackReport {
            end_reason,
            error,
            transfer_error,
            status,
        }
    }
}

/// Producer-thread sink: writes into the ring and obeys the shared flags.
struct RingSink<'a> {
    ring: &'a SharedRing,
    control: TransferControl,
    wait: Duration,
}

impl TransferSink for RingSink<'_> {
    fn on_data(&mut self, bytes: &[u8]) -> usize {
        let n = self.ring.write(bytes);
        if n == 0 && !self.control.is_cancelled() {
            self.ring.wait_for_space(self.wait);
        }
        n
    }

    fn on_progress(&mut self) -> TransferAction {
        self.control.action()
    }
}

/// Same-thread sink: every progress callback runs one pipeline tick.
struct CooperativeSink<'a, D: Decoder, A: AudioDevice> {
    pipeline: &'a mut StreamPipeline<D, A>,
    commands: &'a mut dyn CommandSource,
    error: &'a mut Option<PlayerError>,
}

impl<D: Decoder, A: AudioDevice> TransferSink for CooperativeSink<'_, D, A> {
    fn on_data(&mut self, bytes: &[u8]) -> usize {
        self.pipeline.ring.write(bytes)
    }

    fn on_progress(&mut self) -> TransferAction {
        match self.pipeline.consume(&mut *self.commands) {
            Ok((TickOutcome::Finished(_), _)) => TransferAction::Abort,
            Ok(_) if self.pipeline.flow.is_paused() => TransferAction::Pause,
            Ok(_) => TransferAction::Continue,
            Err(e) => {
                *self.error = Some(e);
                TransferAction::Abort
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{BlockRead, SymphoniaDecoder};
    use crate::format::{SampleEncoding, StreamFormat};
    use crate::session::UserCommand;
    use crate::testing::{s16_ramp, wav, MockDevice, ScriptedDecoder, Step, VecCommands};
    use crate::transfer::ReaderTransfer;
    use std::cell::{Cell, RefCell};
    use std::io::Cursor;
    use std::rc::Rc;
    use symphonia::core::probe::Hint;

    fn config() -> PlaybackConfig {
        PlaybackConfig {
            ring_capacity: 4096,
            max_gap: 1024,
            feed_chunk: 256,
            tick_interval: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn mono8_steps() -> Vec<Step> {
        vec![
            Step::Format(StreamFormat::new(8_000, 1, SampleEncoding::Unsigned8)),
            Step::Pcm(vec![1; 2_000]),
        ]
    }

    #[test]
    fn quit_during_cooperative_transfer_aborts_it() {
        let pipeline = StreamPipeline::new(
            config(),
            ScriptedDecoder::new(mono8_steps()),
            MockDevice::new(),
        )
        .unwrap()
        .with_source("test://quit");
        let mut transfer = ReaderTransfer::new(Cursor::new(vec![0u8; 100_000]), 512, Duration::ZERO);
        let mut commands = VecCommands::new(vec![None, None, Some(UserCommand::Quit)]);

        let report = pipeline.run_cooperative(&mut transfer, &mut commands);
        assert_eq!(report.end_reason, PlaybackEndReason::Aborted);
        assert!(report.error.is_none());
        assert!(transfer.delivered() < 100_000);
        assert_eq!(report.status.source.as_deref(), Some("test://quit"));
    }

    #[test]
    fn cooperative_decode_error_is_reported() {
        let steps = vec![
            Step::Format(StreamFormat::new(8_000, 1, SampleEncoding::Unsigned8)),
            Step::Fail("corrupt"),
        ];
        let pipeline =
            StreamPipeline::new(config(), ScriptedDecoder::new(steps), MockDevice::new()).unwrap();
        let mut transfer = ReaderTransfer::new(Cursor::new(vec![0u8; 10_000]), 512, Duration::ZERO);
        let mut commands = VecCommands::new(vec![]);

        let report = pipeline.run_cooperative(&mut transfer, &mut commands);
        assert_eq!(report.end_reason, PlaybackEndReason::Error);
        assert!(matches!(report.error, Some(PlayerError::Decode(_))));
        assert!(report.status.error.unwrap().contains("corrupt"));
    }

    #[test]
    fn flow_control_pauses_cooperative_producer() {
        // Decoded audio is scripted, so nothing is pulled from the ring and the gap only grows.
        let steps = vec![
            Step::Format(StreamFormat::new(8_000, 1, SampleEncoding::Unsigned8)),
            Step::Pcm(vec![1; 20_000]),
        ];
        let pipeline =
            StreamPipeline::new(config(), ScriptedDecoder::new(steps), MockDevice::new()).unwrap();
        let status = pipeline.status();
        let mut transfer = ReaderTransfer::new(Cursor::new(vec![0u8; 3_000]), 512, Duration::ZERO);
        let mut ticks = 0;
        let mut commands = move || {
            ticks += 1;
            let paused = PlayerStatusState::lock(&status).producer_paused;
            (paused || ticks > 50).then_some(UserCommand::Quit)
        };

        let report = pipeline.run_cooperative(&mut transfer, &mut commands);
        assert_eq!(report.end_reason, PlaybackEndReason::Aborted);
        assert!(report.status.bytes_received > 1024);
        assert!(report.status.bytes_received <= 1024 + 512);
        assert_eq!(report.status.bytes_consumed, 0);
    }

    #[test]
    fn threaded_quit_cancels_producer() {
        let pipeline = StreamPipeline::new(
            config(),
            ScriptedDecoder::new(mono8_steps()),
            MockDevice::new(),
        )
        .unwrap();
        let transfer = ReaderTransfer::new(Cursor::new(vec![0u8; 1_000_000]), 512, Duration::from_millis(1));
        let mut commands = VecCommands::new(vec![None, None, None, Some(UserCommand::Quit)]);

        let report = pipeline.run_threaded(Box::new(transfer), &mut commands);
        assert_eq!(report.end_reason, PlaybackEndReason::Aborted);
        assert!(report.transfer_error.is_none());
        assert!(report.status.bytes_received < 1_000_000);
    }

    #[test]
    fn threaded_truncated_stream_is_a_decode_error() {
        // The ring drains before any format is reported.
        let pipeline =
            StreamPipeline::new(config(), ScriptedDecoder::new(vec![]), MockDevice::new()).unwrap();
        let transfer = ReaderTransfer::new(Cursor::new(vec![7u8; 300]), 128, Duration::from_millis(1));
        let mut commands = VecCommands::new(vec![]);

        let report = pipeline.run_threaded(Box::new(transfer), &mut commands);
        assert_eq!(report.end_reason, PlaybackEndReason::Error);
        assert_eq!(report.status.bytes_received, 300);
        assert_eq!(report.status.bytes_consumed, 300);
    }

    /// Small ring and lookahead so a one-second file cycles through flow control.
    fn wav_config() -> PlaybackConfig {
        PlaybackConfig {
            ring_capacity: 64 * 1024,
            max_gap: 32 * 1024,
            feed_chunk: 4096,
            decode_lookahead: 32 * 1024,
            tick_interval: Duration::from_millis(1),
            ..Default::default()
        }
    }

    /// One second of 44.1 kHz stereo 16-bit audio, as (file, pcm).
    fn cd_second() -> (Vec<u8>, Vec<u8>) {
        let pcm = s16_ramp(44_100 * 2);
        (wav(44_100, 2, 16, &pcm), pcm)
    }

    fn wav_pipeline() -> (StreamPipeline<SymphoniaDecoder, MockDevice>, Rc<RefCell<Vec<u8>>>) {
        let config = wav_config();
        let decoder = SymphoniaDecoder::new(Hint::new(), config.decode_lookahead);
        let device = MockDevice::play_through();
        let played = device.played();
        (StreamPipeline::new(config, decoder, device).unwrap(), played)
    }

    #[test]
    fn cooperative_wav_plays_to_end_of_stream() {
        let (file, pcm) = cd_second();
        let (pipeline, played) = wav_pipeline();
        let mut transfer = ReaderTransfer::new(Cursor::new(file.clone()), 4096, Duration::ZERO);
        let mut commands = VecCommands::new(vec![]);

        let report = pipeline.run_cooperative(&mut transfer, &mut commands);
        assert_eq!(report.end_reason, PlaybackEndReason::Eof);
        assert!(report.error.is_none());
        assert_eq!(report.status.bytes_received, file.len() as u64);
        assert_eq!(report.status.underrun_restarts, 0);
        assert!(*played.borrow() == pcm);
    }

    #[test]
    fn threaded_wav_plays_to_end_of_stream() {
        let (file, pcm) = cd_second();
        let (pipeline, played) = wav_pipeline();
        let transfer = ReaderTransfer::new(Cursor::new(file.clone()), 4096, Duration::from_millis(1));
        let mut commands = VecCommands::new(vec![]);

        let report = pipeline.run_threaded(Box::new(transfer), &mut commands);
        assert_eq!(report.end_reason, PlaybackEndReason::Eof);
        assert!(report.error.is_none());
        assert!(report.transfer_error.is_none());
        assert_eq!(report.status.bytes_received, file.len() as u64);
        assert_eq!(report.status.bytes_consumed, file.len() as u64);
        assert!(*played.borrow() == pcm);
    }

    /// Decoder that takes no input until `open` is set, then drains whatever it is fed.
    struct GatedDecoder {
        open: Rc<Cell<bool>>,
    }

    impl Decoder for GatedDecoder {
        fn feed(&mut self, _bytes: &[u8]) -> Result<()> {
            Ok(())
        }

        fn read_block(&mut self, _out: &mut [u8]) -> Result<BlockRead> {
            Ok(if self.open.get() {
                BlockRead::need_more()
            } else {
                BlockRead::ok(0)
            })
        }

        fn format(&self) -> Result<StreamFormat> {
            Err(PlayerError::decode("no format"))
        }

        fn set_format(&mut self, _format: StreamFormat) -> Result<()> {
            Ok(())
        }

        fn seek(&mut self, _position: u64) -> Result<()> {
            Ok(())
        }

        fn end_of_input(&mut self) {}
    }

    #[test]
    fn threaded_producer_pauses_and_resumes() {
        let config = PlaybackConfig {
            ring_capacity: 16 * 1024,
            max_gap: 4096,
            ..config()
        };
        let open = Rc::new(Cell::new(false));
        let decoder = GatedDecoder { open: open.clone() };
        let pipeline = StreamPipeline::new(config, decoder, MockDevice::new()).unwrap();
        let status = pipeline.status();
        let transfer = ReaderTransfer::new(Cursor::new(vec![0u8; 1_000_000]), 512, Duration::from_millis(1));

        let seen = Rc::new(RefCell::new(vec![false]));
        let mut commands = {
            let seen = seen.clone();
            let open = open.clone();
            move || {
                let paused = PlayerStatusState::lock(&status).producer_paused;
                let mut seen = seen.borrow_mut();
                if seen.last() != Some(&paused) {
                    seen.push(paused);
                }
                if paused {
                    open.set(true);
                }
                (open.get() && !paused).then_some(UserCommand::Quit)
            }
        };

        let report = pipeline.run_threaded(Box::new(transfer), &mut commands);
        assert_eq!(report.end_reason, PlaybackEndReason::Aborted);
        assert_eq!(*seen.borrow(), vec![false, true, false]);
        assert!(report.status.bytes_received < 1_000_000);
        assert!(report.status.bytes_consumed > 4096);
    }
}

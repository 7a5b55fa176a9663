//! Scripted collaborators for unit tests.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::decode::{BlockRead, Decoder};
use crate::device::{AudioDevice, BufferId, DeviceState};
use crate::error::{PlayerError, Result};
use crate::format::{OutputFormat, StreamFormat};
use crate::session::{CommandSource, UserCommand};

/// One scripted decoder response.
pub(crate) enum Step {
    NeedMore,
    Format(StreamFormat),
    /// PCM handed out across as many reads as the output space requires.
    Pcm(Vec<u8>),
    Done,
    Fail(&'static str),
}

/// Decoder replaying a fixed script. Once the script runs out it asks for more input until
/// end of input is signalled, then reports `Done`.
pub(crate) struct ScriptedDecoder {
    script: VecDeque<Step>,
    current: Option<StreamFormat>,
    pub locked: Vec<StreamFormat>,
    pub fed: Vec<u8>,
    pub seeks: Vec<u64>,
    pub end_of_input: bool,
}

impl ScriptedDecoder {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            script: steps.into(),
            current: None,
            locked: Vec::new(),
            fed: Vec::new(),
            seeks: Vec::new(),
            end_of_input: false,
        }
    }
}

impl Decoder for ScriptedDecoder {
    fn feed(&mut self, bytes: &[u8]) -> Result<()> {
        self.fed.extend_from_slice(bytes);
        Ok(())
    }

    fn read_block(&mut self, out: &mut [u8]) -> Result<BlockRead> {
        match self.script.pop_front() {
            None if self.end_of_input => Ok(BlockRead::done()),
            None | Some(Step::NeedMore) => Ok(BlockRead::need_more()),
            Some(Step::Format(f)) => {
                self.current = Some(f);
                Ok(BlockRead::new_format())
            }
            Some(Step::Pcm(bytes)) => {
                let n = bytes.len().min(out.len());
                out[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    self.script.push_front(Step::Pcm(bytes[n..].to_vec()));
                }
                Ok(BlockRead::ok(n))
            }
            Some(Step::Done) => {
                self.script.push_front(Step::Done);
                Ok(BlockRead::done())
            }
            Some(Step::Fail(msg)) => Err(PlayerError::decode(msg)),
        }
    }

    fn format(&self) -> Result<StreamFormat> {
        self.current
            .ok_or_else(|| PlayerError::decode("no format yet"))
    }

    fn set_format(&mut self, format: StreamFormat) -> Result<()> {
        self.locked.push(format);
        Ok(())
    }

    fn seek(&mut self, position: u64) -> Result<()> {
        self.seeks.push(position);
        self.end_of_input = false;
        Ok(())
    }

    fn end_of_input(&mut self) {
        self.end_of_input = true;
    }
}

/// In-memory queue device. Tests decide when buffers finish playing.
pub(crate) struct MockDevice {
    pub opened: bool,
    closed: Rc<Cell<bool>>,
    pub configured: Vec<(OutputFormat, u32)>,
    generated: u32,
    pending: VecDeque<BufferId>,
    processed: VecDeque<BufferId>,
    state: DeviceState,
    submissions: Vec<(BufferId, Vec<u8>)>,
    played: Rc<RefCell<Vec<u8>>>,
    /// Once started, buffers finish as soon as they are queued.
    play_through: bool,
    pub plays: usize,
    pub stops: usize,
    pub flushes: usize,
    pub fail_submit: bool,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            opened: false,
            closed: Rc::new(Cell::new(false)),
            configured: Vec::new(),
            generated: 0,
            pending: VecDeque::new(),
            processed: VecDeque::new(),
            state: DeviceState::Stopped,
            submissions: Vec::new(),
            played: Rc::new(RefCell::new(Vec::new())),
            play_through: false,
            plays: 0,
            stops: 0,
            flushes: 0,
            fail_submit: false,
        }
    }

    pub fn submissions(&self) -> &[(BufferId, Vec<u8>)] {
        &self.submissions
    }

    pub fn closed_flag(&self) -> Rc<Cell<bool>> {
        self.closed.clone()
    }

    /// Mark the oldest pending buffer as played.
    pub fn finish_next(&mut self) -> Option<BufferId> {
        let id = self.pending.pop_front()?;
        self.processed.push_back(id);
        if self.pending.is_empty() && self.state == DeviceState::Playing {
            self.state = DeviceState::Stopped;
        }
        Some(id)
    }

    pub fn finish_all(&mut self) {
        while self.finish_next().is_some() {}
        if self.state == DeviceState::Playing {
            self.state = DeviceState::Stopped;
        }
    }

    pub fn force_state(&mut self, state: DeviceState) {
        self.state = state;
    }

    /// Every submitted block, concatenated in submission order. Outlives the device.
    pub fn played(&self) -> Rc<RefCell<Vec<u8>>> {
        self.played.clone()
    }

    /// Device that plays whatever is queued instantly.
    pub fn play_through() -> Self {
        Self {
            play_through: true,
            ..Self::new()
        }
    }

    fn settle(&mut self) {
        if self.play_through && self.plays > 0 && self.state != DeviceState::Paused {
            self.state = DeviceState::Playing;
            self.finish_all();
        }
    }
}

impl AudioDevice for MockDevice {
    fn open(&mut self) -> Result<()> {
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) {
        self.closed.set(true);
    }

    fn configure(&mut self, format: OutputFormat, rate: u32) -> Result<()> {
        self.configured.push((format, rate));
        Ok(())
    }

    fn generate_buffers(&mut self, count: usize) -> Result<Vec<BufferId>> {
        let start = self.generated;
        self.generated += count as u32;
        Ok((start..self.generated).map(BufferId).collect())
    }

    fn submit(&mut self, buffer: BufferId, pcm: &[u8]) -> Result<()> {
        if self.fail_submit {
            return Err(PlayerError::device("submit rejected"));
        }
        if buffer.0 >= self.generated
            || self.pending.contains(&buffer)
            || self.processed.contains(&buffer)
        {
            return Err(PlayerError::device(format!("buffer {} not free", buffer.0)));
        }
        self.pending.push_back(buffer);
        self.submissions.push((buffer, pcm.to_vec()));
        self.played.borrow_mut().extend_from_slice(pcm);
        self.settle();
        Ok(())
    }

    fn queued_count(&self) -> Result<usize> {
        Ok(self.pending.len() + self.processed.len())
    }

    fn processed_count(&self) -> Result<usize> {
        Ok(self.processed.len())
    }

    fn unqueue_processed(&mut self) -> Result<Option<BufferId>> {
        Ok(self.processed.pop_front())
    }

    fn play(&mut self) -> Result<()> {
        self.plays += 1;
        self.state = if self.pending.is_empty() {
            DeviceState::Stopped
        } else {
            DeviceState::Playing
        };
        self.settle();
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        if self.state == DeviceState::Playing {
            self.state = DeviceState::Paused;
        }
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        if self.state == DeviceState::Paused {
            self.state = DeviceState::Playing;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stops += 1;
        while let Some(id) = self.pending.pop_front() {
            self.processed.push_back(id);
        }
        self.state = DeviceState::Stopped;
        Ok(())
    }

    fn state(&self) -> Result<DeviceState> {
        Ok(self.state)
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

/// Build a canonical 44-byte-header WAV file around `pcm`.
pub(crate) fn wav(rate: u32, channels: u16, bits: u16, pcm: &[u8]) -> Vec<u8> {
    let block_align = channels * bits / 8;
    let mut out = Vec::new();
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + pcm.len() as u32).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&rate.to_le_bytes());
    out.extend_from_slice(&(rate * block_align as u32).to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&bits.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&(pcm.len() as u32).to_le_bytes());
    out.extend_from_slice(pcm);
    out
}

/// Little-endian 16-bit samples that never repeat within a short window.
pub(crate) fn s16_ramp(samples: usize) -> Vec<u8> {
    (0..samples)
        .flat_map(|i| ((i as i16).wrapping_mul(97)).to_le_bytes())
        .collect()
}

/// Command source replaying one entry per poll, then `None` forever.
pub(crate) struct VecCommands(VecDeque<Option<UserCommand>>);

impl VecCommands {
    pub fn new(commands: Vec<Option<UserCommand>>) -> Self {
        Self(commands.into())
    }
}

impl CommandSource for VecCommands {
    fn poll(&mut self) -> Option<UserCommand> {
        self.0.pop_front().flatten()
    }
}

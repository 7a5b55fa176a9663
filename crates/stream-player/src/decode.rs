//! Decoder boundary and the Symphonia-backed feed decoder.
//!
//! The pipeline pushes compressed bytes with [`Decoder::feed`] and pulls PCM with
//! [`Decoder::read_block`]. "Need more input" is a normal status, not an error.
//!
//! [`SymphoniaDecoder`] adapts Symphonia's pull model:
//! - probe the container once enough bytes are buffered
//! - decode packets into interleaved PCM in the locked encoding
//! - hold a lookahead of compressed bytes so a packet is never cut short mid-read

use symphonia::core::audio::{AudioBufferRef, SampleBuffer};
use symphonia::core::codecs::{CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::{PlayerError, Result};
use crate::feed::FeedBuffer;
use crate::format::{SampleEncoding, StreamFormat};

/// Consecutive undecodable packets tolerated before the bitstream is declared malformed.
const MAX_SKIPPED_PACKETS: u32 = 16;

/// Outcome class of a [`Decoder::read_block`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadStatus {
    /// More compressed input is required before output can be produced.
    NeedMore,
    /// The stream format became known (or changed); query [`Decoder::format`].
    NewFormat,
    /// PCM was produced (possibly zero bytes).
    Ok,
    /// End of input reached and all output has been handed out.
    Done,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRead {
    pub status: ReadStatus,
    pub produced: usize,
}

impl BlockRead {
    pub fn ok(produced: usize) -> Self {
        Self {
            status: ReadStatus::Ok,
            produced,
        }
    }

    pub fn need_more() -> Self {
        Self {
            status: ReadStatus::NeedMore,
            produced: 0,
        }
    }

    pub fn new_format() -> Self {
        Self {
            status: ReadStatus::NewFormat,
            produced: 0,
        }
    }

    pub fn done() -> Self {
        Self {
            status: ReadStatus::Done,
            produced: 0,
        }
    }
}

/// Compressed-bytes-in, PCM-out decoder driven one block at a time.
pub trait Decoder {
    /// Append compressed bytes to the decoder's input.
    fn feed(&mut self, bytes: &[u8]) -> Result<()>;

    /// Decode into `out`, returning how many bytes were written and why it stopped.
    fn read_block(&mut self, out: &mut [u8]) -> Result<BlockRead>;

    /// Stream format reported by the last [`ReadStatus::NewFormat`].
    fn format(&self) -> Result<StreamFormat>;

    /// Lock PCM output to exactly this format.
    fn set_format(&mut self, format: StreamFormat) -> Result<()>;

    /// Reposition to a byte offset of the compressed stream. Input fed afterwards is
    /// expected to start at `position`.
    fn seek(&mut self, position: u64) -> Result<()>;

    /// No further input will arrive; flush what is buffered.
    fn end_of_input(&mut self);
}

struct ActiveStream {
    reader: Box<dyn FormatReader>,
    codec: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
}

/// Feed-mode decoder over any container/codec Symphonia's default registry knows.
pub struct SymphoniaDecoder {
    hint: Hint,
    feed: FeedBuffer,
    lookahead: usize,
    native_depth: bool,
    active: Option<ActiveStream>,
    native: Option<StreamFormat>,
    locked: Option<StreamFormat>,
    pending: Vec<u8>,
    pending_pos: usize,
    skipped: u32,
    done: bool,
}

enum PacketStep {
    Produced,
    Skipped,
    NeedMore,
    FormatChanged,
    End,
}

impl SymphoniaDecoder {
    /// `lookahead` is how many undecoded bytes must be buffered before a packet is read
    /// while the stream is still arriving.
    pub fn new(hint: Hint, lookahead: usize) -> Self {
        Self {
            hint,
            feed: FeedBuffer::new(),
            lookahead: lookahead.max(1),
            native_depth: false,
            active: None,
            native: None,
            locked: None,
            pending: Vec::new(),
            pending_pos: 0,
            skipped: 0,
            done: false,
        }
    }

    /// Report sources deeper than 16 bits at their real depth instead of converting to
    /// 16-bit output.
    pub fn with_native_depth(mut self, native_depth: bool) -> Self {
        self.native_depth = native_depth;
        self
    }

    fn ready_to_read(&self) -> bool {
        self.feed.is_eof() || self.feed.ahead() >= self.lookahead
    }

    fn probe(&mut self) -> Result<bool> {
        self.feed.rewind_reader();
        let mss = MediaSourceStream::new(Box::new(self.feed.source()), Default::default());
        let probed = match symphonia::default::get_probe().format(
            &self.hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        ) {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Ok(false);
            }
            Err(e) => return Err(PlayerError::decode(format!("probe failed: {e}"))),
        };
        self.feed.release();

        let reader = probed.format;
        let (codec, track_id, params) = open_default_track(reader.as_ref())?;
        self.native = Some(self.native_format(&params)?);
        self.active = Some(ActiveStream {
            reader,
            codec,
            track_id,
        });
        tracing::debug!(format = ?self.native, "stream probed");
        Ok(true)
    }

    fn native_format(&self, params: &CodecParameters) -> Result<StreamFormat> {
        let rate = params
            .sample_rate
            .ok_or_else(|| PlayerError::decode("unknown sample rate"))?;
        let channels = params
            .channels
            .ok_or_else(|| PlayerError::decode("unknown channel layout"))?
            .count() as u16;
        let bits = params.bits_per_sample.or(params.bits_per_coded_sample);
        Ok(StreamFormat::new(
            rate,
            channels,
            encoding_for_depth(bits, self.native_depth),
        ))
    }

    fn decode_packet(&mut self) -> Result<PacketStep> {
        let Some(active) = self.active.as_mut() else {
            return Ok(PacketStep::NeedMore);
        };
        let packet = match active.reader.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) => {
                return match e.kind() {
                    std::io::ErrorKind::UnexpectedEof => Ok(PacketStep::End),
                    std::io::ErrorKind::WouldBlock => {
                        tracing::warn!("decoder ran past buffered input");
                        Ok(PacketStep::NeedMore)
                    }
                    _ => Err(PlayerError::decode(e)),
                };
            }
            Err(SymphoniaError::ResetRequired) => {
                let (codec, track_id, params) = open_default_track(active.reader.as_ref())?;
                active.codec = codec;
                active.track_id = track_id;
                self.native = Some(self.native_format(&params)?);
                return Ok(PacketStep::FormatChanged);
            }
            Err(e) => return Err(PlayerError::decode(e)),
        };
        if packet.track_id() != active.track_id {
            return Ok(PacketStep::Skipped);
        }

        let decoded = match active.codec.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(msg)) => {
                self.skipped += 1;
                if self.skipped > MAX_SKIPPED_PACKETS {
                    return Err(PlayerError::decode(format!(
                        "{} consecutive corrupt packets (last: {msg})",
                        self.skipped
                    )));
                }
                tracing::debug!(skipped = self.skipped, "corrupt packet skipped: {msg}");
                return Ok(PacketStep::Skipped);
            }
            Err(e) => return Err(PlayerError::decode(e)),
        };
        self.skipped = 0;

        let target = self
            .locked
            .or(self.native)
            .ok_or_else(|| PlayerError::decode("no output format"))?;
        let spec = *decoded.spec();
        if spec.rate != target.rate || spec.channels.count() as u16 != target.channels {
            tracing::warn!(
                rate_hz = spec.rate,
                channels = spec.channels.count(),
                "packet format differs from locked output; dropped"
            );
            return Ok(PacketStep::Skipped);
        }

        self.pending.clear();
        self.pending_pos = 0;
        append_pcm(&mut self.pending, decoded, target.encoding)?;
        Ok(PacketStep::Produced)
    }
}

impl Decoder for SymphoniaDecoder {
    fn feed(&mut self, bytes: &[u8]) -> Result<()> {
        if self.feed.is_eof() && !bytes.is_empty() {
            return Err(PlayerError::decode("input fed after end of input"));
        }
        self.feed.push(bytes);
        Ok(())
    }

    fn read_block(&mut self, out: &mut [u8]) -> Result<BlockRead> {
        if out.is_empty() {
            return Ok(BlockRead::ok(0));
        }
        loop {
            if self.pending_pos < self.pending.len() {
                let n = (self.pending.len() - self.pending_pos).min(out.len());
                out[..n].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
                self.pending_pos += n;
                return Ok(BlockRead::ok(n));
            }
            if self.done {
                return Ok(BlockRead::done());
            }
            if !self.ready_to_read() {
                return Ok(BlockRead::need_more());
            }
            if self.active.is_none() {
                if self.probe()? {
                    return Ok(BlockRead::new_format());
                }
                if self.feed.is_eof() {
                    return Err(PlayerError::decode("stream ended before a format was found"));
                }
                return Ok(BlockRead::need_more());
            }
            match self.decode_packet()? {
                PacketStep::Produced | PacketStep::Skipped => continue,
                PacketStep::NeedMore => return Ok(BlockRead::need_more()),
                PacketStep::FormatChanged => return Ok(BlockRead::new_format()),
                PacketStep::End => self.done = true,
            }
        }
    }

    fn format(&self) -> Result<StreamFormat> {
        self.native
            .ok_or_else(|| PlayerError::decode("format not known yet"))
    }

    fn set_format(&mut self, format: StreamFormat) -> Result<()> {
        match format.encoding {
            SampleEncoding::Unsigned8 | SampleEncoding::Signed16 => {
                self.locked = Some(format);
                Ok(())
            }
            other => Err(PlayerError::decode(format!(
                "cannot lock output to {other} samples"
            ))),
        }
    }

    fn seek(&mut self, position: u64) -> Result<()> {
        self.active = None;
        self.pending.clear();
        self.pending_pos = 0;
        self.skipped = 0;
        self.done = false;
        self.feed.reset(position);
        tracing::debug!(position, "decoder repositioned");
        Ok(())
    }

    fn end_of_input(&mut self) {
        self.feed.mark_eof();
    }
}

fn open_default_track(
    reader: &dyn FormatReader,
) -> Result<(Box<dyn symphonia::core::codecs::Decoder>, u32, CodecParameters)> {
    let track = reader
        .default_track()
        .ok_or_else(|| PlayerError::decode("no default audio track"))?;
    let params = track.codec_params.clone();
    let codec = symphonia::default::get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(PlayerError::decode)?;
    Ok((codec, track.id, params))
}

/// Encoding a decoder reports for a source bit depth.
///
/// Unknown depth (lossy codecs) reports 16-bit, matching what those codecs are usually
/// rendered at.
fn encoding_for_depth(bits: Option<u32>, native_depth: bool) -> SampleEncoding {
    match bits {
        Some(b) if b <= 8 => SampleEncoding::Unsigned8,
        Some(b) if b <= 16 || !native_depth => SampleEncoding::Signed16,
        Some(b) if b <= 24 => SampleEncoding::Signed24,
        Some(_) => SampleEncoding::Signed32,
        None => SampleEncoding::Signed16,
    }
}

/// Interleave `decoded` into little-endian PCM bytes of `encoding`.
fn append_pcm(out: &mut Vec<u8>, decoded: AudioBufferRef<'_>, encoding: SampleEncoding) -> Result<()> {
    let spec = *decoded.spec();
    let frames = decoded.frames() as u64;
    match encoding {
        SampleEncoding::Unsigned8 => {
            let mut buf = SampleBuffer::<u8>::new(frames, spec);
            buf.copy_interleaved_ref(decoded);
            out.extend_from_slice(buf.samples());
        }
        SampleEncoding::Signed16 => {
            let mut buf = SampleBuffer::<i16>::new(frames, spec);
            buf.copy_interleaved_ref(decoded);
            out.reserve(buf.samples().len() * 2);
            for s in buf.samples() {
                out.extend_from_slice(&s.to_le_bytes());
            }
        }
        other => {
            return Err(PlayerError::decode(format!("no PCM conversion to {other}")));
        }
    }
    Ok(())
}

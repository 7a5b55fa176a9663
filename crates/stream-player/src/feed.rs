//! Push-fed byte store exposed to Symphonia as a non-blocking [`MediaSource`].
//!
//! Symphonia pulls from a reader, while the pipeline pushes compressed bytes a chunk at a
//! time. [`FeedBuffer`] holds the pushed bytes; [`FeedSource`] is the reader half. When the
//! reader catches up with the pushed data before end of input it fails with
//! [`io::ErrorKind::WouldBlock`] rather than blocking the tick.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use symphonia::core::io::MediaSource;

/// Bytes already read are dropped once at least this many have accumulated.
const COMPACT_THRESHOLD: usize = 32 * 1024;

#[derive(Debug, Default)]
struct FeedState {
    data: Vec<u8>,
    /// Absolute stream offset of `data[0]`.
    base: u64,
    /// Absolute stream offset of the next byte handed to the reader.
    read_pos: u64,
    eof: bool,
    /// Keep bytes that were already read so a failed probe can start over.
    retain: bool,
}

impl FeedState {
    fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    fn compact(&mut self) {
        let consumed = (self.read_pos - self.base) as usize;
        if consumed >= COMPACT_THRESHOLD {
            self.data.drain(..consumed);
            self.base = self.read_pos;
        }
    }
}

/// Shared handle to the pushed bytes.
#[derive(Clone, Debug, Default)]
pub(crate) struct FeedBuffer {
    state: Arc<Mutex<FeedState>>,
}

impl FeedBuffer {
    pub(crate) fn new() -> Self {
        let buffer = Self::default();
        buffer.lock().retain = true;
        buffer
    }

    fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, bytes: &[u8]) {
        self.lock().data.extend_from_slice(bytes);
    }

    pub(crate) fn mark_eof(&self) {
        self.lock().eof = true;
    }

    pub(crate) fn is_eof(&self) -> bool {
        self.lock().eof
    }

    /// Bytes pushed but not yet handed to the reader.
    pub(crate) fn ahead(&self) -> usize {
        let g = self.lock();
        (g.end() - g.read_pos) as usize
    }

    /// Restart reading from the oldest retained byte.
    pub(crate) fn rewind_reader(&self) {
        let mut g = self.lock();
        g.read_pos = g.base;
    }

    /// Stop retaining consumed bytes.
    pub(crate) fn release(&self) {
        let mut g = self.lock();
        g.retain = false;
        g.compact();
    }

    /// Drop everything and expect the next pushed byte to sit at `position`.
    pub(crate) fn reset(&self, position: u64) {
        let mut g = self.lock();
        *g = FeedState {
            base: position,
            read_pos: position,
            retain: true,
            ..Default::default()
        };
    }

    pub(crate) fn source(&self) -> FeedSource {
        FeedSource {
            buffer: self.clone(),
        }
    }
}

/// Reader half handed to Symphonia.
pub(crate) struct FeedSource {
    buffer: FeedBuffer,
}

impl Read for FeedSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut g = self.buffer.lock();
        let offset = (g.read_pos - g.base) as usize;
        let available = g.data.len() - offset;
        if available == 0 {
            if g.eof {
                return Ok(0);
            }
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "no compressed bytes buffered",
            ));
        }
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&g.data[offset..offset + n]);
        g.read_pos += n as u64;
        if !g.retain {
            g.compact();
        }
        Ok(n)
    }
}

impl Seek for FeedSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let mut g = self.buffer.lock();
        let target = match pos {
            SeekFrom::Start(x) => Some(x),
            SeekFrom::Current(d) => g.read_pos.checked_add_signed(d),
            SeekFrom::End(_) => None,
        };
        match target {
            Some(t) if t >= g.base && t <= g.end() => {
                g.read_pos = t;
                Ok(t)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "seek outside buffered feed window",
            )),
        }
    }
}

impl MediaSource for FeedSource {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

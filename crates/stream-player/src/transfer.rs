//! Producer side: byte transfers feeding the ring.
//!
//! A [`ByteTransfer`] pushes bytes into a [`TransferSink`] and asks it, once per chunk,
//! whether to continue, hold off, or abort. The sink's answer is how flow control and user
//! quit reach the network layer.

use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::flow::FlowSignal;

/// Sink's answer to a progress callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferAction {
    Continue,
    /// Stop delivering bytes for now; ask again later.
    Pause,
    Abort,
}

/// How a transfer that did not fail ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferEnd {
    Completed,
    /// The sink asked to abort.
    Aborted,
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

pub trait TransferSink {
    /// Offer bytes; returns how many were accepted. Unaccepted bytes are offered again.
    fn on_data(&mut self, bytes: &[u8]) -> usize;

    /// Called once per chunk and while paused.
    fn on_progress(&mut self) -> TransferAction;
}

pub trait ByteTransfer {
    /// Deliver the whole source into `sink`.
    fn run(&mut self, sink: &mut dyn TransferSink) -> Result<TransferEnd, TransferError>;
}

impl<T: ByteTransfer + ?Sized> ByteTransfer for Box<T> {
    fn run(&mut self, sink: &mut dyn TransferSink) -> Result<TransferEnd, TransferError> {
        (**self).run(sink)
    }
}

/// Transfer over any blocking reader (HTTP body, file).
///
/// Bytes the sink refuses stay in the read buffer and are offered again before the next
/// read, so nothing is dropped or reordered.
pub struct ReaderTransfer<R> {
    reader: R,
    chunk: usize,
    idle: Duration,
    delivered: u64,
}

impl<R: Read> ReaderTransfer<R> {
    /// `chunk` bytes are read per call; `idle` is slept while paused or refused.
    pub fn new(reader: R, chunk: usize, idle: Duration) -> Self {
        Self {
            reader,
            chunk: chunk.max(1),
            idle,
            delivered: 0,
        }
    }

    /// Bytes accepted by the sink so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}

impl<R: Read> ByteTransfer for ReaderTransfer<R> {
    fn run(&mut self, sink: &mut dyn TransferSink) -> Result<TransferEnd, TransferError> {
        let mut buf = vec![0u8; self.chunk];
        let (mut start, mut end) = (0usize, 0usize);
        loop {
            match sink.on_progress() {
                TransferAction::Abort => {
                    tracing::debug!(delivered = self.delivered, "transfer aborted");
                    return Ok(TransferEnd::Aborted);
                }
                TransferAction::Pause => {
                    thread::sleep(self.idle);
                    continue;
                }
                TransferAction::Continue => {}
            }

            if start < end {
                let accepted = sink.on_data(&buf[start..end]).min(end - start);
                start += accepted;
                self.delivered += accepted as u64;
                if accepted == 0 {
                    thread::sleep(self.idle);
                }
                continue;
            }

            match self.reader.read(&mut buf) {
                Ok(0) => {
                    tracing::debug!(delivered = self.delivered, "transfer complete");
                    return Ok(TransferEnd::Completed);
                }
                Ok(n) => {
                    start = 0;
                    end = n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Pause and cancel flags shared between the consumer and a producer thread.
#[derive(Clone, Debug, Default)]
pub struct TransferControl {
    paused: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
}

impl TransferControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, signal: FlowSignal) {
        self.paused
            .store(signal == FlowSignal::Pause, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Progress answer for a producer obeying these flags.
    pub fn action(&self) -> TransferAction {
        if self.is_cancelled() {
            TransferAction::Abort
        } else if self.is_paused() {
            TransferAction::Pause
        } else {
            TransferAction::Continue
        }
    }
}

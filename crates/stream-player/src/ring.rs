//! Bounded circular byte store between the network producer and the decoder.
//!
//! [`RingBuffer`] is the single-threaded core with independent read/write cursors and an
//! explicit `full` flag (a bare `rd == wr` comparison cannot tell empty from full).
//! [`SharedRing`] wraps it in one mutex together with the byte counters the flow controller
//! reads, so the producer and consumer can live on different threads.
//!
//! Writes never overwrite unread bytes: a write into a full ring returns 0 and the producer
//! is expected to hold on to the remainder until the flow controller or the consumer frees
//! space.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Fixed-capacity circular byte buffer.
pub struct RingBuffer {
    data: Box<[u8]>,
    rd: usize,
    wr: usize,
    full: bool,
}

impl RingBuffer {
    /// Allocate a ring of `capacity` bytes. Panics on zero capacity.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            rd: 0,
            wr: 0,
            full: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Unread bytes between the read and write cursors.
    pub fn len(&self) -> usize {
        let cap = self.capacity();
        if self.rd == self.wr {
            if self.full { cap } else { 0 }
        } else {
            (self.wr + cap - self.rd) % cap
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.full && self.rd == self.wr
    }

    /// Free space available to the next write.
    pub fn free(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Copy as much of `src` as fits, wrapping past the end.
    ///
    /// Returns the number of bytes stored; a short count means the ring filled up.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let count = src.len().min(self.free());
        if count == 0 {
            return 0;
        }
        let cap = self.capacity();
        let tail = count.min(cap - self.wr);
        self.data[self.wr..self.wr + tail].copy_from_slice(&src[..tail]);
        let head = count - tail;
        self.data[..head].copy_from_slice(&src[tail..count]);

        self.wr = (self.wr + count) % cap;
        self.full = self.wr == self.rd;
        count
    }

    /// Copy up to `dest.len()` unread bytes out, never past the write cursor.
    pub fn read(&mut self, dest: &mut [u8]) -> usize {
        let count = dest.len().min(self.len());
        if count == 0 {
            return 0;
        }
        let cap = self.capacity();
        let tail = count.min(cap - self.rd);
        dest[..tail].copy_from_slice(&self.data[self.rd..self.rd + tail]);
        let head = count - tail;
        dest[tail..count].copy_from_slice(&self.data[..head]);

        self.rd = (self.rd + count) % cap;
        self.full = false;
        count
    }

    /// Move the read cursor to `offset`, clamped to `[0, capacity - 1]`.
    ///
    /// Leaves the write cursor and the `full` flag untouched.
    pub fn seek(&mut self, offset: usize) -> usize {
        self.rd = offset.min(self.capacity() - 1);
        self.rd
    }
}

/// Counters sampled by the flow controller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ByteCounters {
    /// Bytes accepted from the producer.
    pub received: u64,
    /// Bytes handed to the decoder.
    pub consumed: u64,
}

impl ByteCounters {
    /// Undrained producer output.
    pub fn gap(&self) -> u64 {
        self.received.saturating_sub(self.consumed)
    }
}

struct RingInner {
    ring: RingBuffer,
    counters: ByteCounters,
    closed: bool,
}

/// Thread-safe ring shared by one producer and one consumer.
///
/// A single mutex guards the cursors, the `full` flag, and the byte counters. A [`Condvar`]
/// wakes a producer waiting for space and a consumer waiting for data.
pub struct SharedRing {
    inner: Mutex<RingInner>,
    cv: Condvar,
}

impl SharedRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RingInner {
                ring: RingBuffer::new(capacity),
                counters: ByteCounters::default(),
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.lock().ring.capacity()
    }

    pub fn len(&self) -> usize {
        self.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock().ring.is_full()
    }

    /// Producer side: store as much of `src` as fits.
    pub fn write(&self, src: &[u8]) -> usize {
        let mut g = self.lock();
        let n = g.ring.write(src);
        g.counters.received += n as u64;
        drop(g);
        if n > 0 {
            self.cv.notify_all();
        }
        n
    }

    /// Consumer side: take up to `dest.len()` bytes in FIFO order.
    pub fn read(&self, dest: &mut [u8]) -> usize {
        let mut g = self.lock();
        let n = g.ring.read(dest);
        g.counters.consumed += n as u64;
        drop(g);
        if n > 0 {
            self.cv.notify_all();
        }
        n
    }

    /// Relocate the read cursor; the consumed counter follows so the gap keeps matching
    /// ring occupancy.
    pub fn seek(&self, offset: usize) -> usize {
        let mut g = self.lock();
        let applied = g.ring.seek(offset);
        let occupancy = g.ring.len() as u64;
        g.counters.consumed = g.counters.received.saturating_sub(occupancy);
        drop(g);
        self.cv.notify_all();
        applied
    }

    /// `true` while offset 0 still holds the first byte of the stream and the write cursor
    /// has not wrapped back onto it.
    pub fn holds_stream_start(&self) -> bool {
        let g = self.lock();
        g.counters.received < g.ring.capacity() as u64
    }

    pub fn counters(&self) -> ByteCounters {
        self.lock().counters
    }

    /// Mark the producer as finished. Buffered bytes stay readable.
    pub fn close(&self) {
        let mut g = self.lock();
        g.closed = true;
        drop(g);
        self.cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Producer finished and every byte has been read.
    pub fn is_drained(&self) -> bool {
        let g = self.lock();
        g.closed && g.ring.is_empty()
    }

    /// Block until the ring has free space, it is closed, or `timeout` elapses.
    ///
    /// Returns `true` if space is available.
    pub fn wait_for_space(&self, timeout: Duration) -> bool {
        let g = self.lock();
        if g.ring.free() > 0 || g.closed {
            return g.ring.free() > 0;
        }
        let (g, _timeout) = self
            .cv
            .wait_timeout(g, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        g.ring.free() > 0
    }

    /// Block until unread bytes exist, the ring is closed, or `timeout` elapses.
    ///
    /// Returns `true` if data is available.
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        let g = self.lock();
        if !g.ring.is_empty() || g.closed {
            return !g.ring.is_empty();
        }
        let (g, _timeout) = self
            .cv
            .wait_timeout(g, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        !g.ring.is_empty()
    }
}

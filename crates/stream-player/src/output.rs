//! Output priming and double-buffering.
//!
//! [`OutputQueue`] owns the fixed pool of device buffer handles and the carry block that
//! accumulates decoded PCM until one device buffer's worth is ready. Priming walks the pool
//! in rotation order; in steady state, handles come back from the device as it finishes
//! playing them and wait in a reclaimed pool until the carry block is full again.

use std::collections::VecDeque;

use crate::device::{AudioDevice, BufferId};
use crate::error::Result;

#[derive(Debug)]
pub struct OutputQueue {
    handles: Vec<BufferId>,
    /// Next handle to prime.
    rotation: usize,
    reclaimed: VecDeque<BufferId>,
    carry: Vec<u8>,
    /// Bytes of `carry` holding decoded PCM.
    offset: usize,
    submitted: u64,
}

impl OutputQueue {
    /// `block_bytes` must equal the device buffer size.
    pub fn new(handles: Vec<BufferId>, block_bytes: usize) -> Self {
        Self {
            handles,
            rotation: 0,
            reclaimed: VecDeque::new(),
            carry: vec![0; block_bytes.max(1)],
            offset: 0,
            submitted: 0,
        }
    }

    pub fn block_bytes(&self) -> usize {
        self.carry.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.handles.len()
    }

    /// Handles submitted during priming so far.
    pub fn primed(&self) -> usize {
        self.rotation
    }

    pub fn is_primed(&self) -> bool {
        self.rotation >= self.handles.len()
    }

    /// Unfilled tail of the carry block, for the decoder to write into.
    pub fn spare(&mut self) -> &mut [u8] {
        &mut self.carry[self.offset..]
    }

    /// Record that `n` bytes were written into [`spare`](Self::spare).
    pub fn commit(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.carry.len());
    }

    pub fn carried(&self) -> usize {
        self.offset
    }

    pub fn is_block_full(&self) -> bool {
        self.offset == self.carry.len()
    }

    /// Forget partially decoded output.
    pub fn clear_carry(&mut self) {
        self.offset = 0;
    }

    /// Return a handle the device finished with.
    pub fn reclaim(&mut self, id: BufferId) {
        self.reclaimed.push_back(id);
    }

    pub fn has_reclaimed(&self) -> bool {
        !self.reclaimed.is_empty()
    }

    /// Handles not currently owned by the device.
    pub fn idle_handles(&self) -> usize {
        self.reclaimed.len() + (self.handles.len() - self.rotation.min(self.handles.len()))
    }

    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    /// Submit the carry block to the next unprimed handle.
    ///
    /// Returns `false` if every handle is already primed or nothing is carried.
    pub fn submit_priming<A: AudioDevice + ?Sized>(&mut self, device: &mut A) -> Result<bool> {
        let Some(&id) = self.handles.get(self.rotation) else {
            return Ok(false);
        };
        if !self.submit_carry(device, id)? {
            return Ok(false);
        }
        self.rotation += 1;
        Ok(true)
    }

    /// Submit the carry block to the oldest reclaimed handle.
    ///
    /// Returns `false` if no handle is reclaimed or nothing is carried.
    pub fn submit_refill<A: AudioDevice + ?Sized>(&mut self, device: &mut A) -> Result<bool> {
        let Some(&id) = self.reclaimed.front() else {
            return Ok(false);
        };
        if !self.submit_carry(device, id)? {
            return Ok(false);
        }
        self.reclaimed.pop_front();
        Ok(true)
    }

    fn submit_carry<A: AudioDevice + ?Sized>(&mut self, device: &mut A, id: BufferId) -> Result<bool> {
        if self.offset == 0 {
            return Ok(false);
        }
        device.submit(id, &self.carry[..self.offset])?;
        tracing::trace!(buffer = id.0, bytes = self.offset, "buffer submitted");
        self.offset = 0;
        self.submitted += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDevice;

    fn queue(n: usize, block: usize) -> (OutputQueue, MockDevice) {
        let mut dev = MockDevice::new();
        let handles = dev.generate_buffers(n).unwrap();
        (OutputQueue::new(handles, block), dev)
    }

    #[test]
    fn carry_accumulates_partial_writes() {
        let (mut q, _dev) = queue(2, 8);
        q.spare()[..3].copy_from_slice(&[1, 2, 3]);
        q.commit(3);
        assert_eq!(q.spare().len(), 5);
        assert!(!q.is_block_full());
        q.spare().copy_from_slice(&[4, 5, 6, 7, 8]);
        q.commit(5);
        assert!(q.is_block_full());
        assert_eq!(q.carried(), 8);
    }

    #[test]
    fn commit_never_exceeds_block() {
        let (mut q, _dev) = queue(2, 4);
        q.commit(10);
        assert_eq!(q.carried(), 4);
    }

    #[test]
    fn priming_rotates_through_handles() {
        let (mut q, mut dev) = queue(3, 4);
        for round in 0..3u8 {
            q.spare().fill(round);
            q.commit(4);
            assert!(q.submit_priming(&mut dev).unwrap());
        }
        assert!(q.is_primed());
        q.commit(4);
        assert!(!q.submit_priming(&mut dev).unwrap());

        let ids: Vec<u32> = dev.submissions().iter().map(|(id, _)| id.0).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(dev.submissions()[2].1, vec![2; 4]);
        assert_eq!(q.submitted(), 3);
    }

    #[test]
    fn empty_carry_is_not_submitted() {
        let (mut q, mut dev) = queue(2, 4);
        assert!(!q.submit_priming(&mut dev).unwrap());
        assert!(dev.submissions().is_empty());
    }

    #[test]
    fn refill_uses_oldest_reclaimed_handle() {
        let (mut q, mut dev) = queue(2, 2);
        q.reclaim(BufferId(1));
        q.reclaim(BufferId(0));
        q.commit(2);
        assert!(q.submit_refill(&mut dev).unwrap());
        assert_eq!(dev.submissions()[0].0, BufferId(1));
        assert!(q.has_reclaimed());

        // Partial carry waits while the handle stays reclaimed.
        assert!(!q.submit_refill(&mut dev).unwrap());
        assert!(q.has_reclaimed());
    }

    #[test]
    fn idle_handles_counts_unprimed_and_reclaimed() {
        let (mut q, mut dev) = queue(3, 2);
        assert_eq!(q.idle_handles(), 3);
        q.commit(2);
        q.submit_priming(&mut dev).unwrap();
        assert_eq!(q.idle_handles(), 2);
        q.reclaim(BufferId(0));
        assert_eq!(q.idle_handles(), 3);
    }
}

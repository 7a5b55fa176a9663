//! Producer backpressure.
//!
//! The network usually delivers far faster than playback consumes. The controller watches
//! `received - consumed` and turns it into a binary pause/resume decision with a single
//! watermark. Signals are edge-triggered: repeated evaluations on the same side of the
//! watermark emit nothing.

use crate::ring::ByteCounters;

/// Instruction for the producer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowSignal {
    Pause,
    Resume,
}

#[derive(Debug)]
pub struct FlowController {
    max_gap: u64,
    paused: bool,
}

impl FlowController {
    pub fn new(max_gap: u64) -> Self {
        Self {
            max_gap,
            paused: false,
        }
    }

    pub fn max_gap(&self) -> u64 {
        self.max_gap
    }

    /// Whether the producer is currently held.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Evaluate the current counters and return a signal only on a state change.
    pub fn evaluate(&mut self, counters: ByteCounters) -> Option<FlowSignal> {
        let gap = counters.gap();
        if !self.paused && gap > self.max_gap {
            self.paused = true;
            tracing::debug!(gap, max_gap = self.max_gap, "producer paused");
            return Some(FlowSignal::Pause);
        }
        if self.paused && gap < self.max_gap {
            self.paused = false;
            tracing::debug!(gap, max_gap = self.max_gap, "producer resumed");
            return Some(FlowSignal::Resume);
        }
        None
    }

    /// Forget any pause, e.g. once the producer has finished.
    pub fn reset(&mut self) {
        self.paused = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(received: u64, consumed: u64) -> ByteCounters {
        ByteCounters { received, consumed }
    }

    #[test]
    fn below_watermark_emits_nothing() {
        let mut flow = FlowController::new(1000);
        assert_eq!(flow.evaluate(counters(500, 0)), None);
        assert_eq!(flow.evaluate(counters(1000, 0)), None);
        assert!(!flow.is_paused());
    }

    #[test]
    fn pause_is_issued_once_while_over_threshold() {
        let mut flow = FlowController::new(1000);
        assert_eq!(flow.evaluate(counters(1001, 0)), Some(FlowSignal::Pause));
        assert_eq!(flow.evaluate(counters(1500, 0)), None);
        assert_eq!(flow.evaluate(counters(2500, 100)), None);
        assert!(flow.is_paused());
    }

    #[test]
    fn resume_is_issued_once_after_catching_up() {
        let mut flow = FlowController::new(1000);
        flow.evaluate(counters(2000, 0));
        assert_eq!(flow.evaluate(counters(2000, 500)), None);
        assert_eq!(flow.evaluate(counters(2000, 1500)), Some(FlowSignal::Resume));
        assert_eq!(flow.evaluate(counters(2000, 1800)), None);
        assert!(!flow.is_paused());
    }

    #[test]
    fn cycles_between_pause_and_resume() {
        let mut flow = FlowController::new(10);
        let signals: Vec<_> = [(20, 0), (20, 15), (40, 15), (40, 39)]
            .iter()
            .filter_map(|&(r, c)| flow.evaluate(counters(r, c)))
            .collect();
        assert_eq!(
            signals,
            vec![
                FlowSignal::Pause,
                FlowSignal::Resume,
                FlowSignal::Pause,
                FlowSignal::Resume
            ]
        );
    }

    #[test]
    fn consumed_ahead_of_received_counts_as_no_gap() {
        let mut flow = FlowController::new(10);
        assert_eq!(flow.evaluate(counters(5, 50)), None);
    }

    #[test]
    fn reset_clears_pause() {
        let mut flow = FlowController::new(10);
        flow.evaluate(counters(100, 0));
        flow.reset();
        assert!(!flow.is_paused());
    }
}

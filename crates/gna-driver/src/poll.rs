//! Bounded register polling.
//!
//! Abort confirmation and D0i3 transitions wait on self-clearing register
//! bits. The wait is always a fixed number of probes with a short pause in
//! between; running out of probes is reported to the caller, never spun on.

use crate::mmio::RegisterInterface;
use std::time::Duration;

/// Probe budget for a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Probes before giving up
    pub max_attempts: u32,
    /// Pause between probes (`Duration::ZERO` yields the thread instead)
    pub pause: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1_000,
            pause: Duration::from_micros(10),
        }
    }
}

impl PollPolicy {
    /// Create a policy
    pub const fn new(max_attempts: u32, pause: Duration) -> Self {
        Self {
            max_attempts,
            pause,
        }
    }

    /// Probe until `done` returns true.
    ///
    /// Returns the number of probes taken, or `None` when the budget ran out.
    pub fn until(&self, mut done: impl FnMut() -> bool) -> Option<u32> {
        for attempt in 1..=self.max_attempts {
            if done() {
                return Some(attempt);
            }
            if attempt < self.max_attempts {
                self.wait();
            }
        }
        None
    }

    /// Probe `reg` until every bit of `mask` reads as clear.
    pub fn until_clear(&self, regs: &dyn RegisterInterface, reg: usize, mask: u32) -> Option<u32> {
        self.until(|| regs.read32(reg) & mask == 0)
    }

    fn wait(&self) {
        if self.pause.is_zero() {
            std::thread::yield_now();
        } else {
            std::thread::sleep(self.pause);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn stops_on_first_success() {
        let probes = Cell::new(0);
        let policy = PollPolicy::new(10, Duration::ZERO);
        let taken = policy.until(|| {
            probes.set(probes.get() + 1);
            probes.get() == 4
        });
        assert_eq!(taken, Some(4));
        assert_eq!(probes.get(), 4);
    }

    #[test]
    fn gives_up_after_budget() {
        let probes = Cell::new(0);
        let policy = PollPolicy::new(5, Duration::ZERO);
        let taken = policy.until(|| {
            probes.set(probes.get() + 1);
            false
        });
        assert_eq!(taken, None);
        assert_eq!(probes.get(), 5);
    }

    #[test]
    fn zero_budget_never_probes() {
        let policy = PollPolicy::new(0, Duration::ZERO);
        assert_eq!(policy.until(|| true), None);
    }
}

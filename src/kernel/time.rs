//! Kernel tick handling: the monotonic clock, delays, wait timeouts and
//! round-robin time slicing.

use crate::kernel::error::{KernelError, KernelResult};
use crate::kernel::memory::MemoryProvider;
use crate::kernel::scheduler::{Dispatcher, RescheduleReason};
use crate::kernel::thread::{BlockReason, ThreadState};
use crate::kernel::{ThreadManager, WaitOutcome};

/// Timeout value that never expires.
pub const WAIT_FOREVER: u32 = u32::MAX;

/// Furthest a `delay_until` deadline may lie ahead of the current tick.
pub const MAX_DELAY_TICKS: u64 = 0x7FFF_FFFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonotonicTimestamp {
    ticks: u64,
    frequency_hz: u64,
}

impl MonotonicTimestamp {
    pub const fn new(ticks: u64, frequency_hz: u64) -> Self {
        Self {
            ticks,
            frequency_hz,
        }
    }

    pub const fn ticks(&self) -> u64 {
        self.ticks
    }

    pub const fn frequency(&self) -> u64 {
        self.frequency_hz
    }

    pub fn as_millis(&self) -> u128 {
        if self.frequency_hz == 0 {
            return 0;
        }
        (self.ticks as u128 * 1_000u128) / self.frequency_hz as u128
    }

    pub fn as_micros(&self) -> u128 {
        if self.frequency_hz == 0 {
            return 0;
        }
        (self.ticks as u128 * 1_000_000u128) / self.frequency_hz as u128
    }
}

impl<const MAX: usize, M: MemoryProvider, D: Dispatcher> ThreadManager<MAX, M, D> {
    pub fn now(&self) -> MonotonicTimestamp {
        MonotonicTimestamp::new(self.clock, u64::from(self.config.tick_frequency_hz))
    }

    /// Earliest tick at which a pending wait expires, for tickless ports
    /// that program a one-shot timer instead of ticking periodically.
    pub fn next_wakeup(&self) -> Option<u64> {
        self.threads
            .iter()
            .flatten()
            .filter_map(|tcb| tcb.wake_at)
            .min()
    }

    /// Advances the clock by one tick: expires timeouts, then rotates the
    /// running thread behind its peers once its time slice is used up.
    pub fn tick(&mut self) -> MonotonicTimestamp {
        self.clock = self.clock.wrapping_add(1);
        self.core.account_tick();
        let now = self.clock;

        if let Some(id) = self.core.running() {
            if let Some(tcb) = self.slot_mut(id) {
                tcb.accumulate_cpu_time(1);
            }
        }

        let mut idx = 0;
        while idx < MAX {
            let expired = self.threads[idx]
                .as_ref()
                .filter(|tcb| tcb.wake_at.is_some_and(|at| at <= now))
                .map(|tcb| {
                    let result = match tcb.block {
                        Some(BlockReason::Delay) => Ok(0),
                        _ => Err(KernelError::Timeout),
                    };
                    (tcb.id, result)
                });
            if let Some((id, result)) = expired {
                self.wake(id, result);
            }
            idx += 1;
        }

        if self.config.time_slicing() {
            self.rotate_time_slice();
        }

        self.reschedule();
        self.now()
    }

    /// Blocks the calling thread for `ticks` ticks.
    pub fn delay(&mut self, ticks: u32) -> KernelResult<WaitOutcome<()>> {
        if self.core.in_isr() {
            return Err(KernelError::Isr);
        }
        if ticks == 0 {
            return Ok(WaitOutcome::Complete(()));
        }
        self.block_current(BlockReason::Delay, ticks)?;
        Ok(WaitOutcome::Blocked)
    }

    /// Blocks the calling thread until the clock reaches `deadline`.
    pub fn delay_until(&mut self, deadline: u64) -> KernelResult<WaitOutcome<()>> {
        if self.core.in_isr() {
            return Err(KernelError::Isr);
        }
        let ahead = deadline.wrapping_sub(self.clock);
        if deadline <= self.clock || ahead > MAX_DELAY_TICKS {
            return Err(KernelError::Parameter);
        }
        self.block_current(BlockReason::Delay, ahead as u32)?;
        Ok(WaitOutcome::Blocked)
    }

    fn rotate_time_slice(&mut self) {
        let Some(id) = self.core.running() else {
            return;
        };
        let timeout = self.config.round_robin_timeout;
        let Some(tcb) = self.slot_mut(id) else {
            return;
        };
        if tcb.state != ThreadState::Running {
            return;
        }
        tcb.slice_remaining = tcb.slice_remaining.saturating_sub(1);
        if tcb.slice_remaining > 0 {
            return;
        }
        tcb.slice_remaining = timeout;
        let priority = tcb.priority;
        if self.ready.has_peer(priority) {
            log::trace!("time slice of thread {} expired", id);
            self.make_ready(id, RescheduleReason::Ticked);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_conversions() {
        let stamp = MonotonicTimestamp::new(1500, 1000);
        assert_eq!(stamp.as_millis(), 1500);
        assert_eq!(stamp.as_micros(), 1_500_000);
        assert_eq!(MonotonicTimestamp::new(10, 0).as_millis(), 0);
    }
}

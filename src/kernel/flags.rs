//! Per-thread event flags.
//!
//! Each thread owns 31 flag bits. Any context, interrupt handlers included,
//! may set them; only the owning thread waits on or clears them.

use bitflags::bitflags;

use crate::kernel::error::{KernelError, KernelResult};
use crate::kernel::memory::MemoryProvider;
use crate::kernel::scheduler::Dispatcher;
use crate::kernel::thread::{BlockReason, ThreadId};
use crate::kernel::{ThreadManager, WaitOutcome};

/// Bits usable as thread flags; the top bit is reserved for error codes.
pub const THREAD_FLAGS_MASK: u32 = 0x7FFF_FFFF;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    /// How a flag wait is satisfied and whether it consumes the flags.
    pub struct FlagsOptions: u32 {
        /// Any of the requested flags.
        const WAIT_ANY = 0x0;
        /// All of the requested flags.
        const WAIT_ALL = 0x1;
        /// Leave the matched flags set.
        const NO_CLEAR = 0x2;
    }
}

fn matched(flags: u32, mask: u32, options: FlagsOptions) -> bool {
    if options.contains(FlagsOptions::WAIT_ALL) {
        flags & mask == mask
    } else {
        flags & mask != 0
    }
}

fn consume(flags: &mut u32, mask: u32, options: FlagsOptions) {
    if !options.contains(FlagsOptions::NO_CLEAR) {
        *flags &= !mask;
    }
}

impl<const MAX: usize, M: MemoryProvider, D: Dispatcher> ThreadManager<MAX, M, D> {
    /// Sets `flags` on `id` and releases it if it was waiting for them.
    /// Returns the flags left after a released waiter consumed its share.
    pub fn flags_set(&mut self, id: ThreadId, flags: u32) -> KernelResult<u32> {
        if flags & !THREAD_FLAGS_MASK != 0 {
            return Err(KernelError::Parameter);
        }
        let tcb = self.lookup_mut(id)?;
        if !tcb.state.is_active() {
            return Err(KernelError::Resource);
        }
        tcb.flags |= flags;

        let Some(BlockReason::Flags { mask, options }) = tcb.block else {
            return Ok(tcb.flags);
        };
        if !matched(tcb.flags, mask, options) {
            return Ok(tcb.flags);
        }
        let observed = tcb.flags;
        consume(&mut tcb.flags, mask, options);
        let remaining = tcb.flags;
        self.wake(id, Ok(observed));
        self.reschedule();
        Ok(remaining)
    }

    /// Clears `flags` on the calling thread, returning the flags before.
    pub fn flags_clear(&mut self, flags: u32) -> KernelResult<u32> {
        if self.core.in_isr() {
            return Err(KernelError::Isr);
        }
        if flags & !THREAD_FLAGS_MASK != 0 {
            return Err(KernelError::Parameter);
        }
        let id = self.core.running().ok_or(KernelError::Resource)?;
        let tcb = self.slot_mut(id).ok_or(KernelError::Resource)?;
        let previous = tcb.flags;
        tcb.flags &= !flags;
        Ok(previous)
    }

    /// Flags of the calling thread; 0 from interrupt context.
    pub fn flags_get(&self) -> u32 {
        if self.core.in_isr() {
            return 0;
        }
        self.core
            .running()
            .and_then(|id| self.slot(id))
            .map_or(0, |tcb| tcb.flags)
    }

    /// Waits until the calling thread's flags satisfy `mask` under `options`.
    ///
    /// Completes at once with the flags as they were before clearing when
    /// already satisfied. With a zero `timeout` an unsatisfied wait fails
    /// with [`KernelError::Resource`] instead of blocking.
    pub fn flags_wait(
        &mut self,
        mask: u32,
        options: FlagsOptions,
        timeout: u32,
    ) -> KernelResult<WaitOutcome<u32>> {
        if self.core.in_isr() {
            return Err(KernelError::Isr);
        }
        if mask & !THREAD_FLAGS_MASK != 0 {
            return Err(KernelError::Parameter);
        }
        let id = self.core.running().ok_or(KernelError::Resource)?;
        let tcb = self.slot_mut(id).ok_or(KernelError::Resource)?;
        if matched(tcb.flags, mask, options) {
            let observed = tcb.flags;
            consume(&mut tcb.flags, mask, options);
            return Ok(WaitOutcome::Complete(observed));
        }
        if timeout == 0 {
            return Err(KernelError::Resource);
        }
        self.block_current(BlockReason::Flags { mask, options }, timeout)?;
        Ok(WaitOutcome::Blocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_any_and_wait_all() {
        assert!(matched(0b0110, 0b0010, FlagsOptions::WAIT_ANY));
        assert!(!matched(0b0110, 0b1001, FlagsOptions::WAIT_ANY));
        assert!(matched(0b0111, 0b0101, FlagsOptions::WAIT_ALL));
        assert!(!matched(0b0110, 0b0101, FlagsOptions::WAIT_ALL));
    }

    #[test]
    fn no_clear_keeps_flags() {
        let mut flags = 0b1111;
        consume(&mut flags, 0b0011, FlagsOptions::NO_CLEAR);
        assert_eq!(flags, 0b1111);
        consume(&mut flags, 0b0011, FlagsOptions::WAIT_ALL);
        assert_eq!(flags, 0b1100);
    }
}

//! Thread control structures for the thread manager.

use bitflags::bitflags;

use crate::kernel::error::KernelResult;
use crate::kernel::flags::FlagsOptions;
use crate::kernel::memory::{CallerRegion, Region};
use crate::kernel::priority::ThreadPriority;

/// Entry function of a thread. Returning from it is an implicit exit.
pub type ThreadEntry = fn(usize);

/// Generation-tagged handle: the slot index in the thread table plus the
/// generation of the thread that occupied it. A handle to a reclaimed thread
/// keeps its old generation and is therefore rejected rather than aliased.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ThreadId {
    index: u16,
    generation: u32,
}

impl ThreadId {
    pub const fn new(index: u16, generation: u32) -> Self {
        Self { index, generation }
    }

    pub const fn index(&self) -> usize {
        self.index as usize
    }

    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Packed form for ports that pass handles as a single word. Zero is
    /// never a valid handle because generations start at one.
    pub const fn raw(&self) -> u64 {
        ((self.generation as u64) << 16) | self.index as u64
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u16,
            generation: (raw >> 16) as u32,
        }
    }
}

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Inactive,
    Ready,
    Running,
    Blocked,
    Terminated,
    /// Returned by lookups on an invalid handle or from interrupt context.
    Error,
}

impl ThreadState {
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            ThreadState::Ready | ThreadState::Running | ThreadState::Blocked
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum JoinMode {
    Joinable,
    #[default]
    Detached,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Privilege {
    #[default]
    Default,
    Privileged,
    Unprivileged,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    /// Creation-time attribute bits.
    pub struct ThreadAttrBits: u32 {
        /// Keep the thread around after it terminates until it is joined.
        const JOINABLE = 0x01;
        const UNPRIVILEGED = 0x02;
        const PRIVILEGED = 0x04;
    }
}

/// Optional creation parameters. Everything left at its default is chosen by
/// the kernel: a Normal priority, detached mode and kernel-managed memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadAttributes {
    pub name: Option<&'static str>,
    pub attr_bits: ThreadAttrBits,
    pub priority: ThreadPriority,
    /// Caller-supplied stack; `None` lets the kernel allocate one.
    pub stack: Option<CallerRegion>,
    /// Requested stack size; zero picks the configured default, and with a
    /// caller stack it must be zero or equal to the region length.
    pub stack_size: usize,
    /// Caller-supplied control-block memory.
    pub control_block: Option<CallerRegion>,
}

impl ThreadAttributes {
    pub const fn new() -> Self {
        Self {
            name: None,
            attr_bits: ThreadAttrBits::empty(),
            priority: ThreadPriority::NONE,
            stack: None,
            stack_size: 0,
            control_block: None,
        }
    }

    pub const fn with_name(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    pub const fn with_priority(mut self, priority: ThreadPriority) -> Self {
        self.priority = priority;
        self
    }

    pub const fn with_attr_bits(mut self, bits: ThreadAttrBits) -> Self {
        self.attr_bits = bits;
        self
    }

    pub const fn joinable(self) -> Self {
        self.with_attr_bits(self.attr_bits.union(ThreadAttrBits::JOINABLE))
    }

    pub const fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub const fn with_stack(mut self, stack: CallerRegion) -> Self {
        self.stack = Some(stack);
        self
    }

    pub const fn with_control_block(mut self, memory: CallerRegion) -> Self {
        self.control_block = Some(memory);
        self
    }

    pub const fn join_mode(&self) -> JoinMode {
        if self.attr_bits.contains(ThreadAttrBits::JOINABLE) {
            JoinMode::Joinable
        } else {
            JoinMode::Detached
        }
    }
}

impl Default for ThreadAttributes {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a thread is waiting, independent of an explicit suspension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockReason {
    Delay,
    Join(ThreadId),
    Flags { mask: u32, options: FlagsOptions },
}

#[derive(Clone, Copy, Debug)]
pub struct ThreadControlBlock {
    pub id: ThreadId,
    pub name: Option<&'static str>,
    pub priority: ThreadPriority,
    pub state: ThreadState,
    pub join_mode: JoinMode,
    pub privilege: Privilege,
    pub entry: ThreadEntry,
    pub argument: usize,
    pub stack: Region,
    /// Caller memory reserved for this thread's control block, if any.
    pub control_block: Option<CallerRegion>,
    pub block: Option<BlockReason>,
    pub suspended: bool,
    /// Absolute tick at which the current wait expires.
    pub wake_at: Option<u64>,
    /// Result of the last completed wait, collected by the thread once it runs.
    pub wait_result: Option<KernelResult<u32>>,
    /// Thread blocked in a join on this one.
    pub joiner: Option<ThreadId>,
    pub flags: u32,
    pub slice_remaining: u32,
    pub dispatched: bool,
    pub stack_overflowed: bool,
    pub cpu_ticks: u64,
}

impl ThreadControlBlock {
    #[allow(clippy::too_many_arguments)]
    pub const fn new(
        id: ThreadId,
        entry: ThreadEntry,
        argument: usize,
        priority: ThreadPriority,
        join_mode: JoinMode,
        privilege: Privilege,
        stack: Region,
        control_block: Option<CallerRegion>,
    ) -> Self {
        Self {
            id,
            name: None,
            priority,
            state: ThreadState::Ready,
            join_mode,
            privilege,
            entry,
            argument,
            stack,
            control_block,
            block: None,
            suspended: false,
            wake_at: None,
            wait_result: None,
            joiner: None,
            flags: 0,
            slice_remaining: 0,
            dispatched: false,
            stack_overflowed: false,
            cpu_ticks: 0,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = ThreadState::Running;
    }

    pub fn mark_ready(&mut self) {
        self.state = ThreadState::Ready;
    }

    pub fn block_on(&mut self, reason: BlockReason, wake_at: Option<u64>) {
        self.block = Some(reason);
        self.wake_at = wake_at;
        self.wait_result = None;
        self.state = ThreadState::Blocked;
    }

    /// Completes the pending wait. Returns `true` when nothing else keeps the
    /// thread blocked and it should be made ready.
    pub fn complete_wait(&mut self, result: KernelResult<u32>) -> bool {
        self.block = None;
        self.wake_at = None;
        self.wait_result = Some(result);
        !self.suspended
    }

    pub fn is_waiting(&self) -> bool {
        self.block.is_some()
    }

    pub fn terminate(&mut self) {
        self.state = ThreadState::Terminated;
        self.block = None;
        self.suspended = false;
        self.wake_at = None;
    }

    pub fn accumulate_cpu_time(&mut self, ticks: u64) {
        self.cpu_ticks = self.cpu_ticks.saturating_add(ticks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::memory::Allocation;

    fn idle(_: usize) {}

    fn control_block() -> ThreadControlBlock {
        ThreadControlBlock::new(
            ThreadId::new(3, 1),
            idle,
            0,
            ThreadPriority::NORMAL,
            JoinMode::Joinable,
            Privilege::Default,
            Region::Kernel(Allocation::new(0, 256)),
            None,
        )
    }

    #[test]
    fn raw_handle_round_trips_and_is_never_zero() {
        let id = ThreadId::new(7, 42);
        assert_eq!(ThreadId::from_raw(id.raw()), id);
        assert_ne!(ThreadId::new(0, 1).raw(), 0);

        let late = ThreadId::new(3, u32::from(u16::MAX) + 5);
        assert_eq!(ThreadId::from_raw(late.raw()), late);
    }

    #[test]
    fn attributes_default_to_detached_normal() {
        let attr = ThreadAttributes::new();
        assert_eq!(attr.join_mode(), JoinMode::Detached);
        assert_eq!(attr.priority, ThreadPriority::NONE);
        assert_eq!(attr.joinable().join_mode(), JoinMode::Joinable);
        assert_eq!(ThreadAttributes::default(), attr);
    }

    #[test]
    fn suspension_holds_thread_after_wait_completes() {
        let mut tcb = control_block();
        tcb.block_on(BlockReason::Delay, Some(10));
        tcb.suspended = true;
        assert!(!tcb.complete_wait(Ok(0)));
        assert!(!tcb.is_waiting());
        assert_eq!(tcb.wait_result, Some(Ok(0)));
        assert_eq!(tcb.state, ThreadState::Blocked);
    }

    #[test]
    fn terminate_clears_wait_bookkeeping() {
        let mut tcb = control_block();
        tcb.block_on(BlockReason::Join(ThreadId::new(1, 1)), None);
        tcb.suspended = true;
        tcb.terminate();
        assert_eq!(tcb.state, ThreadState::Terminated);
        assert!(tcb.block.is_none());
        assert!(!tcb.suspended);
        assert!(!tcb.state.is_active());
    }
}

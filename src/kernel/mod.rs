//! Thread lifecycle manager: the thread table, the ready queue and every
//! creation, control, termination and introspection call.
//!
//! All calls are made on behalf of the thread that currently owns the core
//! (see [`ThreadManager::current`]). A call that would block that thread
//! returns [`WaitOutcome::Blocked`] after handing the core to the next ready
//! thread; the result of the wait is collected with
//! [`ThreadManager::take_wait_result`] once the thread runs again.

pub mod config;
pub mod cpu;
pub mod error;
pub mod flags;
pub mod memory;
pub mod priority;
pub mod scheduler;
pub mod sync;
pub mod thread;
pub mod time;


use crate::kernel::config::KernelConfig;
use crate::kernel::cpu::CoreState;
use crate::kernel::error::{KernelError, KernelResult};
use crate::kernel::memory::{
    prepare_stack, stack_headroom, stack_magic_intact, MemoryProvider, Region, MAX_STACK_SIZE,
    MIN_STACK_SIZE, STACK_ALIGN,
};
use crate::kernel::priority::ThreadPriority;
use crate::kernel::scheduler::{Dispatch, Dispatcher, NoDispatch, ReadyQueue, RescheduleReason};
use crate::kernel::thread::{
    BlockReason, JoinMode, Privilege, ThreadAttrBits, ThreadAttributes, ThreadControlBlock,
    ThreadEntry, ThreadId, ThreadState,
};
use crate::kernel::time::WAIT_FOREVER;

pub const MAX_THREADS: usize = 32;

/// Bytes a caller-supplied control block must provide. The region is held
/// for the thread's lifetime and never written; the control block itself
/// lives in the thread table.
pub const CONTROL_BLOCK_SIZE: usize = core::mem::size_of::<ThreadControlBlock>();
pub const CONTROL_BLOCK_ALIGN: usize = core::mem::align_of::<ThreadControlBlock>();

/// Result of a call that may suspend the calling thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Complete(T),
    /// The caller is now blocked; its result arrives through
    /// [`ThreadManager::take_wait_result`].
    Blocked,
}

impl<T> WaitOutcome<T> {
    pub const fn is_blocked(&self) -> bool {
        matches!(self, WaitOutcome::Blocked)
    }
}

pub struct ThreadManager<const MAX: usize, M: MemoryProvider, D: Dispatcher = NoDispatch> {
    threads: [Option<ThreadControlBlock>; MAX],
    generations: [u32; MAX],
    ready: ReadyQueue<MAX>,
    core: CoreState,
    switch_pending: bool,
    clock: u64,
    memory: M,
    dispatcher: D,
    config: KernelConfig,
}

impl<const MAX: usize, M: MemoryProvider, D: Dispatcher> ThreadManager<MAX, M, D> {
    pub const fn new(memory: M, dispatcher: D, config: KernelConfig) -> Self {
        assert!(MAX <= u16::MAX as usize, "thread table index must fit a handle");
        Self {
            threads: [None; MAX],
            generations: [1; MAX],
            ready: ReadyQueue::new(),
            core: CoreState::new(),
            switch_pending: false,
            clock: 0,
            memory,
            dispatcher,
            config,
        }
    }

    pub const fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub const fn core(&self) -> &CoreState {
        &self.core
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut D {
        &mut self.dispatcher
    }

    /// Starts scheduling: the most urgent thread created so far gets the core.
    pub fn start(&mut self) -> KernelResult<()> {
        if self.core.in_isr() {
            return Err(KernelError::Isr);
        }
        if self.core.started() {
            return Err(KernelError::Resource);
        }
        self.core.start();
        log::debug!("kernel started with {} ready threads", self.ready.len());
        self.reschedule();
        Ok(())
    }

    pub fn enter_isr(&mut self) {
        self.core.irq_enter();
    }

    /// Leaves interrupt context; a switch requested by the handler happens
    /// once the outermost handler returns.
    pub fn exit_isr(&mut self) {
        self.core.irq_exit();
        if !self.core.in_isr() && self.switch_pending {
            self.switch_pending = false;
            self.reschedule();
        }
    }

    pub fn in_isr(&self) -> bool {
        self.core.in_isr()
    }

    /// Runs `handler` as an interrupt service routine.
    pub fn interrupt<R>(&mut self, handler: impl FnOnce(&mut Self) -> R) -> R {
        self.enter_isr();
        let result = handler(self);
        self.exit_isr();
        result
    }

    /// Creates a thread running `entry(argument)`.
    ///
    /// The new thread preempts the caller only when it is strictly more
    /// urgent. Kernel-managed memory that was already reserved is returned
    /// when a later step fails.
    pub fn spawn(
        &mut self,
        entry: ThreadEntry,
        argument: usize,
        attributes: Option<&ThreadAttributes>,
    ) -> KernelResult<ThreadId> {
        if self.core.in_isr() {
            log::warn!("thread creation rejected in interrupt context");
            return Err(KernelError::Isr);
        }
        let attr = attributes.copied().unwrap_or_else(ThreadAttributes::new);

        let priority = if attr.priority == ThreadPriority::NONE {
            ThreadPriority::NORMAL
        } else if attr.priority.is_valid_for_thread() {
            attr.priority
        } else {
            log::warn!("thread creation rejected: invalid priority {}", attr.priority.raw());
            return Err(KernelError::Parameter);
        };
        let privilege = privilege_from_bits(attr.attr_bits)?;
        let stack_size = self.validate_memory(&attr)?;

        let slot = self.free_slot().ok_or_else(|| {
            log::warn!("thread creation rejected: thread table full");
            KernelError::NoMemory
        })?;

        let mut stack = match attr.stack {
            Some(region) => Region::Caller(region),
            None => match self.memory.allocate(stack_size, STACK_ALIGN) {
                Some(allocation) => Region::Kernel(allocation),
                None => {
                    log::error!("no memory for a {} byte stack", stack_size);
                    return Err(KernelError::NoMemory);
                }
            },
        };
        prepare_stack(
            stack.bytes_mut(&mut self.memory),
            self.config.stack_watermark,
        );

        let id = ThreadId::new(slot as u16, self.generations[slot]);
        if self
            .ready
            .insert(id, priority, RescheduleReason::Started)
            .is_err()
        {
            stack.release(&mut self.memory);
            return Err(KernelError::Generic);
        }

        let mut tcb = ThreadControlBlock::new(
            id,
            entry,
            argument,
            priority,
            attr.join_mode(),
            privilege,
            stack,
            attr.control_block,
        );
        tcb.name = attr.name;
        self.threads[slot] = Some(tcb);
        log::debug!(
            "thread {} ({}) created at priority {}",
            id,
            attr.name.unwrap_or("unnamed"),
            priority
        );

        self.reschedule();
        Ok(id)
    }

    pub fn set_priority(&mut self, id: ThreadId, priority: ThreadPriority) -> KernelResult<()> {
        if self.core.in_isr() {
            return Err(KernelError::Isr);
        }
        if !priority.is_valid_for_thread() {
            return Err(KernelError::Parameter);
        }
        let tcb = self.lookup_mut(id)?;
        if !tcb.state.is_active() {
            return Err(KernelError::Resource);
        }
        if tcb.priority == priority {
            return Ok(());
        }
        tcb.priority = priority;
        if tcb.state == ThreadState::Ready {
            self.ready.remove(id);
            self.make_ready(id, RescheduleReason::Woken);
        }
        self.reschedule();
        Ok(())
    }

    /// Priority of an active thread, or [`ThreadPriority::ERROR`].
    pub fn priority(&self, id: ThreadId) -> ThreadPriority {
        if self.core.in_isr() {
            return ThreadPriority::ERROR;
        }
        self.slot(id)
            .filter(|tcb| tcb.state.is_active())
            .map_or(ThreadPriority::ERROR, |tcb| tcb.priority)
    }

    /// Hands the core to the next ready thread of the caller's priority, if any.
    pub fn yield_now(&mut self) -> KernelResult<()> {
        if self.core.in_isr() {
            return Err(KernelError::Isr);
        }
        let id = self.core.running().ok_or(KernelError::Resource)?;
        let priority = self.slot(id).ok_or(KernelError::Resource)?.priority;
        if !self.ready.has_peer(priority) {
            return Ok(());
        }
        self.make_ready(id, RescheduleReason::Yielded);
        self.reschedule();
        Ok(())
    }

    /// Blocks `id` until [`ThreadManager::resume`]. A thread already waiting
    /// for something else stays blocked until both the wait completes and it
    /// is resumed.
    pub fn suspend(&mut self, id: ThreadId) -> KernelResult<()> {
        if self.core.in_isr() {
            return Err(KernelError::Isr);
        }
        let tcb = self.lookup_mut(id)?;
        if !tcb.state.is_active() {
            return Err(KernelError::Resource);
        }
        if tcb.suspended {
            return Ok(());
        }
        let previous = tcb.state;
        tcb.suspended = true;
        tcb.state = ThreadState::Blocked;
        log::debug!("thread {} suspended", id);
        match previous {
            ThreadState::Ready => {
                self.ready.remove(id);
            }
            ThreadState::Running => self.reschedule(),
            _ => {}
        }
        Ok(())
    }

    /// Lifts a suspension. Only a suspended thread can be resumed; any other
    /// wait it is in must still complete on its own.
    pub fn resume(&mut self, id: ThreadId) -> KernelResult<()> {
        if self.core.in_isr() {
            return Err(KernelError::Isr);
        }
        let tcb = self.lookup_mut(id)?;
        if !tcb.suspended {
            return Err(KernelError::Resource);
        }
        tcb.suspended = false;
        log::debug!("thread {} resumed", id);
        if tcb.is_waiting() {
            return Ok(());
        }
        self.make_ready(id, RescheduleReason::Woken);
        self.reschedule();
        Ok(())
    }

    /// Makes `id` detached. Detaching a detached thread is a no-op; detaching
    /// a terminated joinable thread reclaims it.
    pub fn detach(&mut self, id: ThreadId) -> KernelResult<()> {
        if self.core.in_isr() {
            return Err(KernelError::Isr);
        }
        let tcb = self.lookup_mut(id)?;
        if tcb.join_mode == JoinMode::Detached {
            return Ok(());
        }
        if tcb.joiner.is_some() {
            return Err(KernelError::Resource);
        }
        tcb.join_mode = JoinMode::Detached;
        if tcb.state == ThreadState::Terminated {
            self.reclaim(id);
        }
        Ok(())
    }

    /// Waits for a joinable thread to terminate and reclaims it.
    pub fn join(&mut self, id: ThreadId) -> KernelResult<WaitOutcome<()>> {
        if self.core.in_isr() {
            return Err(KernelError::Isr);
        }
        let target = self.lookup(id)?;
        if target.join_mode == JoinMode::Detached {
            return Err(KernelError::Resource);
        }
        if target.state == ThreadState::Terminated {
            self.reclaim(id);
            return Ok(WaitOutcome::Complete(()));
        }
        let caller = self.core.running().ok_or(KernelError::Resource)?;
        if caller == id || target.joiner.is_some() {
            return Err(KernelError::Resource);
        }
        if let Some(target) = self.slot_mut(id) {
            target.joiner = Some(caller);
        }
        self.block_current(BlockReason::Join(id), WAIT_FOREVER)?;
        Ok(WaitOutcome::Blocked)
    }

    /// Terminates the calling thread. Returning from an entry function is
    /// equivalent, so ports call this when `entry` returns.
    pub fn exit(&mut self) -> KernelResult<()> {
        if self.core.in_isr() {
            return Err(KernelError::Isr);
        }
        let id = self.core.running().ok_or(KernelError::Resource)?;
        self.finish(id);
        self.reschedule();
        Ok(())
    }

    /// Stops `id` immediately, wherever it is. Its stack is discarded without
    /// unwinding.
    pub fn terminate(&mut self, id: ThreadId) -> KernelResult<()> {
        if self.core.in_isr() {
            return Err(KernelError::Isr);
        }
        let tcb = self.lookup(id)?;
        if !tcb.state.is_active() {
            return Err(KernelError::Resource);
        }
        self.finish(id);
        self.reschedule();
        Ok(())
    }

    /// The thread owning the core. Also answers from interrupt context, where
    /// it names the interrupted thread.
    pub fn current(&self) -> Option<ThreadId> {
        self.core.running()
    }

    pub fn name(&self, id: ThreadId) -> Option<&'static str> {
        if self.core.in_isr() {
            return None;
        }
        self.slot(id).and_then(|tcb| tcb.name)
    }

    pub fn state(&self, id: ThreadId) -> ThreadState {
        if self.core.in_isr() {
            return ThreadState::Error;
        }
        match self.slot(id) {
            Some(tcb) => tcb.state,
            None if self.retired(id) => ThreadState::Inactive,
            None => ThreadState::Error,
        }
    }

    pub fn join_mode(&self, id: ThreadId) -> Option<JoinMode> {
        self.slot(id).map(|tcb| tcb.join_mode)
    }

    pub fn privilege(&self, id: ThreadId) -> Option<Privilege> {
        self.slot(id).map(|tcb| tcb.privilege)
    }

    pub fn stack_size(&self, id: ThreadId) -> usize {
        if self.core.in_isr() {
            return 0;
        }
        self.slot(id).map_or(0, |tcb| tcb.stack.len())
    }

    /// Stack bytes never touched so far; 0 when watermarking is off.
    pub fn stack_space(&self, id: ThreadId) -> usize {
        if self.core.in_isr() || !self.config.stack_watermark {
            return 0;
        }
        self.slot(id)
            .map_or(0, |tcb| stack_headroom(tcb.stack.bytes(&self.memory)))
    }

    /// The thread's stack, for a port building the initial frame.
    pub fn stack_mut(&mut self, id: ThreadId) -> Option<&mut [u8]> {
        let tcb = self
            .threads
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .filter(|tcb| tcb.id == id)?;
        Some(tcb.stack.bytes_mut(&mut self.memory))
    }

    pub fn stack_overflowed(&self, id: ThreadId) -> bool {
        self.slot(id).is_some_and(|tcb| tcb.stack_overflowed)
    }

    pub fn cpu_ticks(&self, id: ThreadId) -> u64 {
        self.slot(id).map_or(0, |tcb| tcb.cpu_ticks)
    }

    /// Number of ready, running and blocked threads.
    pub fn count(&self) -> usize {
        if self.core.in_isr() {
            return 0;
        }
        self.active().count()
    }

    /// Copies up to `out.len()` active thread handles into `out`.
    pub fn enumerate(&self, out: &mut [ThreadId]) -> usize {
        if self.core.in_isr() {
            return 0;
        }
        let mut count = 0;
        for (dest, tcb) in out.iter_mut().zip(self.active()) {
            *dest = tcb.id;
            count += 1;
        }
        count
    }

    /// Result of the wait the running thread just returned from.
    pub fn take_wait_result(&mut self) -> Option<KernelResult<u32>> {
        let id = self.core.running()?;
        self.slot_mut(id)?.wait_result.take()
    }

    fn active(&self) -> impl Iterator<Item = &ThreadControlBlock> + '_ {
        self.threads
            .iter()
            .flatten()
            .filter(|tcb| tcb.state.is_active())
    }

    fn validate_memory(&self, attr: &ThreadAttributes) -> KernelResult<usize> {
        if let Some(cb) = attr.control_block {
            if cb.len() < CONTROL_BLOCK_SIZE || !cb.is_aligned(CONTROL_BLOCK_ALIGN) {
                log::warn!(
                    "thread creation rejected: control block needs {} aligned bytes",
                    CONTROL_BLOCK_SIZE
                );
                return Err(KernelError::Parameter);
            }
        }

        let size = match attr.stack {
            Some(stack) => {
                if !stack.is_aligned(STACK_ALIGN)
                    || (attr.stack_size != 0 && attr.stack_size != stack.len())
                {
                    log::warn!("thread creation rejected: inconsistent caller stack");
                    return Err(KernelError::Parameter);
                }
                stack.len()
            }
            None if attr.stack_size == 0 => self.config.default_stack_size,
            None => attr.stack_size,
        };
        if !(MIN_STACK_SIZE..=MAX_STACK_SIZE).contains(&size) || size % STACK_ALIGN != 0 {
            log::warn!("thread creation rejected: invalid stack size {}", size);
            return Err(KernelError::Parameter);
        }
        Ok(size)
    }

    /// Whether `id` names a thread that has since been reclaimed.
    fn retired(&self, id: ThreadId) -> bool {
        self.generations
            .get(id.index())
            .is_some_and(|current| id.generation() != 0 && id.generation() < *current)
    }

    /// Error for a handle without a live control block. A reclaimed thread
    /// whose slot is still free is merely inactive; anything else was never
    /// issued or has been superseded by the slot's next occupant.
    fn missing(&self, id: ThreadId) -> KernelError {
        let vacant = self.threads.get(id.index()).is_some_and(Option::is_none);
        if vacant && self.retired(id) {
            KernelError::Resource
        } else {
            KernelError::Parameter
        }
    }

    fn lookup(&self, id: ThreadId) -> KernelResult<&ThreadControlBlock> {
        self.slot(id).ok_or_else(|| self.missing(id))
    }

    fn lookup_mut(&mut self, id: ThreadId) -> KernelResult<&mut ThreadControlBlock> {
        if self.slot(id).is_none() {
            return Err(self.missing(id));
        }
        self.slot_mut(id).ok_or(KernelError::Generic)
    }

    fn free_slot(&self) -> Option<usize> {
        self.threads.iter().position(Option::is_none)
    }

    fn slot(&self, id: ThreadId) -> Option<&ThreadControlBlock> {
        self.threads
            .get(id.index())?
            .as_ref()
            .filter(|tcb| tcb.id == id)
    }

    fn slot_mut(&mut self, id: ThreadId) -> Option<&mut ThreadControlBlock> {
        self.threads
            .get_mut(id.index())?
            .as_mut()
            .filter(|tcb| tcb.id == id)
    }

    /// Blocks the running thread and passes the core on. `timeout` is in
    /// ticks; [`WAIT_FOREVER`] never expires.
    fn block_current(&mut self, reason: BlockReason, timeout: u32) -> KernelResult<()> {
        let id = self.core.running().ok_or(KernelError::Resource)?;
        let wake_at = if timeout == WAIT_FOREVER {
            None
        } else {
            Some(self.clock.saturating_add(u64::from(timeout)))
        };
        self.slot_mut(id)
            .ok_or(KernelError::Generic)?
            .block_on(reason, wake_at);
        self.reschedule();
        Ok(())
    }

    fn make_ready(&mut self, id: ThreadId, reason: RescheduleReason) {
        let Some(tcb) = self.slot_mut(id) else {
            return;
        };
        tcb.mark_ready();
        let priority = tcb.priority;
        if self.ready.insert(id, priority, reason).is_err() {
            log::error!("ready queue overflow while queueing thread {}", id);
        }
    }

    /// Completes the wait `id` is in and readies it unless it is suspended.
    fn wake(&mut self, id: ThreadId, result: KernelResult<u32>) {
        let Some(tcb) = self.slot_mut(id) else {
            return;
        };
        if tcb.complete_wait(result) {
            log::trace!("thread {} woken", id);
            self.make_ready(id, RescheduleReason::Woken);
        }
    }

    /// Moves `id` to TERMINATED and applies its join mode.
    fn finish(&mut self, id: ThreadId) {
        self.ready.remove(id);
        let Some(tcb) = self.slot_mut(id) else {
            return;
        };
        let awaited = match tcb.block {
            Some(BlockReason::Join(target)) => Some(target),
            _ => None,
        };
        let join_mode = tcb.join_mode;
        let joiner = tcb.joiner.take();
        tcb.terminate();
        log::debug!("thread {} terminated", id);

        if let Some(target) = awaited {
            if let Some(awaited) = self.slot_mut(target) {
                if awaited.joiner == Some(id) {
                    awaited.joiner = None;
                }
            }
        }

        match (join_mode, joiner) {
            (JoinMode::Detached, _) => self.reclaim(id),
            (JoinMode::Joinable, Some(waiter)) => {
                self.reclaim(id);
                self.wake(waiter, Ok(0));
            }
            (JoinMode::Joinable, None) => {}
        }
    }

    /// Frees the slot of a terminated thread; its handle goes stale.
    fn reclaim(&mut self, id: ThreadId) {
        let index = id.index();
        let Some(tcb) = self.threads[index].take() else {
            return;
        };
        tcb.stack.release(&mut self.memory);
        let next = self.generations[index].wrapping_add(1);
        self.generations[index] = if next == 0 { 1 } else { next };
        log::debug!("thread {} reclaimed", id);
    }

    /// Re-evaluates which thread owns the core. Inside an interrupt handler
    /// the switch is deferred to [`ThreadManager::exit_isr`].
    fn reschedule(&mut self) {
        if !self.core.started() {
            return;
        }
        if self.core.in_isr() {
            self.switch_pending = true;
            return;
        }

        let current = self.core.running();
        if let Some(id) = current {
            let still_running = self
                .slot(id)
                .filter(|tcb| tcb.state == ThreadState::Running)
                .map(|tcb| tcb.priority);
            if let Some(priority) = still_running {
                if !self.ready.outranks(priority) {
                    return;
                }
                self.make_ready(id, RescheduleReason::Preempted);
            }
        }

        let next = self.ready.pop().map(|entry| entry.id);
        if next.is_none() && current.is_none() {
            return;
        }
        self.switch(current, next);
    }

    fn switch(&mut self, from: Option<ThreadId>, to: Option<ThreadId>) {
        if let Some(previous) = from {
            self.check_stack(previous);
        }

        let slice = self.config.round_robin_timeout;
        let dispatch = to.and_then(|id| {
            let tcb = self.slot_mut(id)?;
            tcb.mark_running();
            tcb.slice_remaining = slice;
            let first_run = !tcb.dispatched;
            tcb.dispatched = true;
            Some(Dispatch {
                id,
                entry: tcb.entry,
                argument: tcb.argument,
                first_run,
            })
        });

        self.core.switch_to(to);
        if from == to {
            return;
        }
        match to {
            Some(id) => log::trace!("context switch to thread {}", id),
            None => log::trace!("no thread ready, core idle"),
        }
        self.dispatcher.switch_to(from, dispatch);
    }

    fn check_stack(&mut self, id: ThreadId) {
        if !self.config.stack_check {
            return;
        }
        let Some(tcb) = self
            .threads
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .filter(|tcb| tcb.id == id)
        else {
            return;
        };
        if !tcb.stack_overflowed && !stack_magic_intact(tcb.stack.bytes(&self.memory)) {
            tcb.stack_overflowed = true;
            log::error!(
                "stack overflow detected in thread {} ({})",
                id,
                tcb.name.unwrap_or("unnamed")
            );
        }
    }
}

fn privilege_from_bits(bits: ThreadAttrBits) -> KernelResult<Privilege> {
    if ThreadAttrBits::from_bits(bits.bits()).is_none() {
        return Err(KernelError::Parameter);
    }
    match (
        bits.contains(ThreadAttrBits::PRIVILEGED),
        bits.contains(ThreadAttrBits::UNPRIVILEGED),
    ) {
        (true, true) => Err(KernelError::Parameter),
        (true, false) => Ok(Privilege::Privileged),
        (false, true) => Ok(Privilege::Unprivileged),
        (false, false) => Ok(Privilege::Default),
    }
}

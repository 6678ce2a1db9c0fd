//! Execution context of the single core the manager drives: whether code is
//! running in an interrupt handler, which thread owns the core, and how ticks
//! were spent.

use crate::kernel::thread::ThreadId;

#[derive(Clone, Copy, Debug)]
pub struct CoreState {
    started: bool,
    isr_depth: u32,
    running: Option<ThreadId>,
    pub busy_ticks: u64,
    pub idle_ticks: u64,
    pub context_switches: u64,
}

impl CoreState {
    pub const fn new() -> Self {
        Self {
            started: false,
            isr_depth: 0,
            running: None,
            busy_ticks: 0,
            idle_ticks: 0,
            context_switches: 0,
        }
    }

    pub fn start(&mut self) {
        self.started = true;
    }

    pub const fn started(&self) -> bool {
        self.started
    }

    pub fn irq_enter(&mut self) {
        self.isr_depth = self.isr_depth.saturating_add(1);
    }

    pub fn irq_exit(&mut self) {
        self.isr_depth = self.isr_depth.saturating_sub(1);
    }

    pub const fn in_isr(&self) -> bool {
        self.isr_depth > 0
    }

    pub const fn running(&self) -> Option<ThreadId> {
        self.running
    }

    pub fn switch_to(&mut self, thread: Option<ThreadId>) {
        if self.running != thread {
            self.context_switches = self.context_switches.saturating_add(1);
        }
        self.running = thread;
    }

    pub fn account_tick(&mut self) {
        if self.running.is_some() {
            self.busy_ticks = self.busy_ticks.saturating_add(1);
        } else {
            self.idle_ticks = self.idle_ticks.saturating_add(1);
        }
    }
}

impl Default for CoreState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_interrupts_unwind() {
        let mut core = CoreState::new();
        assert!(!core.in_isr());
        core.irq_enter();
        core.irq_enter();
        core.irq_exit();
        assert!(core.in_isr());
        core.irq_exit();
        assert!(!core.in_isr());
        core.irq_exit();
        assert!(!core.in_isr());
    }

    #[test]
    fn ticks_split_between_busy_and_idle() {
        let mut core = CoreState::new();
        core.account_tick();
        core.switch_to(Some(ThreadId::new(0, 1)));
        core.account_tick();
        core.account_tick();
        assert_eq!(core.idle_ticks, 1);
        assert_eq!(core.busy_ticks, 2);
        assert_eq!(core.context_switches, 1);
    }
}

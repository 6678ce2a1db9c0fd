//! Boot-time tunables for the thread manager.

pub const DEFAULT_TICK_FREQUENCY_HZ: u32 = 1000;
pub const DEFAULT_STACK_SIZE: usize = 1024;
pub const DEFAULT_ROUND_ROBIN_TIMEOUT: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    pub tick_frequency_hz: u32,
    /// Stack size used when a thread is created without an explicit size.
    pub default_stack_size: usize,
    /// Ticks an equal-priority thread may run before it is rotated behind its
    /// peers. Zero disables time slicing.
    pub round_robin_timeout: u32,
    /// Fill stacks with a pattern so unused headroom can be measured.
    pub stack_watermark: bool,
    /// Verify the stack magic word whenever a thread is switched out.
    pub stack_check: bool,
}

impl KernelConfig {
    pub const fn new() -> Self {
        Self {
            tick_frequency_hz: DEFAULT_TICK_FREQUENCY_HZ,
            default_stack_size: DEFAULT_STACK_SIZE,
            round_robin_timeout: DEFAULT_ROUND_ROBIN_TIMEOUT,
            stack_watermark: true,
            stack_check: true,
        }
    }

    pub const fn with_tick_frequency(mut self, hz: u32) -> Self {
        self.tick_frequency_hz = hz;
        self
    }

    pub const fn with_default_stack_size(mut self, bytes: usize) -> Self {
        self.default_stack_size = bytes;
        self
    }

    pub const fn with_round_robin(mut self, ticks: u32) -> Self {
        self.round_robin_timeout = ticks;
        self
    }

    pub const fn with_stack_watermark(mut self, enabled: bool) -> Self {
        self.stack_watermark = enabled;
        self
    }

    pub const fn with_stack_check(mut self, enabled: bool) -> Self {
        self.stack_check = enabled;
        self
    }

    pub const fn time_slicing(&self) -> bool {
        self.round_robin_timeout != 0
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}

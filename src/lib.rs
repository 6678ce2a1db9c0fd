#![cfg_attr(not(test), no_std)]

//! A thread lifecycle manager for single-core real-time kernels, following the
//! CMSIS-RTOS v2 thread contract.
//!
//! * The **thread table** ([`kernel::ThreadManager`]) owns every control block
//!   and hands out generation-tagged [`ThreadId`] handles, so a handle that
//!   outlives its thread is rejected instead of aliasing a newer one.
//! * The **scheduler** keeps ready threads in strict priority order with FIFO
//!   service inside a level and optional round-robin time slicing. The actual
//!   register save/restore is left to a port-supplied [`Dispatcher`].
//! * **Stacks** either come from a [`MemoryProvider`] owned by the kernel or
//!   are lent by the caller; only the former are ever returned on reclaim.
//!
//! The crate is `no_std` and needs no global allocator. Ports drive it from
//! their tick interrupt ([`kernel::ThreadManager::tick`]) and bracket interrupt
//! handlers with `enter_isr`/`exit_isr` so that context switches requested
//! there are deferred until the handler returns.

pub mod kernel;

pub use kernel::config::KernelConfig;
pub use kernel::error::{KernelError, KernelResult, Status};
pub use kernel::flags::FlagsOptions;
pub use kernel::memory::{CallerRegion, MemoryProvider, StaticPool};
pub use kernel::priority::ThreadPriority;
pub use kernel::scheduler::{Dispatch, Dispatcher, NoDispatch};
pub use kernel::thread::{ThreadAttributes, ThreadId, ThreadState};
pub use kernel::{ThreadManager, WaitOutcome};

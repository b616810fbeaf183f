//! # Synchronization Primitives
//!
//! Kernel mutexes and counting semaphores. Both keep a bounded FIFO of
//! blocked task indices; the kernel owns the matching task state changes
//! (`BlockedOnMutex`, `BlockedOnSemaphore`, back to `Ready`).
//!
//! On target this module also provides the interrupt-masking critical
//! section that guards the global kernel context.

pub mod mutex;
pub mod semaphore;

pub use mutex::{KernelMutex, LockOutcome};
pub use semaphore::{Semaphore, WaitOutcome};

#[cfg(target_arch = "arm")]
use cortex_m::interrupt;

/// Execute a closure within a critical section (interrupts disabled).
///
/// Every access to the kernel context from Thread mode goes through here.
/// Exception handlers use it too: PendSV, SysTick and SVCall run at
/// different priorities and may nest.
#[cfg(target_arch = "arm")]
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(&interrupt::CriticalSection) -> R,
{
    interrupt::free(f)
}

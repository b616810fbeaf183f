//! # SrdOS Configuration
//!
//! Compile-time constants governing the kernel tables, plus the runtime
//! scheduler options that the administrative service calls toggle.
//! All kernel tables are statically sized.

/// Maximum number of tasks the system can manage simultaneously.
/// This bounds the static TCB array. Priority rings pack task indices
/// into 4-bit fields, so this may not exceed 16.
pub const MAX_TASKS: usize = 12;

/// Number of priority levels. 0 is the highest priority.
pub const NUM_PRIORITIES: usize = 16;

/// Lowest priority level, conventionally used by the idle task.
pub const LOWEST_PRIORITY: u8 = (NUM_PRIORITIES - 1) as u8;

/// Number of kernel mutexes.
pub const MAX_MUTEXES: usize = 1;

/// Maximum number of tasks that can wait on one mutex.
pub const MAX_MUTEX_QUEUE_SIZE: usize = 2;

/// Number of counting semaphores.
pub const MAX_SEMAPHORES: usize = 3;

/// Maximum number of tasks that can wait on one semaphore.
pub const MAX_SEMAPHORE_QUEUE_SIZE: usize = 2;

/// Length of the task name shown by `ps`, in bytes.
pub const TASK_NAME_LEN: usize = 16;

/// SysTick frequency in Hz. One tick is the unit of `sleep()`.
pub const TICK_HZ: u32 = 1000;

/// System clock frequency in Hz (TM4C123GH6PM, PLL at 40 MHz).
pub const SYSTEM_CLOCK_HZ: u32 = 40_000_000;

const _: () = assert!(MAX_TASKS <= 16);
const _: () = assert!(NUM_PRIORITIES <= 256);

// ---------------------------------------------------------------------------
// Runtime options
// ---------------------------------------------------------------------------

/// Task selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingPolicy {
    /// Circular scan of the task table, first Ready task wins.
    RoundRobin,
    /// Highest-priority Ready level first, rotating within the level.
    Priority,
}

/// Scheduler behavior switches, changed at runtime through the
/// `sched`, `preempt` and `pi` service calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// How the next task is chosen.
    pub policy: SchedulingPolicy,

    /// When set, every SysTick requests a context switch.
    /// When clear, tasks only give up the CPU through service calls.
    pub preemption: bool,

    /// When set, a mutex owner inherits the priority of the tasks it blocks.
    pub priority_inheritance: bool,
}

impl SchedulerOptions {
    /// Priority scheduling, cooperative, no inheritance.
    pub const fn new() -> Self {
        Self {
            policy: SchedulingPolicy::Priority,
            preemption: false,
            priority_inheritance: false,
        }
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::new()
    }
}

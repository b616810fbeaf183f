//! Kernel error type.
//!
//! Every fallible kernel operation returns [`Result`]. A failed operation
//! leaves the task table, primitives and allocator exactly as they were.

use core::fmt;

/// Errors reported by kernel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// All `MAX_TASKS` slots are in use.
    TaskTableFull,
    /// The entry point is already registered as a task.
    DuplicateTask,
    /// No task matches the given pid, entry point or name.
    NoSuchTask,
    /// The task is not in a state that allows the operation.
    InvalidState,
    /// Priority outside `0..NUM_PRIORITIES`.
    InvalidPriority(u8),
    /// The scheduler has not been started, so there is no current task.
    NotStarted,
    /// No task is Ready.
    NoRunnableTask,
    /// No contiguous run of free subregions fits the request.
    OutOfMemory {
        /// Requested size in bytes.
        size: u32,
    },
    /// Allocation or access window size the MPU geometry cannot express.
    UnsupportedSize(u32),
    /// Address outside the heap or not on a subregion boundary.
    InvalidAddress(u32),
    /// Address does not start a live allocation.
    NotAllocated(u32),
    /// The caller does not own the mutex or allocation.
    NotOwner,
    /// Mutex index out of range.
    InvalidMutex(u8),
    /// Semaphore index out of range.
    InvalidSemaphore(u8),
    /// The wait queue of a mutex or semaphore is full.
    QueueFull,
    /// Service call number not recognized.
    UnknownService(u8),
    /// A buffer passed with a service call is not accessible to the caller.
    BadUserBuffer,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskTableFull => write!(f, "task table full"),
            Self::DuplicateTask => write!(f, "entry point already registered"),
            Self::NoSuchTask => write!(f, "no such task"),
            Self::InvalidState => write!(f, "task in wrong state"),
            Self::InvalidPriority(p) => write!(f, "invalid priority {}", p),
            Self::NotStarted => write!(f, "scheduler not started"),
            Self::NoRunnableTask => write!(f, "no runnable task"),
            Self::OutOfMemory { size } => write!(f, "out of memory ({} bytes)", size),
            Self::UnsupportedSize(size) => write!(f, "unsupported size {:#x}", size),
            Self::InvalidAddress(addr) => write!(f, "invalid address {:#010x}", addr),
            Self::NotAllocated(addr) => write!(f, "{:#010x} is not allocated", addr),
            Self::NotOwner => write!(f, "caller is not the owner"),
            Self::InvalidMutex(m) => write!(f, "invalid mutex {}", m),
            Self::InvalidSemaphore(s) => write!(f, "invalid semaphore {}", s),
            Self::QueueFull => write!(f, "wait queue full"),
            Self::UnknownService(n) => write!(f, "unknown service call {}", n),
            Self::BadUserBuffer => write!(f, "bad user buffer"),
        }
    }
}

/// Kernel result alias.
pub type Result<T> = core::result::Result<T, KernelError>;

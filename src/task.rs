//! # Task Control Block
//!
//! Defines the task model for SrdOS. A task is identified by an opaque
//! [`Pid`] handed out at creation; its entry point is kept alongside so that
//! the same function cannot be registered twice and so that the lifecycle
//! calls (`stop`, `restart`, `set priority`) can name a task by function.
//!
//! Each task owns one stack block from the heap allocator and an
//! [`SrdMask`] that grants unprivileged access to exactly the blocks it owns.

use core::fmt;

use heapless::String;

use crate::config::TASK_NAME_LEN;
use crate::mm::mpu::SrdMask;
use crate::mm::region::Allocation;

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Execution state of a task.
///
/// ```text
///                 create             lock / wait / sleep
///   ┌─────────┐ ─────────► ┌───────┐ ──────────────────► ┌──────────────┐
///   │ Invalid │            │ Ready │                     │ Delayed /    │
///   └─────────┘ ◄─┐        └───────┘ ◄────────────────── │ Blocked...   │
///                 │ reclaim    │      expiry / release   └──────────────┘
///                 │            │ stop         │ stop
///                 │        ┌─────────┐ ◄──────┘
///                 └─────── │ Stopped │ ──► Ready (restart)
///                          └─────────┘
/// ```
///
/// "Running" is not a state: the running task is the Ready task the
/// kernel records as current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Free slot.
    Invalid = 0,
    /// Holds no stack and is never scheduled.
    Stopped = 1,
    /// Runnable.
    Ready = 2,
    /// Sleeping, `ticks` counts down to zero.
    Delayed = 3,
    /// Queued on a mutex.
    BlockedOnMutex = 4,
    /// Queued on a semaphore.
    BlockedOnSemaphore = 5,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Invalid => "invalid",
            Self::Stopped => "stopped",
            Self::Ready => "ready",
            Self::Delayed => "delayed",
            Self::BlockedOnMutex => "blocked (mutex)",
            Self::BlockedOnSemaphore => "blocked (semaphore)",
        })
    }
}

/// Opaque task handle, unique for the lifetime of the system. Never 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(u32);

impl Pid {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

/// Signature of a task body.
pub type TaskFn = extern "C" fn() -> !;

/// Address of a task's first instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint(u32);

impl EntryPoint {
    pub const fn from_addr(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn addr(self) -> u32 {
        self.0
    }
}

impl From<TaskFn> for EntryPoint {
    fn from(f: TaskFn) -> Self {
        Self(f as usize as u32)
    }
}

/// The primitive a blocked task is queued on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedOn {
    Mutex(u8),
    Semaphore(u8),
}

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Task Control Block (TCB). Stored in the kernel's fixed task table.
pub struct TaskControlBlock {
    pub state: TaskState,

    pub pid: Pid,

    pub entry: EntryPoint,

    /// Saved process stack pointer, pointing at the software frame.
    pub sp: u32,

    /// Original top of stack (one past the stack block).
    pub sp_init: u32,

    /// Static priority, 0 = highest.
    pub priority: u8,

    /// Effective priority; differs from `priority` only while inheriting.
    pub current_priority: u8,

    /// Ticks left while Delayed.
    pub ticks: u32,

    /// Unprivileged heap access.
    pub srd: SrdMask,

    pub name: String<TASK_NAME_LEN>,

    pub blocked_on: Option<BlockedOn>,

    /// Stack block; `None` once Stopped.
    pub stack: Option<Allocation>,

    /// Stack size asked for at creation, reused by restart.
    pub stack_request: u32,
}

impl TaskControlBlock {
    /// A free slot. Used to initialize the static table.
    pub const EMPTY: Self = Self {
        state: TaskState::Invalid,
        pid: Pid::new(0),
        entry: EntryPoint::from_addr(0),
        sp: 0,
        sp_init: 0,
        priority: 0,
        current_priority: 0,
        ticks: 0,
        srd: SrdMask::NO_ACCESS,
        name: String::new(),
        blocked_on: None,
        stack: None,
        stack_request: 0,
    };

    /// Occupied slot (anything but Invalid).
    #[inline]
    pub fn is_live(&self) -> bool {
        self.state != TaskState::Invalid
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state == TaskState::Ready
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Replace the name, truncating at a character boundary to fit.
    pub fn set_name(&mut self, name: &str) {
        self.name.clear();
        for c in name.chars() {
            if self.name.push(c).is_err() {
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Exception frames
// ---------------------------------------------------------------------------

/// Stacked `lr` making an exception return land in Thread mode on the PSP.
pub const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// xPSR with only the Thumb bit set.
pub const XPSR_THUMB: u32 = 1 << 24;

/// Callee-saved registers, pushed by the context-switch handler below the
/// hardware frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SoftwareFrame {
    pub r4: u32,
    pub r5: u32,
    pub r6: u32,
    pub r7: u32,
    pub r8: u32,
    pub r9: u32,
    pub r10: u32,
    pub r11: u32,
}

/// Registers the core stacks on exception entry, lowest address first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct HardwareFrame {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub pc: u32,
    pub xpsr: u32,
}

/// What a task's stack holds while it is switched out. A new task gets one
/// of these written at its top of stack, so the first switch to it looks
/// like returning from an interrupt taken just before `entry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct InitialFrame {
    pub software: SoftwareFrame,
    pub hardware: HardwareFrame,
}

impl InitialFrame {
    /// Bytes the frame occupies on the stack.
    pub const SIZE: u32 = core::mem::size_of::<Self>() as u32;

    pub fn new(entry: EntryPoint) -> Self {
        Self {
            software: SoftwareFrame::default(),
            hardware: HardwareFrame {
                lr: EXC_RETURN_THREAD_PSP,
                // exception return requires a halfword-aligned pc
                pc: entry.addr() & !1,
                xpsr: XPSR_THUMB,
                ..HardwareFrame::default()
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn test_empty_slot() {
        let tcb = TaskControlBlock::EMPTY;
        assert!(!tcb.is_live());
        assert_eq!(tcb.srd, SrdMask::NO_ACCESS);
        assert!(tcb.stack.is_none());
    }

    #[test]
    fn test_frame_layout() {
        assert_eq!(size_of::<SoftwareFrame>(), 32);
        assert_eq!(size_of::<HardwareFrame>(), 32);
        assert_eq!(InitialFrame::SIZE, 64);
        assert_eq!(offset_of!(InitialFrame, hardware), 32);
        assert_eq!(offset_of!(HardwareFrame, lr), 20);
        assert_eq!(offset_of!(HardwareFrame, pc), 24);
        assert_eq!(offset_of!(HardwareFrame, xpsr), 28);
    }

    #[test]
    fn test_initial_frame() {
        let frame = InitialFrame::new(EntryPoint::from_addr(0x0000_1235));
        assert_eq!(frame.hardware.pc, 0x0000_1234);
        assert_eq!(frame.hardware.lr, EXC_RETURN_THREAD_PSP);
        assert_eq!(frame.hardware.xpsr, XPSR_THUMB);
        assert_eq!(frame.hardware.r0, 0);
        assert_eq!(frame.software, SoftwareFrame::default());
    }

    #[test]
    fn test_name_truncates() {
        let mut tcb = TaskControlBlock::EMPTY;
        tcb.set_name("a-very-long-task-name");
        assert_eq!(tcb.name(), "a-very-long-task");
        tcb.set_name("idle");
        assert_eq!(tcb.name(), "idle");
    }

    #[test]
    fn test_state_display() {
        let mut s: String<24> = String::new();
        core::fmt::write(&mut s, format_args!("{}", TaskState::BlockedOnMutex)).unwrap();
        assert_eq!(s.as_str(), "blocked (mutex)");
    }
}

//! # Kernel API
//!
//! Public entry points for firmware and tasks.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset_handler (cortex-m-rt)
//!   └─► main()                        privileged, MSP
//!         ├─► api::init()             ← MPU, exception priorities, SysTick
//!         ├─► api::init_mutex()       ← primitives
//!         ├─► api::init_semaphore()
//!         ├─► api::create_thread()    ← register tasks (×N)
//!         └─► api::start()            ← svc #0, does not return
//!               └─► PendSV            ← first task, unprivileged, PSP
//! ```
//!
//! The setup functions run privileged before the scheduler starts and call
//! the kernel directly. Everything else is for tasks: each wrapper issues
//! `svc #n` with its arguments in `r0`..`r1` and, where the service
//! replies, reads the answer back from `r0`.

use core::ptr::NonNull;

use crate::arch::cortex_m4::{self, with_kernel};
use crate::config::{SchedulingPolicy, TASK_NAME_LEN};
use crate::error::Result;
use crate::kernel::status::{IpcStatus, MemInfo, ProcessInfo};
use crate::kernel::svc::ServiceNumber;
use crate::task::{EntryPoint, Pid, TaskFn};

/// Issue `svc #n`. Arguments go in `r0` and `r1`; the value left in `r0`
/// is returned.
macro_rules! svc {
    ($n:ident) => {
        svc!($n, 0, 0)
    };
    ($n:ident, $r0:expr) => {
        svc!($n, $r0, 0)
    };
    ($n:ident, $r0:expr, $r1:expr) => {{
        let mut r0: u32 = $r0;
        let r1: u32 = $r1;
        unsafe {
            core::arch::asm!(
                "svc #{n}",
                n = const ServiceNumber::$n as u8,
                inout("r0") r0,
                in("r1") r1,
            );
        }
        r0
    }};
}

// ---------------------------------------------------------------------------
// Privileged setup
// ---------------------------------------------------------------------------

/// Bring up the MPU, exception priorities and the tick timer.
///
/// Must be called once, from `main`, before anything else here.
pub fn init(mut core_peripherals: cortex_m::Peripherals) {
    cortex_m4::configure_mpu(&mut core_peripherals.MPU);
    cortex_m4::configure_exceptions(&mut core_peripherals.SCB);
    cortex_m4::configure_systick(&mut core_peripherals.SYST);
    log::info!("kernel initialized");
}

/// Register a task. See [`crate::kernel::Kernel::create_thread`].
pub fn create_thread(entry: TaskFn, name: &str, priority: u8, stack_bytes: u32) -> Result<Pid> {
    with_kernel(|kernel, port| {
        kernel.create_thread(port, EntryPoint::from(entry), name, priority, stack_bytes)
    })
}

pub fn init_mutex(mutex: u8) -> Result<()> {
    with_kernel(|kernel, _| kernel.init_mutex(mutex))
}

pub fn init_semaphore(semaphore: u8, count: u32) -> Result<()> {
    with_kernel(|kernel, _| kernel.init_semaphore(semaphore, count))
}

/// Start the scheduler. **Does not return.**
///
/// Thread mode moves to a scratch process stack and asks the kernel to
/// start; the first PendSV then drops into the highest-priority task,
/// unprivileged. Only returns to the idle loop below if no task is Ready.
pub fn start() -> ! {
    unsafe { cortex_m4::switch_to_process_stack() };
    svc!(Start);
    loop {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// Task services
// ---------------------------------------------------------------------------

/// Give up the CPU.
pub fn yield_now() {
    svc!(Yield);
}

/// Sleep for `ticks` milliseconds. Zero yields.
pub fn sleep(ticks: u32) {
    svc!(Sleep, ticks);
}

/// Acquire `mutex`, blocking while another task holds it.
pub fn lock(mutex: u8) {
    svc!(Lock, mutex as u32);
}

/// Release `mutex`. Ignored unless the caller owns it.
pub fn unlock(mutex: u8) {
    svc!(Unlock, mutex as u32);
}

/// Take one unit of `semaphore`, blocking while the count is zero.
pub fn wait(semaphore: u8) {
    svc!(Wait, semaphore as u32);
}

pub fn post(semaphore: u8) {
    svc!(Post, semaphore as u32);
}

/// Allocate `size` bytes the caller alone may access.
pub fn malloc(size: u32) -> Option<NonNull<u8>> {
    NonNull::new(svc!(Malloc, size) as *mut u8)
}

/// Return a block obtained from [`malloc`].
pub fn free(block: NonNull<u8>) {
    svc!(Free, block.as_ptr() as u32);
}

pub fn restart_thread(entry: TaskFn) {
    svc!(Restart, EntryPoint::from(entry).addr());
}

pub fn stop_thread(entry: TaskFn) {
    svc!(Stop, EntryPoint::from(entry).addr());
}

pub fn set_thread_priority(entry: TaskFn, priority: u8) {
    svc!(SetPriority, EntryPoint::from(entry).addr(), priority as u32);
}

pub fn reboot() -> ! {
    svc!(Reboot);
    loop {
        cortex_m::asm::nop();
    }
}

// ---------------------------------------------------------------------------
// Administrative services
// ---------------------------------------------------------------------------

/// Fill `records` with one [`ProcessInfo`] per task and return how many
/// were written. `records` must be memory the caller may access.
pub fn ps(records: &mut [[u8; ProcessInfo::WIRE_SIZE]]) -> usize {
    svc!(Ps, records.as_mut_ptr() as u32, records.len() as u32) as usize
}

/// Fill `record` with the [`IpcStatus`] report.
pub fn ipcs(record: &mut [u8; IpcStatus::WIRE_SIZE]) -> bool {
    svc!(Ipcs, record.as_mut_ptr() as u32) != 0
}

/// Fill `records` with one [`MemInfo`] per task and return how many were
/// written.
pub fn meminfo(records: &mut [[u8; MemInfo::WIRE_SIZE]]) -> usize {
    svc!(Meminfo, records.as_mut_ptr() as u32, records.len() as u32) as usize
}

pub fn kill(pid: Pid) -> bool {
    svc!(Kill, pid.as_u32()) != 0
}

/// Copy `name` onto the caller's stack. String literals live in flash,
/// which the kernel will not read on a task's behalf.
fn stack_copy(name: &str) -> ([u8; TASK_NAME_LEN], u32) {
    let mut buf = [0u8; TASK_NAME_LEN];
    let len = name.len().min(TASK_NAME_LEN);
    buf[..len].copy_from_slice(&name.as_bytes()[..len]);
    (buf, len as u32)
}

pub fn pkill(name: &str) -> bool {
    let (buf, len) = stack_copy(name);
    svc!(Pkill, buf.as_ptr() as u32, len) != 0
}

pub fn pidof(name: &str) -> Option<Pid> {
    let (buf, len) = stack_copy(name);
    match svc!(Pidof, buf.as_ptr() as u32, len) {
        0 => None,
        raw => Some(Pid::new(raw)),
    }
}

pub fn sched(policy: SchedulingPolicy) {
    svc!(Sched, (policy == SchedulingPolicy::Priority) as u32);
}

pub fn preempt(on: bool) {
    svc!(Preempt, on as u32);
}

pub fn pi(on: bool) {
    svc!(Pi, on as u32);
}

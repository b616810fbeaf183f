//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor: the
//! global kernel instance, the [`Port`] implementation, MPU and exception
//! setup, and the SVCall/PendSV/SysTick/MemoryManagement handlers.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M4 uses a split-stack model:
//! - **MSP** (Main Stack Pointer): kernel and exception handlers, in the
//!   4 KiB OS region
//! - **PSP** (Process Stack Pointer): tasks in Thread mode, in the heap
//!
//! On exception entry the hardware stacks R0-R3, R12, LR, PC and xPSR onto
//! the process stack. PendSV pushes R4-R11 below that, hands the resulting
//! stack pointer to [`Kernel::context_switch`] and pops R4-R11 from whatever
//! stack pointer comes back. A task's saved stack is therefore always an
//! [`InitialFrame`]-shaped block, and a new task's stack is seeded with one.
//!
//! ## Exception Priorities
//!
//! - MemoryManagement: 0x00 (highest), so a fault can stop a task at once
//! - SVCall: 0x80, service calls run to completion ahead of switches
//! - SysTick: 0xC0
//! - PendSV: 0xFF (lowest), switches only once nothing else is active
//!
//! The crate targets `thumbv7em-none-eabi`, so no task ever has an extended
//! (FPU) frame and every exception return uses `EXC_RETURN_THREAD_PSP`.

use core::arch::global_asm;
use core::cell::RefCell;
use core::ptr;

use cortex_m::interrupt::Mutex;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{MPU, SCB, SYST};
use cortex_m::register::{control, psp};

use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::kernel::Kernel;
use crate::mm::mpu::{self, SrdMask};
use crate::mm::NUM_REGIONS;
use crate::port::{Port, UserMemory};
use crate::sync;
use crate::task::{HardwareFrame, InitialFrame};

// ---------------------------------------------------------------------------
// Global kernel instance
// ---------------------------------------------------------------------------

/// The one kernel context. Only reachable through [`with_kernel`].
static KERNEL: Mutex<RefCell<Kernel>> = Mutex::new(RefCell::new(Kernel::new()));

/// Run `f` on the kernel context with interrupts masked.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel, &mut CortexM4) -> R) -> R {
    sync::critical_section(|cs| f(&mut KERNEL.borrow(cs).borrow_mut(), &mut CortexM4))
}

// ---------------------------------------------------------------------------
// Port implementation
// ---------------------------------------------------------------------------

/// The processor itself. Zero-sized; every method touches core registers.
pub struct CortexM4;

impl Port for CortexM4 {
    fn write_initial_frame(&mut self, sp: u32, frame: &InitialFrame) {
        // sp lies in a stack block the allocator just handed out
        unsafe { ptr::write_volatile(sp as *mut InitialFrame, *frame) };
    }

    fn apply_srd_mask(&mut self, mask: SrdMask) {
        let regs = unsafe { &*MPU::PTR };
        for region in 0..NUM_REGIONS {
            let config = mpu::heap_region(region, mask.region_srd(region));
            unsafe {
                regs.rbar.write(config.rbar);
                regs.rasr.write(config.rasr);
            }
        }
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
    }

    fn pend_context_switch(&mut self) {
        SCB::set_pendsv();
    }

    fn enter_unprivileged(&mut self) {
        let mut ctrl = control::read();
        ctrl.set_npriv(control::Npriv::Unprivileged);
        unsafe { control::write(ctrl) };
    }

    fn system_reset(&mut self) {
        SCB::sys_reset();
    }
}

/// Task memory seen from a privileged handler.
struct RawMemory;

impl UserMemory for RawMemory {
    fn read(&self, addr: u32, buf: &mut [u8]) {
        unsafe { ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len()) };
    }

    fn write(&mut self, addr: u32, data: &[u8]) {
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()) };
    }
}

// ---------------------------------------------------------------------------
// Boot-time configuration
// ---------------------------------------------------------------------------

/// Configure the SysTick timer for the scheduler tick.
///
/// Fires at `TICK_HZ` from the processor clock. Each tick calls
/// [`Kernel::tick`].
pub fn configure_systick(syst: &mut SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// Set system handler priorities and enable the memory-management fault.
pub fn configure_exceptions(scb: &mut SCB) {
    const MEMFAULTENA: u32 = 1 << 16;
    unsafe {
        // shpr[n] is the priority of exception n + 4
        scb.shpr[0].write(0x00); // MemoryManagement
        scb.shpr[7].write(0x80); // SVCall
        scb.shpr[10].write(0xFF); // PendSV
        scb.shpr[11].write(0xC0); // SysTick
        scb.shcsr.modify(|x| x | MEMFAULTENA);
    }
}

/// Program the boot region layout and turn the MPU on.
///
/// Flash and peripherals are open, every heap subregion is disabled, and
/// privileged code keeps the default memory map underneath.
pub fn configure_mpu(mpu: &mut MPU) {
    unsafe {
        mpu.ctrl.write(0);
        for region in mpu::boot_layout() {
            mpu.rbar.write(region.rbar);
            mpu.rasr.write(region.rasr);
        }
        mpu.ctrl.write(mpu::control().bits());
    }
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

/// Process stack used by Thread mode between reset and the first switch,
/// in doublewords. Only `svc #0` ever runs on it.
const BOOT_STACK_DWORDS: usize = 16;

static mut BOOT_STACK: [u64; BOOT_STACK_DWORDS] = [0; BOOT_STACK_DWORDS];

/// Move Thread mode onto a scratch process stack, so that the first PendSV
/// has a PSP to save into before any task exists.
///
/// # Safety
/// Call once, from Thread mode, before the scheduler starts.
pub unsafe fn switch_to_process_stack() {
    let top = ptr::addr_of_mut!(BOOT_STACK) as u32 + (BOOT_STACK_DWORDS * 8) as u32;
    psp::write(top);
    let mut ctrl = control::read();
    ctrl.set_spsel(control::Spsel::Psp);
    control::write(ctrl);
    cortex_m::asm::isb();
}

// ---------------------------------------------------------------------------
// PendSV handler (context switch)
// ---------------------------------------------------------------------------

global_asm! {"
    .section .text.PendSV
    .globl PendSV
    .type PendSV,function
    .thumb_func
    PendSV:
        mrs r0, psp
        stmdb r0!, {{r4-r11}}
        bl pendsv_switch
        ldmia r0!, {{r4-r11}}
        msr psp, r0
        ldr r0, =0xFFFFFFFD
        bx r0
"}

/// Rust side of PendSV: takes the outgoing stack pointer (software frame
/// already pushed) and returns the one to restore.
#[no_mangle]
extern "C" fn pendsv_switch(psp: u32) -> u32 {
    with_kernel(|kernel, port| kernel.context_switch(port, psp))
}

// ---------------------------------------------------------------------------
// SVCall handler (service calls)
// ---------------------------------------------------------------------------

global_asm! {"
    .section .text.SVCall
    .globl SVCall
    .type SVCall,function
    .thumb_func
    SVCall:
        mrs r0, psp
        b svc_dispatch
"}

/// Run the service call whose hardware frame sits at `frame`. Decoding and
/// the write-back into the frame are [`Kernel::dispatch`]'s job.
///
/// # Safety
/// Only entered from the SVCall shim, with `frame` the caller's PSP.
#[no_mangle]
unsafe extern "C" fn svc_dispatch(frame: *mut HardwareFrame) {
    let frame = &mut *frame;
    with_kernel(|kernel, port| kernel.dispatch(port, &mut RawMemory, frame));
}

// ---------------------------------------------------------------------------
// SysTick handler
// ---------------------------------------------------------------------------

/// Scheduler tick entry point, called at `TICK_HZ`.
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    with_kernel(|kernel, port| kernel.tick(port));
}

// ---------------------------------------------------------------------------
// MemoryManagement handler
// ---------------------------------------------------------------------------

/// A task touched memory outside its mask: report it and stop the task.
#[no_mangle]
pub unsafe extern "C" fn MemoryManagement() {
    const MMFSR: u32 = 0xFF;
    const MMARVALID: u32 = 1 << 7;

    let scb = &*SCB::PTR;
    let status = scb.cfsr.read() & MMFSR;
    let frame = &*(psp::read() as *const HardwareFrame);
    if status & MMARVALID != 0 {
        log::error!(
            "memory fault at {:#010x}, pc {:#010x}, mmfsr {:#04x}",
            scb.mmfar.read(),
            frame.pc,
            status
        );
    } else {
        log::error!("memory fault, pc {:#010x}, mmfsr {:#04x}", frame.pc, status);
    }
    // write-one-to-clear
    scb.cfsr.write(status);

    with_kernel(|kernel, port| {
        if let Ok(current) = kernel.current_index() {
            if let Err(e) = kernel.stop_index(port, current) {
                log::error!("could not stop faulting task: {}", e);
            }
        }
    });
}

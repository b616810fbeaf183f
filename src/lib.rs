//! # SrdOS
//!
//! A small preemptive/cooperative RTOS kernel for the ARM Cortex-M4
//! (TM4C123GH6PM) that isolates tasks with MPU subregions.
//!
//! ## Overview
//!
//! The 28 KiB of SRAM above the kernel's own 4 KiB is split into five MPU
//! regions of eight subregions each. Task stacks and `malloc` blocks are
//! runs of whole subregions, and every task carries a 40-bit
//! subregion-disable mask that opens exactly the subregions it owns. The
//! mask is loaded into the MPU on every switch, so an unprivileged task
//! faults the moment it touches memory that is not its own.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                   │
//! │           (unprivileged, PSP, own heap only)           │
//! ├────────────────────────────────────────────────────────┤
//! │                   Kernel API (api.rs)                  │
//! │     init · create_thread · start  │  svc #n wrappers   │
//! ├────────────────────────────────────────────────────────┤
//! │              Kernel context (kernel/)                  │
//! │  lifecycle · tick · switch · ipc · heap · status · svc │
//! ├──────────────┬────────────────────┬────────────────────┤
//! │  Scheduler   │  Memory (mm/)      │  Sync Primitives   │
//! │  scheduler.rs│  region allocator  │  sync/             │
//! │  ─ RR        │  SRD masks         │  ─ KernelMutex     │
//! │  ─ prio ring │  MPU encoding      │  ─ Semaphore       │
//! ├──────────────┴────────────────────┴────────────────────┤
//! │              Task Model (task.rs)                      │
//! │        TCB · TaskState · Pid · exception frames        │
//! ├────────────────────────────────────────────────────────┤
//! │     Port trait (port.rs) ◄── Arch (arch/cortex_m4.rs)  │
//! │     PendSV · SVCall · SysTick · MemManage · MPU        │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Model
//!
//! - **Kernel state**: one statically allocated [`kernel::Kernel`],
//!   reached only inside `cortex_m::interrupt::free()`
//! - **No `alloc`**: fixed tables, `heapless` strings and queues
//! - **Task memory**: handed out by [`mm::region::RegionAllocator`] in
//!   512 B / 1 KiB subregions, tracked per owner
//! - **Protection**: [`mm::mpu::SrdMask`] per task, default deny
//!
//! Everything except `arch`, `api` and `logging` is plain logic behind the
//! [`port::Port`] trait and is unit tested on the host.

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod error;
pub mod kernel;
pub mod mm;
pub mod port;
pub mod scheduler;
pub mod sync;
pub mod task;

#[cfg(target_arch = "arm")]
pub mod api;
#[cfg(target_arch = "arm")]
pub mod arch;
#[cfg(target_arch = "arm")]
pub mod logging;

#[cfg(test)]
mod testing;

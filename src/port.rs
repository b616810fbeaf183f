//! # Port Interface
//!
//! The hardware side effects the kernel logic needs, kept behind traits so
//! that everything in [`crate::kernel`] runs unchanged on the host under
//! test. The Cortex-M4 implementation lives in `arch::cortex_m4`.

use crate::mm::mpu::SrdMask;
use crate::task::InitialFrame;

/// Processor operations invoked by the kernel from privileged code.
pub trait Port {
    /// Store `frame` on a task stack, its first word at `sp`.
    fn write_initial_frame(&mut self, sp: u32, frame: &InitialFrame);

    /// Load the SRD fields of the heap regions from `mask`.
    fn apply_srd_mask(&mut self, mask: SrdMask);

    /// Request a context switch once no other exception is active.
    fn pend_context_switch(&mut self);

    /// Make Thread mode unprivileged from the next exception return on.
    fn enter_unprivileged(&mut self);

    /// Reset the system. On hardware this does not return.
    fn system_reset(&mut self);
}

/// Access to task memory named by service-call arguments, and to the
/// instruction a service call trapped on.
///
/// Buffers are checked against the caller's [`SrdMask`] before either
/// method touches them. The only other read is the `svc` halfword just
/// before the caller's stacked return address.
pub trait UserMemory {
    fn read(&self, addr: u32, buf: &mut [u8]);
    fn write(&mut self, addr: u32, data: &[u8]);
}

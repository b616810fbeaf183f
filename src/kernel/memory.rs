//! Heap blocks requested by running tasks.
//!
//! A block belongs to the task that asked for it. Its subregions are opened
//! in the owner's mask, and the mask is committed straight away since the
//! owner is the running task. Everything a task owns is released when it
//! is stopped.

use super::Kernel;
use crate::error::{KernelError, Result};
use crate::port::Port;

impl Kernel {
    /// Allocate `size` bytes for the running task and return the address.
    pub fn malloc(&mut self, port: &mut impl Port, size: u32) -> Result<u32> {
        let current = self.current_index()?;
        let pid = self.tasks[current].pid;
        let block = self.heap.allocate(size, pid)?;

        let mut srd = self.tasks[current].srd;
        if let Err(e) = srd.grant(block.base, block.size) {
            self.heap.free(block.base)?;
            return Err(e);
        }
        self.tasks[current].srd = srd;
        port.apply_srd_mask(srd);
        Ok(block.base)
    }

    /// Return a block to the heap. Only its owner may free it, and a task's
    /// stack is not freeable this way.
    pub fn free(&mut self, port: &mut impl Port, addr: u32) -> Result<()> {
        let current = self.current_index()?;
        let block = self.heap.lookup(addr)?;
        let tcb = &self.tasks[current];
        if block.owner != tcb.pid {
            log::warn!("free {:#010x}: '{}' is not the owner", addr, tcb.name());
            return Err(KernelError::NotOwner);
        }
        if tcb.stack.is_some_and(|s| s.base == addr) {
            log::warn!("free {:#010x}: '{}' tried to free its stack", addr, tcb.name());
            return Err(KernelError::InvalidAddress(addr));
        }

        let mut srd = tcb.srd;
        srd.revoke(block.base, block.size)?;
        self.heap.free(addr)?;
        self.tasks[current].srd = srd;
        port.apply_srd_mask(srd);
        Ok(())
    }
}

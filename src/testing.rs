//! Host-side stand-ins for the processor, used by the unit tests.

use std::vec::Vec;

use crate::mm::mpu::SrdMask;
use crate::mm::{HEAP_END, HEAP_START};
use crate::port::{Port, UserMemory};
use crate::task::InitialFrame;

/// Records every hardware request instead of performing it.
#[derive(Debug, Default)]
pub struct MockPort {
    pub frames: Vec<(u32, InitialFrame)>,
    pub masks: Vec<SrdMask>,
    pub pended: usize,
    pub unprivileged: bool,
    pub resets: usize,
}

impl MockPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recently committed mask.
    pub fn last_mask(&self) -> Option<SrdMask> {
        self.masks.last().copied()
    }

    /// Return and clear the pended-switch count.
    pub fn take_pended(&mut self) -> usize {
        core::mem::take(&mut self.pended)
    }
}

impl Port for MockPort {
    fn write_initial_frame(&mut self, sp: u32, frame: &InitialFrame) {
        self.frames.push((sp, *frame));
    }

    fn apply_srd_mask(&mut self, mask: SrdMask) {
        self.masks.push(mask);
    }

    fn pend_context_switch(&mut self) {
        self.pended += 1;
    }

    fn enter_unprivileged(&mut self) {
        self.unprivileged = true;
    }

    fn system_reset(&mut self) {
        self.resets += 1;
    }
}

/// A byte array standing in for the task heap.
pub struct MockMemory {
    bytes: Vec<u8>,
}

impl MockMemory {
    pub fn new() -> Self {
        Self {
            bytes: vec![0; (HEAP_END - HEAP_START) as usize],
        }
    }

    fn offset(addr: u32) -> usize {
        (addr - HEAP_START) as usize
    }

    pub fn put(&mut self, addr: u32, data: &[u8]) {
        let at = Self::offset(addr);
        self.bytes[at..at + data.len()].copy_from_slice(data);
    }

    pub fn get(&self, addr: u32, len: usize) -> &[u8] {
        let at = Self::offset(addr);
        &self.bytes[at..at + len]
    }
}

impl UserMemory for MockMemory {
    fn read(&self, addr: u32, buf: &mut [u8]) {
        buf.copy_from_slice(self.get(addr, buf.len()));
    }

    fn write(&mut self, addr: u32, data: &[u8]) {
        self.put(addr, data);
    }
}

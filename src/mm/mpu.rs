//! # MPU Access Masks
//!
//! Every task carries a 40-bit subregion-disable mask, one byte per heap
//! region. A set bit denies unprivileged access to that subregion. Tasks
//! start with every bit set and gain access only to the blocks they own.
//!
//! This module also encodes the ARMv7-M MPU registers (RBAR, RASR, CTRL)
//! for the static region layout the kernel programs at boot:
//!
//! | MPU region | Covers | Attributes |
//! |---|---|---|
//! | 0 | flash, 256 KiB | full access, executable |
//! | 1 | peripherals, 64 MiB | full access, XN, device |
//! | 2..=6 | heap regions R0..R4 | full access, XN, all SRD bits set |

use bitflags::bitflags;

use super::{Subregion, NUM_REGIONS, REGIONS, SUBREGIONS_PER_REGION};
use crate::error::{KernelError, Result};

/// A task's subregion-disable mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrdMask(u64);

impl SrdMask {
    /// No unprivileged access anywhere in the heap.
    pub const NO_ACCESS: Self = Self((1 << (NUM_REGIONS * SUBREGIONS_PER_REGION)) - 1);

    /// Access to the whole heap.
    pub const FULL_ACCESS: Self = Self(0);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits & Self::NO_ACCESS.0)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Enable access to the subregions covering `base..base + size`.
    pub fn grant(&mut self, base: u32, size: u32) -> Result<()> {
        self.0 &= !window_bits(base, size)?;
        Ok(())
    }

    /// Disable access to the subregions covering `base..base + size`.
    pub fn revoke(&mut self, base: u32, size: u32) -> Result<()> {
        self.0 |= window_bits(base, size)?;
        Ok(())
    }

    /// SRD field for heap region `region`.
    #[inline]
    pub const fn region_srd(self, region: usize) -> u8 {
        (self.0 >> (region * SUBREGIONS_PER_REGION)) as u8
    }

    /// Whether unprivileged code with this mask may touch every byte of
    /// `ptr..ptr + len`.
    pub fn permits(self, ptr: u32, len: u32) -> bool {
        let Some(end) = ptr.checked_add(len) else {
            return false;
        };
        let mut addr = ptr;
        while addr < end {
            match Subregion::containing(addr) {
                Some(sub) if self.0 & (1 << sub.bit()) == 0 => addr = sub.base() + sub.size(),
                _ => return false,
            }
        }
        true
    }
}

/// Bits covering an allocation-shaped window: it must start on a subregion
/// boundary and end exactly on one, possibly crossing into the next region.
fn window_bits(base: u32, size: u32) -> Result<u64> {
    if Subregion::starting_at(base).is_none() {
        log::error!("mpu: {:#010x} is not a subregion boundary", base);
        return Err(KernelError::InvalidAddress(base));
    }
    let end = match base.checked_add(size) {
        Some(end) if size > 0 => end,
        _ => {
            log::error!("mpu: unsupported window size {:#x}", size);
            return Err(KernelError::UnsupportedSize(size));
        }
    };

    let mut bits = 0u64;
    let mut addr = base;
    while addr < end {
        let sub = Subregion::containing(addr).ok_or(KernelError::InvalidAddress(addr))?;
        bits |= 1 << sub.bit();
        addr = sub.base() + sub.size();
    }
    if addr != end {
        log::error!("mpu: size {:#x} at {:#010x} is not subregion-aligned", size, base);
        return Err(KernelError::UnsupportedSize(size));
    }
    Ok(bits)
}

// ---------------------------------------------------------------------------
// Register encoding
// ---------------------------------------------------------------------------

bitflags! {
    /// Single-bit fields of the Region Attribute and Size Register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rasr: u32 {
        const ENABLE = 1 << 0;
        const B = 1 << 16;
        const C = 1 << 17;
        const S = 1 << 18;
        const XN = 1 << 28;
    }
}

bitflags! {
    /// MPU Control Register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ctrl: u32 {
        const ENABLE = 1 << 0;
        const HFNMIENA = 1 << 1;
        const PRIVDEFENA = 1 << 2;
    }
}

/// RW for privileged and unprivileged code.
pub const AP_FULL_ACCESS: u32 = 0b011;

const AP_SHIFT: u32 = 24;
const SRD_SHIFT: u32 = 8;
const SRD_FIELD: u32 = 0xFF << SRD_SHIFT;
const RBAR_VALID: u32 = 1 << 4;

/// MPU region number of heap region 0.
pub const FIRST_HEAP_REGION: u8 = 2;

/// Number of MPU regions the kernel programs.
pub const NUM_MPU_REGIONS: usize = FIRST_HEAP_REGION as usize + NUM_REGIONS;

const FLASH_BASE: u32 = 0x0000_0000;
const FLASH_SIZE: u32 = 256 * 1024;
const PERIPHERAL_BASE: u32 = 0x4000_0000;
const PERIPHERAL_SIZE: u32 = 64 * 1024 * 1024;

/// RBAR/RASR pair for one MPU region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct RegionConfig {
    pub rbar: u32,
    pub rasr: u32,
}

impl RegionConfig {
    /// Encode region `number` covering `size` bytes (a power of two, at
    /// least 32) from `base`. The RBAR carries VALID so one write selects
    /// the region.
    pub fn new(number: u8, base: u32, size: u32, flags: Rasr, srd: u8) -> Self {
        // SIZE field is log2(size) - 1
        let l2size = 30 - size.leading_zeros();
        Self {
            rbar: base | RBAR_VALID | number as u32,
            rasr: flags.bits()
                | AP_FULL_ACCESS << AP_SHIFT
                | (srd as u32) << SRD_SHIFT
                | l2size << 1,
        }
    }

    /// The same region with a different SRD field.
    pub fn with_srd(self, srd: u8) -> Self {
        Self {
            rbar: self.rbar,
            rasr: (self.rasr & !SRD_FIELD) | (srd as u32) << SRD_SHIFT,
        }
    }

    pub fn srd(&self) -> u8 {
        ((self.rasr & SRD_FIELD) >> SRD_SHIFT) as u8
    }
}

/// Configuration for heap region `region` under the SRD byte `srd`.
pub fn heap_region(region: usize, srd: u8) -> RegionConfig {
    let layout = REGIONS[region];
    RegionConfig::new(
        FIRST_HEAP_REGION + region as u8,
        layout.base,
        layout.size,
        Rasr::ENABLE | Rasr::S | Rasr::C | Rasr::XN,
        srd,
    )
}

/// The full boot-time region layout, every heap subregion disabled.
pub fn boot_layout() -> [RegionConfig; NUM_MPU_REGIONS] {
    let mut layout = [RegionConfig { rbar: 0, rasr: 0 }; NUM_MPU_REGIONS];
    layout[0] = RegionConfig::new(0, FLASH_BASE, FLASH_SIZE, Rasr::ENABLE | Rasr::C, 0);
    layout[1] = RegionConfig::new(
        1,
        PERIPHERAL_BASE,
        PERIPHERAL_SIZE,
        Rasr::ENABLE | Rasr::S | Rasr::B | Rasr::XN,
        0,
    );
    for region in 0..NUM_REGIONS {
        layout[FIRST_HEAP_REGION as usize + region] =
            heap_region(region, SrdMask::NO_ACCESS.region_srd(region));
    }
    layout
}

/// CTRL value: MPU on, privileged background map.
pub fn control() -> Ctrl {
    Ctrl::ENABLE | Ctrl::PRIVDEFENA
}

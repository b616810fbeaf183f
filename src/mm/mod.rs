//! # Memory Management
//!
//! The task heap is the 28 KiB of SRAM above the 4 KiB OS region. It is
//! covered by five MPU regions, each split into eight subregions:
//!
//! ```text
//!  0x2000_1000  R0   4 KiB   8 × 512 B
//!  0x2000_2000  R1   8 KiB   8 × 1024 B
//!  0x2000_4000  R2   8 KiB   8 × 1024 B   ─┐ overflow
//!  0x2000_6000  R3   4 KiB   8 × 512 B    ◄┘
//!  0x2000_7000  R4   4 KiB   8 × 512 B
//!  0x2000_8000  end of SRAM (PSP_BASE)
//! ```
//!
//! - [`region`] hands out subregion-aligned blocks from this map.
//! - [`mpu`] turns blocks into per-task subregion-disable masks and encodes
//!   the MPU region registers.

pub mod mpu;
pub mod region;

/// First byte of the task heap.
pub const HEAP_START: u32 = 0x2000_1000;

/// One past the last byte of the task heap (top of SRAM).
pub const HEAP_END: u32 = 0x2000_8000;

/// Number of MPU regions covering the heap.
pub const NUM_REGIONS: usize = 5;

/// Subregions per MPU region (architectural).
pub const SUBREGIONS_PER_REGION: usize = 8;

/// Subregion size of a 4 KiB region.
pub const BLOCK_512: u32 = 0x200;

/// Subregion size of an 8 KiB region.
pub const BLOCK_1024: u32 = 0x400;

/// Size of a small region.
pub const REGION_4K: u32 = 0x1000;

/// Size of a large region.
pub const REGION_8K: u32 = 0x2000;

/// Largest single allocation.
pub const MAX_ALLOCATION: u32 = REGION_8K;

/// Static description of one heap region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapRegion {
    /// Base address, aligned to `size`.
    pub base: u32,
    /// Region size in bytes (power of two).
    pub size: u32,
    /// Region a run may continue into once this one ends.
    pub overflow: Option<usize>,
}

impl HeapRegion {
    /// Subregion granularity: one eighth of the region.
    #[inline]
    pub const fn subregion_size(&self) -> u32 {
        self.size / SUBREGIONS_PER_REGION as u32
    }

    /// One past the last byte.
    #[inline]
    pub const fn end(&self) -> u32 {
        self.base + self.size
    }

    #[inline]
    pub const fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr < self.end()
    }
}

/// The heap region map, in address order.
pub const REGIONS: [HeapRegion; NUM_REGIONS] = [
    HeapRegion { base: 0x2000_1000, size: REGION_4K, overflow: None },
    HeapRegion { base: 0x2000_2000, size: REGION_8K, overflow: None },
    HeapRegion { base: 0x2000_4000, size: REGION_8K, overflow: Some(3) },
    HeapRegion { base: 0x2000_6000, size: REGION_4K, overflow: None },
    HeapRegion { base: 0x2000_7000, size: REGION_4K, overflow: None },
];

/// Search order for requests that fit one 512 B subregion.
pub const SMALL_FIRST: [usize; NUM_REGIONS] = [0, 3, 4, 1, 2];

/// Search order for larger requests: the 8 KiB regions keep big runs together.
pub const LARGE_FIRST: [usize; NUM_REGIONS] = [1, 2, 0, 3, 4];

/// Round a request up to the granularity it will be served at:
/// 512 B steps up to 512 B, 1024 B steps beyond.
#[inline]
pub const fn align_size(size: u32) -> u32 {
    if size <= BLOCK_512 {
        (size + BLOCK_512 - 1) & !(BLOCK_512 - 1)
    } else {
        (size + BLOCK_1024 - 1) & !(BLOCK_1024 - 1)
    }
}

// ---------------------------------------------------------------------------
// Subregion addressing
// ---------------------------------------------------------------------------

/// Position of one subregion: region index and slot `0..8` within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subregion {
    pub region: usize,
    pub index: usize,
}

impl Subregion {
    pub const fn new(region: usize, index: usize) -> Self {
        Self { region, index }
    }

    /// The subregion containing `addr`, if it lies in the heap.
    pub fn containing(addr: u32) -> Option<Self> {
        let region = REGIONS.iter().position(|r| r.contains(addr))?;
        let layout = REGIONS[region];
        let index = ((addr - layout.base) / layout.subregion_size()) as usize;
        Some(Self { region, index })
    }

    /// The subregion that starts exactly at `addr`.
    pub fn starting_at(addr: u32) -> Option<Self> {
        Self::containing(addr).filter(|s| s.base() == addr)
    }

    #[inline]
    pub const fn region_layout(&self) -> HeapRegion {
        REGIONS[self.region]
    }

    #[inline]
    pub const fn size(&self) -> u32 {
        self.region_layout().subregion_size()
    }

    #[inline]
    pub const fn base(&self) -> u32 {
        self.region_layout().base + self.index as u32 * self.size()
    }

    /// Bit position in a 40-bit subregion mask.
    #[inline]
    pub const fn bit(&self) -> u32 {
        (self.region * SUBREGIONS_PER_REGION + self.index) as u32
    }

    /// The next subregion a contiguous run may use: the following slot in
    /// the same region, or slot 0 of the region's designated overflow.
    pub fn next_in_run(&self) -> Option<Self> {
        if self.index + 1 < SUBREGIONS_PER_REGION {
            Some(Self::new(self.region, self.index + 1))
        } else {
            self.region_layout().overflow.map(|r| Self::new(r, 0))
        }
    }
}

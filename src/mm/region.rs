//! # Region Allocator
//!
//! Serves subregion-aligned blocks from the five heap regions. Each region
//! keeps an 8-bit allocation bitmap plus, at the first subregion of every
//! allocation, the aligned size and the owning task. The size is all `free`
//! needs to know how many subregions to release.
//!
//! Allocation is atomic: a complete run of free subregions is found before
//! any bit is set, so a failed request leaves every bitmap untouched.

use core::iter;

use heapless::Vec;

use super::{
    align_size, Subregion, BLOCK_512, LARGE_FIRST, MAX_ALLOCATION, NUM_REGIONS, SMALL_FIRST,
    SUBREGIONS_PER_REGION,
};
use crate::error::{KernelError, Result};
use crate::task::Pid;

/// Upper bound on live allocations: one per subregion.
pub const MAX_ALLOCATIONS: usize = NUM_REGIONS * SUBREGIONS_PER_REGION;

/// A block handed out by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// First byte, always a subregion boundary.
    pub base: u32,
    /// Aligned size in bytes.
    pub size: u32,
    /// Task the block belongs to.
    pub owner: Pid,
}

/// Allocation state of one region.
#[derive(Debug, Clone, Copy)]
struct Region {
    /// Bit `i` set = subregion `i` allocated.
    allocated: u8,
    /// Aligned allocation size, recorded only at the starting subregion.
    sizes: [u32; SUBREGIONS_PER_REGION],
    /// Owner, recorded only at the starting subregion.
    owners: [Option<Pid>; SUBREGIONS_PER_REGION],
}

impl Region {
    const EMPTY: Self = Self {
        allocated: 0,
        sizes: [0; SUBREGIONS_PER_REGION],
        owners: [None; SUBREGIONS_PER_REGION],
    };
}

/// The heap allocator. One instance lives inside the kernel context.
pub struct RegionAllocator {
    regions: [Region; NUM_REGIONS],
}

impl RegionAllocator {
    pub const fn new() -> Self {
        Self {
            regions: [Region::EMPTY; NUM_REGIONS],
        }
    }

    /// Allocate `size` bytes for `owner`.
    ///
    /// The request is rounded up to 512 B or 1024 B granularity and placed
    /// at the first contiguous run of free subregions, searching the 4 KiB
    /// regions first for small requests and the 8 KiB regions first for
    /// everything else.
    pub fn allocate(&mut self, size: u32, owner: Pid) -> Result<Allocation> {
        if size == 0 || size > MAX_ALLOCATION {
            log::error!("heap: unsupported allocation size {:#x}", size);
            return Err(KernelError::UnsupportedSize(size));
        }

        let aligned = align_size(size);
        let order = if aligned <= BLOCK_512 { &SMALL_FIRST } else { &LARGE_FIRST };

        let Some(start) = order.iter().find_map(|&r| self.find_run(r, aligned)) else {
            log::warn!("heap: no contiguous {} bytes for {}", aligned, owner);
            return Err(KernelError::OutOfMemory { size });
        };

        for sub in run(start, aligned) {
            self.regions[sub.region].allocated |= 1 << sub.index;
        }
        let region = &mut self.regions[start.region];
        region.sizes[start.index] = aligned;
        region.owners[start.index] = Some(owner);

        let allocation = Allocation { base: start.base(), size: aligned, owner };
        log::debug!("heap: {:#010x}+{:#x} -> {}", allocation.base, aligned, owner);
        Ok(allocation)
    }

    /// Release the allocation starting at `base`.
    pub fn free(&mut self, base: u32) -> Result<Allocation> {
        let allocation = self.lookup(base)?;
        let start = Subregion::starting_at(base).ok_or(KernelError::InvalidAddress(base))?;

        for sub in run(start, allocation.size) {
            self.regions[sub.region].allocated &= !(1 << sub.index);
        }
        let region = &mut self.regions[start.region];
        region.sizes[start.index] = 0;
        region.owners[start.index] = None;

        log::debug!("heap: freed {:#010x}+{:#x}", base, allocation.size);
        Ok(allocation)
    }

    /// The allocation starting at `base`.
    pub fn lookup(&self, base: u32) -> Result<Allocation> {
        let start = Subregion::starting_at(base).ok_or(KernelError::InvalidAddress(base))?;
        let region = &self.regions[start.region];
        match (region.sizes[start.index], region.owners[start.index]) {
            (size, Some(owner)) if size > 0 => Ok(Allocation { base, size, owner }),
            _ => Err(KernelError::NotAllocated(base)),
        }
    }

    /// Release every allocation owned by `owner`. Returns the number freed.
    pub fn free_all(&mut self, owner: Pid) -> usize {
        let bases: Vec<u32, MAX_ALLOCATIONS> = self
            .allocations()
            .filter(|a| a.owner == owner)
            .map(|a| a.base)
            .collect();
        bases.iter().filter(|&&base| self.free(base).is_ok()).count()
    }

    /// All live allocations, in region order.
    pub fn allocations(&self) -> impl Iterator<Item = Allocation> + '_ {
        self.regions.iter().enumerate().flat_map(|(r, region)| {
            (0..SUBREGIONS_PER_REGION).filter_map(move |i| {
                let owner = region.owners[i]?;
                Some(Allocation {
                    base: Subregion::new(r, i).base(),
                    size: region.sizes[i],
                    owner,
                })
            })
        })
    }

    /// Total bytes currently held by `owner`.
    pub fn owned_bytes(&self, owner: Pid) -> u32 {
        self.allocations()
            .filter(|a| a.owner == owner)
            .map(|a| a.size)
            .sum()
    }

    /// Per-region allocation bitmaps.
    pub fn occupancy(&self) -> [u8; NUM_REGIONS] {
        let mut bitmaps = [0u8; NUM_REGIONS];
        for (bitmap, region) in bitmaps.iter_mut().zip(self.regions.iter()) {
            *bitmap = region.allocated;
        }
        bitmaps
    }

    /// Bytes in unallocated subregions.
    pub fn free_bytes(&self) -> u32 {
        (0..NUM_REGIONS)
            .flat_map(|r| (0..SUBREGIONS_PER_REGION).map(move |i| Subregion::new(r, i)))
            .filter(|s| !self.is_allocated(*s))
            .map(|s| s.size())
            .sum()
    }

    #[inline]
    pub fn is_allocated(&self, sub: Subregion) -> bool {
        self.regions[sub.region].allocated & (1 << sub.index) != 0
    }

    /// First subregion of `region` that starts a free run of `bytes`.
    fn find_run(&self, region: usize, bytes: u32) -> Option<Subregion> {
        (0..SUBREGIONS_PER_REGION)
            .map(|i| Subregion::new(region, i))
            .find(|&start| self.run_is_free(start, bytes))
    }

    fn run_is_free(&self, start: Subregion, bytes: u32) -> bool {
        let mut covered = 0;
        for sub in run(start, bytes) {
            if self.is_allocated(sub) {
                return false;
            }
            covered += sub.size();
        }
        covered >= bytes
    }
}

impl Default for RegionAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Subregions covering `bytes` from `start`, following the run order.
/// Stops early if the run reaches the end of a region with no overflow.
fn run(start: Subregion, bytes: u32) -> impl Iterator<Item = Subregion> {
    let mut covered = 0;
    iter::successors(Some(start), Subregion::next_in_run).take_while(move |sub| {
        let take = covered < bytes;
        covered += sub.size();
        take
    })
}

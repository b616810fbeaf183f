//! # Scheduler
//!
//! Task selection for SrdOS. Two policies, switchable at runtime:
//!
//! - **Round robin**: scan the task table circularly, starting after the
//!   last dispatched slot; the first Ready task wins.
//! - **Priority**: each level has a ring holding a cached rotation order of
//!   task indices, packed 4 bits per entry. Selection always serves the
//!   highest level (lowest number) with a Ready task. Within that level the
//!   ring is walked in order; when it runs out it is rebuilt by scanning the
//!   table in ascending index order, so every Ready task at the level is
//!   dispatched once per traversal.
//!
//! The scheduler only reads the task table. State transitions belong to
//! the kernel.

use crate::config::{SchedulingPolicy, MAX_TASKS, NUM_PRIORITIES};
use crate::task::TaskControlBlock;

/// Entries a ring can hold: 16 four-bit indices in a `u64`.
const RING_CAPACITY: usize = 16;

const _: () = assert!(MAX_TASKS <= RING_CAPACITY);

// ---------------------------------------------------------------------------
// Priority ring
// ---------------------------------------------------------------------------

/// Cached rotation order for one priority level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PriorityRing {
    /// Task indices, entry `n` in bits `4n..4n + 4`.
    packed: u64,
    len: u8,
    /// Next entry to dispatch.
    cursor: u8,
}

impl PriorityRing {
    const EMPTY: Self = Self { packed: 0, len: 0, cursor: 0 };

    #[inline]
    fn entry(&self, n: u8) -> usize {
        ((self.packed >> (4 * n as u32)) & 0xF) as usize
    }

    /// Rescan the table for Ready tasks at `level`, lowest index first.
    fn rebuild(&mut self, tasks: &[TaskControlBlock], level: u8) {
        *self = Self::EMPTY;
        for (i, _) in tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_ready() && t.current_priority == level)
            .take(RING_CAPACITY)
        {
            self.packed |= (i as u64) << (4 * self.len as u32);
            self.len += 1;
        }
    }

    /// Advance to the next entry that is still Ready at `level`.
    fn next_ready(&mut self, tasks: &[TaskControlBlock], level: u8) -> Option<usize> {
        while self.cursor < self.len {
            let i = self.entry(self.cursor);
            self.cursor += 1;
            if tasks
                .get(i)
                .is_some_and(|t| t.is_ready() && t.current_priority == level)
            {
                return Some(i);
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Selection state. Lives inside the kernel context next to the task table.
pub struct Scheduler {
    /// Last slot handed out, where round robin resumes.
    last: Option<usize>,
    rings: [PriorityRing; NUM_PRIORITIES],
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            last: None,
            rings: [PriorityRing::EMPTY; NUM_PRIORITIES],
        }
    }

    /// Pick the next task to run, or `None` if nothing is Ready.
    pub fn select_next(
        &mut self,
        tasks: &[TaskControlBlock],
        policy: SchedulingPolicy,
    ) -> Option<usize> {
        let next = match policy {
            SchedulingPolicy::RoundRobin => self.round_robin(tasks),
            SchedulingPolicy::Priority => self.by_priority(tasks),
        }?;
        self.last = Some(next);
        Some(next)
    }

    /// Drop every cached rotation order. Called when a priority changes so
    /// the next selection sees the new levels.
    pub fn invalidate(&mut self) {
        self.rings = [PriorityRing::EMPTY; NUM_PRIORITIES];
    }

    fn round_robin(&self, tasks: &[TaskControlBlock]) -> Option<usize> {
        let n = tasks.len();
        let start = self.last.map_or(0, |last| last + 1);
        (0..n).map(|k| (start + k) % n).find(|&i| tasks[i].is_ready())
    }

    fn by_priority(&mut self, tasks: &[TaskControlBlock]) -> Option<usize> {
        let level = tasks
            .iter()
            .filter(|t| t.is_ready())
            .map(|t| t.current_priority)
            .min()?;
        let ring = self.rings.get_mut(level as usize)?;

        match ring.next_ready(tasks, level) {
            Some(i) => Some(i),
            None => {
                ring.rebuild(tasks, level);
                ring.next_ready(tasks, level)
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

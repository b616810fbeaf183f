//! Counting semaphore with a FIFO of waiters.
//!
//! The count and the queue are never both non-zero: a task only queues when
//! the count is exhausted, and a post hands its unit straight to the oldest
//! waiter when there is one.

use heapless::Vec;

use crate::config::MAX_SEMAPHORE_QUEUE_SIZE;
use crate::error::{KernelError, Result};

/// Result of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A unit was available and taken.
    Acquired,
    /// The caller was appended to the wait queue.
    Queued,
}

#[derive(Debug, Clone)]
pub struct Semaphore {
    count: u32,
    queue: Vec<usize, MAX_SEMAPHORE_QUEUE_SIZE>,
}

impl Semaphore {
    pub const fn new(count: u32) -> Self {
        Self {
            count,
            queue: Vec::new(),
        }
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn waiters(&self) -> &[usize] {
        &self.queue
    }

    pub fn wait(&mut self, task: usize) -> Result<WaitOutcome> {
        if self.count > 0 {
            self.count -= 1;
            return Ok(WaitOutcome::Acquired);
        }
        self.queue.push(task).map_err(|_| KernelError::QueueFull)?;
        Ok(WaitOutcome::Queued)
    }

    /// Add a unit. If a task is waiting, the unit goes to it and its index
    /// is returned.
    pub fn post(&mut self) -> Option<usize> {
        self.count = self.count.saturating_add(1);
        if self.queue.is_empty() {
            return None;
        }
        self.count -= 1;
        Some(self.queue.remove(0))
    }

    /// Take `task` out of the wait queue. Returns whether it was queued.
    pub fn remove_waiter(&mut self, task: usize) -> bool {
        match self.queue.iter().position(|&t| t == task) {
            Some(pos) => {
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

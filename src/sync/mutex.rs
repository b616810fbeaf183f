//! Binary mutex with owner tracking and a FIFO of waiters.

use heapless::Vec;

use crate::config::MAX_MUTEX_QUEUE_SIZE;
use crate::error::{KernelError, Result};

/// Result of a lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The caller is now the owner.
    Acquired,
    /// The caller already held it; nothing changed.
    AlreadyOwned,
    /// The caller was appended to the wait queue.
    Queued,
}

#[derive(Debug, Clone)]
pub struct KernelMutex {
    owner: Option<usize>,
    queue: Vec<usize, MAX_MUTEX_QUEUE_SIZE>,
}

impl KernelMutex {
    pub const fn new() -> Self {
        Self {
            owner: None,
            queue: Vec::new(),
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.owner.is_some()
    }

    /// Task index holding the lock.
    #[inline]
    pub fn owner(&self) -> Option<usize> {
        self.owner
    }

    /// Blocked tasks, longest waiting first.
    pub fn waiters(&self) -> &[usize] {
        &self.queue
    }

    pub fn lock(&mut self, task: usize) -> Result<LockOutcome> {
        match self.owner {
            None => {
                self.owner = Some(task);
                Ok(LockOutcome::Acquired)
            }
            Some(owner) if owner == task => Ok(LockOutcome::AlreadyOwned),
            Some(_) => {
                self.queue.push(task).map_err(|_| KernelError::QueueFull)?;
                Ok(LockOutcome::Queued)
            }
        }
    }

    /// Release on behalf of `task`. Ownership passes to the head of the
    /// queue, which is returned so the caller can make it Ready.
    pub fn unlock(&mut self, task: usize) -> Result<Option<usize>> {
        if self.owner != Some(task) {
            return Err(KernelError::NotOwner);
        }
        if self.queue.is_empty() {
            self.owner = None;
            return Ok(None);
        }
        let next = self.queue.remove(0);
        self.owner = Some(next);
        Ok(Some(next))
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

impl Default for KernelMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_unlock_uncontended() {
        let mut m = KernelMutex::new();
        assert_eq!(m.lock(3), Ok(LockOutcome::Acquired));
        assert_eq!(m.owner(), Some(3));
        assert_eq!(m.lock(3), Ok(LockOutcome::AlreadyOwned));
        assert!(m.waiters().is_empty());
        assert_eq!(m.unlock(3), Ok(None));
        assert!(!m.is_locked());
    }

    #[test]
    fn test_ownership_passes_fifo() {
        let mut m = KernelMutex::new();
        m.lock(0).unwrap();
        assert_eq!(m.lock(1), Ok(LockOutcome::Queued));
        assert_eq!(m.lock(2), Ok(LockOutcome::Queued));
        assert_eq!(m.lock(4), Err(KernelError::QueueFull));
        assert_eq!(m.waiters(), &[1, 2]);

        assert_eq!(m.unlock(0), Ok(Some(1)));
        assert_eq!(m.owner(), Some(1));
        assert_eq!(m.waiters(), &[2]);
        assert_eq!(m.unlock(1), Ok(Some(2)));
        assert_eq!(m.unlock(2), Ok(None));
    }

    #[test]
    fn test_unlock_by_non_owner_changes_nothing() {
        let mut m = KernelMutex::new();
        assert_eq!(m.unlock(0), Err(KernelError::NotOwner));
        m.lock(0).unwrap();
        m.lock(1).unwrap();
        assert_eq!(m.unlock(1), Err(KernelError::NotOwner));
        assert_eq!(m.owner(), Some(0));
        assert_eq!(m.waiters(), &[1]);
    }

    #[test]
    fn test_remove_waiter() {
        let mut m = KernelMutex::new();
        m.lock(0).unwrap();
        m.lock(1).unwrap();
        m.lock(2).unwrap();
        assert!(m.remove_waiter(1));
        assert!(!m.remove_waiter(1));
        assert_eq!(m.waiters(), &[2]);
    }
}

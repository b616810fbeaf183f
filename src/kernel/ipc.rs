//! Mutex and semaphore calls made by the running task.
//!
//! A blocking call marks the caller and requests a switch; the actual
//! hand-over happens in the next PendSV. Releasing calls make the woken
//! task Ready and only request a switch when, under priority scheduling,
//! the woken task outranks the caller.
//!
//! With priority inheritance on, a task that blocks on a mutex lends its
//! current priority to the owner. An owner always runs at the best of its
//! static priority and the priorities of the waiters on every mutex it
//! holds, recomputed whenever a waiter or an owner comes or goes.

use super::Kernel;
use crate::config::{SchedulingPolicy, MAX_TASKS};
use crate::error::{KernelError, Result};
use crate::port::Port;
use crate::sync::{KernelMutex, LockOutcome, Semaphore, WaitOutcome};
use crate::task::{BlockedOn, TaskState};

impl Kernel {
    /// Acquire `mutex` for the running task, blocking if it is held.
    ///
    /// Always requests a switch. If the wait queue is full the caller stays
    /// Ready and [`KernelError::QueueFull`] tells the trap layer to replay
    /// the call.
    pub fn lock(&mut self, port: &mut impl Port, mutex: u8) -> Result<()> {
        let current = self.current_index()?;
        let outcome = self.mutex_mut(mutex)?.lock(current);
        port.pend_context_switch();

        match outcome {
            Ok(LockOutcome::Acquired) | Ok(LockOutcome::AlreadyOwned) => Ok(()),
            Ok(LockOutcome::Queued) => {
                let tcb = &mut self.tasks[current];
                tcb.state = TaskState::BlockedOnMutex;
                tcb.blocked_on = Some(BlockedOn::Mutex(mutex));
                if let Some(owner) = self.mutexes[mutex as usize].owner() {
                    self.refresh_priority(owner);
                }
                Ok(())
            }
            Err(e) => {
                log::warn!("lock {}: '{}': {}", mutex, self.tasks[current].name(), e);
                Err(e)
            }
        }
    }

    /// Release `mutex`. Only the owner may; anyone else is refused and the
    /// mutex is left untouched.
    pub fn unlock(&mut self, port: &mut impl Port, mutex: u8) -> Result<()> {
        let current = self.current_index()?;
        let released = self.mutex_mut(mutex)?.unlock(current);
        let next = match released {
            Ok(next) => next,
            Err(e) => {
                log::warn!("unlock {}: '{}' is not the owner", mutex, self.tasks[current].name());
                return Err(e);
            }
        };

        self.refresh_priority(current);
        if let Some(next) = next {
            self.wake(next);
            self.refresh_priority(next);
            self.preempt_if_outranked(port, current, next);
        }
        Ok(())
    }

    /// Take a unit of `semaphore`, blocking if none is left.
    pub fn wait(&mut self, port: &mut impl Port, semaphore: u8) -> Result<()> {
        let current = self.current_index()?;
        let outcome = self.semaphore_mut(semaphore)?.wait(current);
        match outcome {
            Ok(WaitOutcome::Acquired) => Ok(()),
            Ok(WaitOutcome::Queued) => {
                let tcb = &mut self.tasks[current];
                tcb.state = TaskState::BlockedOnSemaphore;
                tcb.blocked_on = Some(BlockedOn::Semaphore(semaphore));
                port.pend_context_switch();
                Ok(())
            }
            Err(e) => {
                log::warn!("wait {}: '{}': {}", semaphore, self.tasks[current].name(), e);
                port.pend_context_switch();
                Err(e)
            }
        }
    }

    /// Give a unit back to `semaphore`, waking the oldest waiter if any.
    pub fn post(&mut self, port: &mut impl Port, semaphore: u8) -> Result<()> {
        let current = self.current_index()?;
        if let Some(next) = self.semaphore_mut(semaphore)?.post() {
            self.wake(next);
            self.preempt_if_outranked(port, current, next);
        }
        Ok(())
    }

    /// Recompute the running priority of `index`: its static priority,
    /// improved under inheritance by the waiters of every mutex it owns.
    ///
    /// A change is passed on to the owner of the mutex `index` is blocked
    /// on, so chains of owners settle in one call.
    pub(super) fn refresh_priority(&mut self, index: usize) {
        let mut index = index;
        for _ in 0..MAX_TASKS {
            let effective = self.effective_priority(index);
            let tcb = &mut self.tasks[index];
            if effective == tcb.current_priority {
                return;
            }
            log::debug!(
                "'{}' runs at priority {} (static {})",
                tcb.name(),
                effective,
                tcb.priority
            );
            tcb.current_priority = effective;
            self.scheduler.invalidate();

            let holder = match self.tasks[index].blocked_on {
                Some(BlockedOn::Mutex(m)) => {
                    self.mutexes.get(m as usize).and_then(KernelMutex::owner)
                }
                _ => None,
            };
            match holder {
                Some(owner) if owner != index => index = owner,
                _ => return,
            }
        }
    }

    fn effective_priority(&self, index: usize) -> u8 {
        let base = self.tasks[index].priority;
        if !self.options.priority_inheritance {
            return base;
        }
        self.mutexes
            .iter()
            .filter(|m| m.owner() == Some(index))
            .flat_map(|m| m.waiters().iter())
            .map(|&w| self.tasks[w].current_priority)
            .fold(base, u8::min)
    }

    fn preempt_if_outranked(&mut self, port: &mut impl Port, current: usize, woken: usize) {
        if self.options.policy == SchedulingPolicy::Priority
            && self.tasks[woken].current_priority < self.tasks[current].current_priority
        {
            port.pend_context_switch();
        }
    }

    fn mutex_mut(&mut self, mutex: u8) -> Result<&mut KernelMutex> {
        self.mutexes
            .get_mut(mutex as usize)
            .ok_or(KernelError::InvalidMutex(mutex))
    }

    fn semaphore_mut(&mut self, semaphore: u8) -> Result<&mut Semaphore> {
        self.semaphores
            .get_mut(semaphore as usize)
            .ok_or(KernelError::InvalidSemaphore(semaphore))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{entry, started, switch};
    use super::*;
    use crate::testing::MockPort;

    /// Make `index` the running task.
    fn run(kernel: &mut Kernel, port: &mut MockPort, index: usize) {
        for _ in 0..crate::config::MAX_TASKS {
            if switch(kernel, port) == index {
                port.take_pended();
                return;
            }
        }
        panic!("task {} never scheduled", index);
    }

    #[test]
    fn test_mutex_contention_end_to_end() {
        let (mut kernel, mut port) = started(&[15, 5, 5]);
        kernel.init_mutex(0).unwrap();

        run(&mut kernel, &mut port, 1);
        kernel.lock(&mut port, 0).unwrap();
        assert_eq!(kernel.mutex(0).unwrap().owner(), Some(1));
        assert_eq!(port.take_pended(), 1, "lock always yields");

        run(&mut kernel, &mut port, 2);
        kernel.lock(&mut port, 0).unwrap();
        assert_eq!(kernel.tasks()[2].state, TaskState::BlockedOnMutex);
        assert_eq!(kernel.tasks()[2].blocked_on, Some(BlockedOn::Mutex(0)));
        assert_eq!(kernel.mutex(0).unwrap().waiters(), &[2]);

        run(&mut kernel, &mut port, 1);
        kernel.unlock(&mut port, 0).unwrap();
        assert_eq!(kernel.tasks()[2].state, TaskState::Ready);
        assert_eq!(kernel.tasks()[2].blocked_on, None);
        assert_eq!(kernel.mutex(0).unwrap().owner(), Some(2));
    }

    #[test]
    fn test_unlock_by_non_owner_is_refused() {
        let (mut kernel, mut port) = started(&[15, 5, 5]);
        run(&mut kernel, &mut port, 1);
        kernel.lock(&mut port, 0).unwrap();
        run(&mut kernel, &mut port, 2);
        assert_eq!(kernel.unlock(&mut port, 0), Err(KernelError::NotOwner));
        assert_eq!(kernel.mutex(0).unwrap().owner(), Some(1));
        assert_eq!(kernel.lock(&mut port, 1), Err(KernelError::InvalidMutex(1)));
    }

    #[test]
    fn test_lock_queue_full() {
        let (mut kernel, mut port) = started(&[15, 5, 5, 5, 5]);
        for i in 1..=3 {
            run(&mut kernel, &mut port, i);
            kernel.lock(&mut port, 0).unwrap();
        }
        run(&mut kernel, &mut port, 4);
        assert_eq!(kernel.lock(&mut port, 0), Err(KernelError::QueueFull));
        assert_eq!(kernel.tasks()[4].state, TaskState::Ready);
        assert_eq!(port.take_pended(), 1);
    }

    #[test]
    fn test_priority_inheritance() {
        let (mut kernel, mut port) = started(&[15, 9, 2]);
        kernel.set_priority_inheritance(true);
        kernel.sleep_task_for_test(2, 5);

        run(&mut kernel, &mut port, 1);
        kernel.lock(&mut port, 0).unwrap();
        kernel.tasks[2].state = TaskState::Ready;

        run(&mut kernel, &mut port, 2);
        kernel.lock(&mut port, 0).unwrap();
        assert_eq!(kernel.tasks()[1].current_priority, 2);
        assert_eq!(switch(&mut kernel, &mut port), 1);
        port.take_pended();

        kernel.unlock(&mut port, 0).unwrap();
        assert_eq!(kernel.tasks()[1].current_priority, 9);
        assert_eq!(port.take_pended(), 1, "woken owner outranks caller");
        assert_eq!(switch(&mut kernel, &mut port), 2);
    }

    #[test]
    fn test_static_priority_change_keeps_inherited_boost() {
        let (mut kernel, mut port) = started(&[15, 9, 2]);
        kernel.set_priority_inheritance(true);
        kernel.sleep_task_for_test(2, 5);
        run(&mut kernel, &mut port, 1);
        kernel.lock(&mut port, 0).unwrap();
        kernel.tasks[2].state = TaskState::Ready;
        run(&mut kernel, &mut port, 2);
        kernel.lock(&mut port, 0).unwrap();
        assert_eq!(kernel.tasks()[1].current_priority, 2);

        kernel.set_thread_priority(entry(1), 10).unwrap();
        assert_eq!(kernel.tasks()[1].priority, 10);
        assert_eq!(kernel.tasks()[1].current_priority, 2);
        kernel.set_thread_priority(entry(1), 1).unwrap();
        assert_eq!(kernel.tasks()[1].current_priority, 1);
        kernel.set_thread_priority(entry(1), 10).unwrap();
        assert_eq!(kernel.tasks()[1].current_priority, 2);

        run(&mut kernel, &mut port, 1);
        kernel.unlock(&mut port, 0).unwrap();
        assert_eq!(kernel.tasks()[1].current_priority, 10);
    }

    #[test]
    fn test_waiter_priority_change_reaches_owner() {
        let (mut kernel, mut port) = started(&[15, 9, 4]);
        kernel.set_priority_inheritance(true);
        kernel.sleep_task_for_test(2, 5);
        run(&mut kernel, &mut port, 1);
        kernel.lock(&mut port, 0).unwrap();
        kernel.tasks[2].state = TaskState::Ready;
        run(&mut kernel, &mut port, 2);
        kernel.lock(&mut port, 0).unwrap();
        assert_eq!(kernel.tasks()[1].current_priority, 4);

        kernel.set_thread_priority(entry(2), 0).unwrap();
        assert_eq!(kernel.tasks()[1].current_priority, 0);
        kernel.set_thread_priority(entry(2), 12).unwrap();
        assert_eq!(kernel.tasks()[1].current_priority, 9);
    }

    #[test]
    fn test_stopping_waiter_withdraws_lent_priority() {
        let (mut kernel, mut port) = started(&[15, 9, 2]);
        kernel.set_priority_inheritance(true);
        kernel.sleep_task_for_test(2, 5);
        run(&mut kernel, &mut port, 1);
        kernel.lock(&mut port, 0).unwrap();
        kernel.tasks[2].state = TaskState::Ready;
        run(&mut kernel, &mut port, 2);
        kernel.lock(&mut port, 0).unwrap();
        assert_eq!(kernel.tasks()[1].current_priority, 2);

        kernel.stop_thread(&mut port, entry(2)).unwrap();
        assert!(kernel.mutex(0).unwrap().waiters().is_empty());
        assert_eq!(kernel.mutex(0).unwrap().owner(), Some(1));
        assert_eq!(kernel.tasks()[1].current_priority, 9);
    }

    #[test]
    fn test_stopping_owner_passes_boost_to_new_owner() {
        let (mut kernel, mut port) = started(&[15, 9, 8, 1]);
        kernel.set_priority_inheritance(true);
        kernel.sleep_task_for_test(2, 5);
        kernel.sleep_task_for_test(3, 5);
        run(&mut kernel, &mut port, 1);
        kernel.lock(&mut port, 0).unwrap();
        kernel.tasks[2].state = TaskState::Ready;
        run(&mut kernel, &mut port, 2);
        kernel.lock(&mut port, 0).unwrap();
        kernel.tasks[3].state = TaskState::Ready;
        run(&mut kernel, &mut port, 3);
        kernel.lock(&mut port, 0).unwrap();
        assert_eq!(kernel.tasks()[1].current_priority, 1);

        kernel.stop_thread(&mut port, entry(1)).unwrap();
        assert_eq!(kernel.mutex(0).unwrap().owner(), Some(2));
        assert_eq!(kernel.mutex(0).unwrap().waiters(), &[3]);
        assert_eq!(kernel.tasks()[2].state, TaskState::Ready);
        assert_eq!(kernel.tasks()[2].current_priority, 1);
        assert_eq!(kernel.tasks()[1].current_priority, 9);
    }

    #[test]
    fn test_inheritance_off_keeps_priorities() {
        let (mut kernel, mut port) = started(&[15, 9, 2]);
        kernel.sleep_task_for_test(2, 5);
        run(&mut kernel, &mut port, 1);
        kernel.lock(&mut port, 0).unwrap();
        kernel.tasks[2].state = TaskState::Ready;
        run(&mut kernel, &mut port, 2);
        kernel.lock(&mut port, 0).unwrap();
        assert_eq!(kernel.tasks()[1].current_priority, 9);
    }

    #[test]
    fn test_semaphore_wait_and_post() {
        let (mut kernel, mut port) = started(&[15, 5, 5]);
        kernel.init_semaphore(1, 1).unwrap();

        run(&mut kernel, &mut port, 1);
        kernel.wait(&mut port, 1).unwrap();
        assert_eq!(port.take_pended(), 0, "unit available, no switch");
        kernel.wait(&mut port, 1).unwrap();
        assert_eq!(kernel.tasks()[1].state, TaskState::BlockedOnSemaphore);
        assert_eq!(port.take_pended(), 1);

        run(&mut kernel, &mut port, 2);
        kernel.post(&mut port, 1).unwrap();
        assert_eq!(kernel.tasks()[1].state, TaskState::Ready);
        assert_eq!(kernel.semaphore(1).unwrap().count(), 0);
        kernel.post(&mut port, 1).unwrap();
        assert_eq!(kernel.semaphore(1).unwrap().count(), 1);
        assert_eq!(kernel.post(&mut port, 7), Err(KernelError::InvalidSemaphore(7)));
    }

    #[test]
    fn test_stop_hands_mutex_to_waiter_and_dequeues() {
        let (mut kernel, mut port) = started(&[15, 5, 5, 5]);
        kernel.init_semaphore(0, 0).unwrap();
        for i in 1..=2 {
            run(&mut kernel, &mut port, i);
            kernel.lock(&mut port, 0).unwrap();
        }
        run(&mut kernel, &mut port, 3);
        kernel.wait(&mut port, 0).unwrap();

        kernel.stop_thread(&mut port, entry(1)).unwrap();
        assert_eq!(kernel.mutex(0).unwrap().owner(), Some(2));
        assert_eq!(kernel.tasks()[2].state, TaskState::Ready);

        kernel.stop_thread(&mut port, entry(3)).unwrap();
        assert!(kernel.semaphore(0).unwrap().waiters().is_empty());
    }

    impl Kernel {
        fn sleep_task_for_test(&mut self, index: usize, ticks: u32) {
            self.tasks[index].state = TaskState::Delayed;
            self.tasks[index].ticks = ticks;
        }
    }
}

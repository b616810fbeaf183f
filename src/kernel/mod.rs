//! # Kernel
//!
//! The single kernel context: task table, scheduler state, heap allocator,
//! mutexes, semaphores and runtime options. Every exception handler takes
//! one exclusive borrow of it, so each operation here runs to completion
//! without interference.
//!
//! Hardware effects go through a [`Port`], which keeps this module testable
//! on the host.
//!
//! ## Task Lifecycle
//!
//! ```text
//! create_thread ─► Ready ◄─► Delayed / BlockedOn{Mutex,Semaphore}
//!                    │
//!         stop / kill│                 restart
//!                    ▼            ┌──────────────► Ready
//!                 Stopped ────────┤
//!                                 └──────────────► Invalid ─► Ready
//!                                  slot reclaimed by create_thread
//! ```
//!
//! - [`ipc`]: lock, unlock, wait, post and priority inheritance
//! - [`memory`]: the task heap service
//! - [`status`]: process, IPC and memory reports, kill by pid or name
//! - [`svc`]: service-call decoding and dispatch

pub mod ipc;
pub mod memory;
pub mod status;
pub mod svc;

use crate::config::{
    SchedulerOptions, SchedulingPolicy, MAX_MUTEXES, MAX_SEMAPHORES, MAX_TASKS, NUM_PRIORITIES,
};
use crate::error::{KernelError, Result};
use crate::mm::mpu::SrdMask;
use crate::mm::region::{Allocation, RegionAllocator};
use crate::port::Port;
use crate::scheduler::Scheduler;
use crate::sync::{KernelMutex, Semaphore};
use crate::task::{EntryPoint, InitialFrame, Pid, TaskControlBlock, TaskState};

/// The kernel context.
pub struct Kernel {
    tasks: [TaskControlBlock; MAX_TASKS],
    /// Slot of the running task; `None` until the first switch.
    current: Option<usize>,
    next_pid: u32,
    scheduler: Scheduler,
    options: SchedulerOptions,
    heap: RegionAllocator,
    mutexes: [KernelMutex; MAX_MUTEXES],
    semaphores: [Semaphore; MAX_SEMAPHORES],
    tick_count: u64,
    started: bool,
}

impl Kernel {
    pub const fn new() -> Self {
        const MUTEX: KernelMutex = KernelMutex::new();
        const SEMAPHORE: Semaphore = Semaphore::new(0);
        Self {
            tasks: [TaskControlBlock::EMPTY; MAX_TASKS],
            current: None,
            next_pid: 1,
            scheduler: Scheduler::new(),
            options: SchedulerOptions::new(),
            heap: RegionAllocator::new(),
            mutexes: [MUTEX; MAX_MUTEXES],
            semaphores: [SEMAPHORE; MAX_SEMAPHORES],
            tick_count: 0,
            started: false,
        }
    }

    // -----------------------------------------------------------------------
    // Primitive setup
    // -----------------------------------------------------------------------

    pub fn init_mutex(&mut self, mutex: u8) -> Result<()> {
        let slot = self
            .mutexes
            .get_mut(mutex as usize)
            .ok_or(KernelError::InvalidMutex(mutex))?;
        *slot = KernelMutex::new();
        Ok(())
    }

    pub fn init_semaphore(&mut self, semaphore: u8, count: u32) -> Result<()> {
        let slot = self
            .semaphores
            .get_mut(semaphore as usize)
            .ok_or(KernelError::InvalidSemaphore(semaphore))?;
        *slot = Semaphore::new(count);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Task lifecycle
    // -----------------------------------------------------------------------

    /// Register a task and make it Ready.
    ///
    /// Takes the first Invalid slot, or reclaims the first Stopped one when
    /// the table has no free slot. The stack comes from the heap allocator
    /// and is the only memory the new task may touch.
    pub fn create_thread(
        &mut self,
        port: &mut impl Port,
        entry: EntryPoint,
        name: &str,
        priority: u8,
        stack_bytes: u32,
    ) -> Result<Pid> {
        check_priority(priority)?;
        if self.tasks.iter().any(|t| t.is_live() && t.entry == entry) {
            log::warn!("create_thread: {:#010x} already registered", entry.addr());
            return Err(KernelError::DuplicateTask);
        }

        let slot = self
            .tasks
            .iter()
            .position(|t| t.state == TaskState::Invalid)
            .or_else(|| self.tasks.iter().position(|t| t.state == TaskState::Stopped))
            .ok_or_else(|| {
                log::warn!("create_thread: task table full");
                KernelError::TaskTableFull
            })?;

        let pid = Pid::new(self.next_pid);
        let (stack, srd) = self.allocate_stack(pid, stack_bytes)?;
        self.next_pid += 1;

        let tcb = &mut self.tasks[slot];
        *tcb = TaskControlBlock::EMPTY;
        tcb.pid = pid;
        tcb.entry = entry;
        tcb.priority = priority;
        tcb.current_priority = priority;
        tcb.stack_request = stack_bytes;
        tcb.set_name(name);
        self.launch(port, slot, stack, srd);

        log::info!(
            "created '{}' ({}) prio {} stack {:#010x}+{:#x}",
            name,
            pid,
            priority,
            stack.base,
            stack.size
        );
        Ok(pid)
    }

    /// Stop the task registered for `entry`, releasing everything it holds.
    pub fn stop_thread(&mut self, port: &mut impl Port, entry: EntryPoint) -> Result<()> {
        let index = self.find_by_entry(entry)?;
        self.stop_index(port, index)
    }

    /// Bring a Stopped task back with a fresh stack, keeping its pid, name
    /// and priority.
    pub fn restart_thread(&mut self, port: &mut impl Port, entry: EntryPoint) -> Result<()> {
        let index = self.find_by_entry(entry)?;
        if self.tasks[index].state != TaskState::Stopped {
            log::warn!("restart: '{}' is {}", self.tasks[index].name(), self.tasks[index].state);
            return Err(KernelError::InvalidState);
        }
        let pid = self.tasks[index].pid;
        let (stack, srd) = self.allocate_stack(pid, self.tasks[index].stack_request)?;
        self.launch(port, index, stack, srd);
        log::info!("restarted '{}' ({})", self.tasks[index].name(), pid);
        Ok(())
    }

    /// Change the static priority of the task registered for `entry`.
    ///
    /// A priority inherited from mutex waiters stays in force while it is
    /// the better of the two.
    pub fn set_thread_priority(&mut self, entry: EntryPoint, priority: u8) -> Result<()> {
        check_priority(priority)?;
        let index = self.find_by_entry(entry)?;
        self.tasks[index].priority = priority;
        self.refresh_priority(index);
        self.scheduler.invalidate();
        log::info!("'{}' priority -> {}", self.tasks[index].name(), priority);
        Ok(())
    }

    pub(crate) fn stop_index(&mut self, port: &mut impl Port, index: usize) -> Result<()> {
        let state = self.tasks[index].state;
        if matches!(state, TaskState::Invalid | TaskState::Stopped) {
            return Err(KernelError::InvalidState);
        }
        let others_ready = self
            .tasks
            .iter()
            .enumerate()
            .any(|(i, t)| i != index && t.is_ready());
        if self.started && !others_ready {
            log::warn!("stop: '{}' is the last Ready task", self.tasks[index].name());
            return Err(KernelError::InvalidState);
        }
        let pid = self.tasks[index].pid;

        for m in 0..MAX_MUTEXES {
            self.mutexes[m].remove_waiter(index);
            if self.mutexes[m].owner() == Some(index) {
                // owner check above makes this infallible
                if let Ok(Some(next)) = self.mutexes[m].unlock(index) {
                    self.wake(next);
                }
            }
        }
        for s in self.semaphores.iter_mut() {
            s.remove_waiter(index);
        }
        let freed = self.heap.free_all(pid);

        let tcb = &mut self.tasks[index];
        tcb.state = TaskState::Stopped;
        tcb.stack = None;
        tcb.srd = SrdMask::NO_ACCESS;
        tcb.blocked_on = None;
        tcb.ticks = 0;
        tcb.sp = 0;
        tcb.sp_init = 0;
        tcb.current_priority = tcb.priority;
        log::info!("stopped '{}' ({}), {} blocks released", tcb.name(), pid, freed);

        // lent priorities may have left with the task, or moved to a new owner
        for m in 0..MAX_MUTEXES {
            if let Some(owner) = self.mutexes[m].owner() {
                self.refresh_priority(owner);
            }
        }
        if self.current == Some(index) {
            port.pend_context_switch();
        }
        Ok(())
    }

    /// Allocate a stack owned by `pid` and the mask granting it.
    fn allocate_stack(&mut self, pid: Pid, bytes: u32) -> Result<(Allocation, SrdMask)> {
        let stack = self.heap.allocate(bytes, pid)?;
        let mut srd = SrdMask::NO_ACCESS;
        if let Err(e) = srd.grant(stack.base, stack.size) {
            self.heap.free(stack.base)?;
            return Err(e);
        }
        Ok((stack, srd))
    }

    /// Write the initial frame at the top of `stack` and mark the slot Ready.
    fn launch(&mut self, port: &mut impl Port, index: usize, stack: Allocation, srd: SrdMask) {
        let tcb = &mut self.tasks[index];
        tcb.sp_init = stack.base + stack.size;
        tcb.sp = tcb.sp_init - InitialFrame::SIZE;
        port.write_initial_frame(tcb.sp, &InitialFrame::new(tcb.entry));
        tcb.stack = Some(stack);
        tcb.srd = srd;
        tcb.ticks = 0;
        tcb.blocked_on = None;
        tcb.state = TaskState::Ready;
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Hand the CPU to the scheduler for the first time.
    pub fn start(&mut self, port: &mut impl Port) -> Result<()> {
        if self.started {
            return Err(KernelError::InvalidState);
        }
        if !self.tasks.iter().any(|t| t.is_ready()) {
            log::error!("start: no runnable task");
            return Err(KernelError::NoRunnableTask);
        }
        self.started = true;
        port.enter_unprivileged();
        port.pend_context_switch();
        log::info!("scheduler started ({:?})", self.options.policy);
        Ok(())
    }

    /// Timer tick: age sleeping tasks, request a switch when preemptive.
    pub fn tick(&mut self, port: &mut impl Port) {
        self.tick_count += 1;
        for tcb in self.tasks.iter_mut().filter(|t| t.state == TaskState::Delayed) {
            tcb.ticks = tcb.ticks.saturating_sub(1);
            if tcb.ticks == 0 {
                tcb.state = TaskState::Ready;
            }
        }
        if self.started && self.options.preemption {
            port.pend_context_switch();
        }
    }

    /// Save the outgoing stack pointer, pick the next task, commit its mask
    /// and return the stack pointer to restore.
    ///
    /// With nothing Ready the outgoing task is resumed. A task stopped while
    /// running has no stack left, so its `psp` is dropped.
    pub fn context_switch(&mut self, port: &mut impl Port, psp: u32) -> u32 {
        if let Some(current) = self.current {
            let tcb = &mut self.tasks[current];
            if tcb.is_live() && tcb.state != TaskState::Stopped {
                tcb.sp = psp;
            }
        }
        match self.scheduler.select_next(&self.tasks, self.options.policy) {
            Some(next) => {
                if self.current != Some(next) {
                    log::trace!("switch -> '{}'", self.tasks[next].name());
                }
                self.current = Some(next);
                let tcb = &self.tasks[next];
                port.apply_srd_mask(tcb.srd);
                tcb.sp
            }
            None => {
                log::error!("no runnable task, resuming current");
                psp
            }
        }
    }

    pub fn yield_now(&mut self, port: &mut impl Port) -> Result<()> {
        self.current_index()?;
        port.pend_context_switch();
        Ok(())
    }

    /// Put the caller to sleep for `ticks` timer ticks. Zero just yields.
    pub fn sleep(&mut self, port: &mut impl Port, ticks: u32) -> Result<()> {
        let current = self.current_index()?;
        if ticks > 0 {
            let tcb = &mut self.tasks[current];
            tcb.ticks = ticks;
            tcb.state = TaskState::Delayed;
        }
        port.pend_context_switch();
        Ok(())
    }

    pub fn reboot(&mut self, port: &mut impl Port) {
        log::info!("reboot requested");
        port.system_reset();
    }

    // -----------------------------------------------------------------------
    // Options
    // -----------------------------------------------------------------------

    pub fn set_policy(&mut self, policy: SchedulingPolicy) {
        self.options.policy = policy;
        self.scheduler.invalidate();
        log::info!("scheduler: {:?}", policy);
    }

    pub fn set_preemption(&mut self, on: bool) {
        self.options.preemption = on;
        log::info!("preemption {}", if on { "on" } else { "off" });
    }

    /// Switching inheritance off drops every boosted priority.
    pub fn set_priority_inheritance(&mut self, on: bool) {
        self.options.priority_inheritance = on;
        if !on {
            for tcb in self.tasks.iter_mut() {
                tcb.current_priority = tcb.priority;
            }
            self.scheduler.invalidate();
        }
        log::info!("priority inheritance {}", if on { "on" } else { "off" });
    }

    // -----------------------------------------------------------------------
    // Lookup and accessors
    // -----------------------------------------------------------------------

    pub fn find_by_entry(&self, entry: EntryPoint) -> Result<usize> {
        self.find(|t| t.entry == entry)
    }

    pub fn find_by_pid(&self, pid: Pid) -> Result<usize> {
        self.find(|t| t.pid == pid)
    }

    pub fn find_by_name(&self, name: &str) -> Result<usize> {
        self.find(|t| t.name() == name)
    }

    fn find(&self, pred: impl Fn(&TaskControlBlock) -> bool) -> Result<usize> {
        self.tasks
            .iter()
            .position(|t| t.is_live() && pred(t))
            .ok_or(KernelError::NoSuchTask)
    }

    pub fn current_index(&self) -> Result<usize> {
        self.current.ok_or(KernelError::NotStarted)
    }

    pub fn tasks(&self) -> &[TaskControlBlock] {
        &self.tasks
    }

    pub fn task(&self, index: usize) -> Option<&TaskControlBlock> {
        self.tasks.get(index)
    }

    pub fn options(&self) -> SchedulerOptions {
        self.options
    }

    pub fn heap(&self) -> &RegionAllocator {
        &self.heap
    }

    pub fn mutex(&self, mutex: u8) -> Option<&KernelMutex> {
        self.mutexes.get(mutex as usize)
    }

    pub fn semaphore(&self, semaphore: u8) -> Option<&Semaphore> {
        self.semaphores.get(semaphore as usize)
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Number of occupied slots.
    pub fn task_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_live()).count()
    }

    /// Mark a dequeued waiter Ready.
    fn wake(&mut self, index: usize) {
        let tcb = &mut self.tasks[index];
        tcb.state = TaskState::Ready;
        tcb.blocked_on = None;
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

fn check_priority(priority: u8) -> Result<()> {
    if priority as usize >= NUM_PRIORITIES {
        log::warn!("priority {} out of range", priority);
        return Err(KernelError::InvalidPriority(priority));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

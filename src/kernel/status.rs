//! # Status Reports
//!
//! Snapshots of kernel state for the administrative services (`ps`,
//! `ipcs`, `meminfo`) plus kill by pid or by name.
//!
//! Each report has a fixed little-endian wire layout so that it can be
//! copied into a task buffer:
//!
//! ```text
//! ProcessInfo (32 B)  pid:u32 entry:u32 state:u8 prio:u8 cur_prio:u8
//!                     blocked_kind:u8 blocked_index:u8 _:[u8;3] name:[u8;16]
//! MemInfo     (32 B)  pid:u32 stack_base:u32 stack_size:u32 heap:u32 name:[u8;16]
//! IpcStatus   (64 B)  per mutex  (16 B) locked:u8 waiting:u8 _:[u8;2]
//!                                       owner_pid:u32 waiter_pids:[u32;2]
//!                     per semaphore (16 B) count:u32 waiting:u8 _:[u8;3]
//!                                       waiter_pids:[u32;2]
//! ```
//! Pid 0 means "none".

use heapless::{String, Vec};

use super::Kernel;
use crate::config::{
    MAX_MUTEXES, MAX_MUTEX_QUEUE_SIZE, MAX_SEMAPHORES, MAX_SEMAPHORE_QUEUE_SIZE, TASK_NAME_LEN,
};
use crate::error::Result;
use crate::port::Port;
use crate::task::{BlockedOn, EntryPoint, Pid, TaskState};

const NONE: Pid = Pid::new(0);

// the IPC layout has room for two waiter pids per primitive
const _: () = assert!(MAX_MUTEX_QUEUE_SIZE <= 2 && MAX_SEMAPHORE_QUEUE_SIZE <= 2);

/// One `ps` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub entry: EntryPoint,
    pub name: String<TASK_NAME_LEN>,
    pub state: TaskState,
    pub priority: u8,
    pub current_priority: u8,
    pub blocked_on: Option<BlockedOn>,
}

impl ProcessInfo {
    pub const WIRE_SIZE: usize = 32;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[0..4].copy_from_slice(&self.pid.as_u32().to_le_bytes());
        out[4..8].copy_from_slice(&self.entry.addr().to_le_bytes());
        out[8] = self.state as u8;
        out[9] = self.priority;
        out[10] = self.current_priority;
        let (kind, index) = match self.blocked_on {
            None => (0, 0),
            Some(BlockedOn::Mutex(m)) => (1, m),
            Some(BlockedOn::Semaphore(s)) => (2, s),
        };
        out[11] = kind;
        out[12] = index;
        put_name(&mut out[16..32], &self.name);
        out
    }
}

/// One `meminfo` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemInfo {
    pub pid: Pid,
    pub name: String<TASK_NAME_LEN>,
    pub stack_base: u32,
    pub stack_size: u32,
    /// Bytes held through `malloc`, excluding the stack.
    pub heap_bytes: u32,
}

impl MemInfo {
    pub const WIRE_SIZE: usize = 32;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[0..4].copy_from_slice(&self.pid.as_u32().to_le_bytes());
        out[4..8].copy_from_slice(&self.stack_base.to_le_bytes());
        out[8..12].copy_from_slice(&self.stack_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.heap_bytes.to_le_bytes());
        put_name(&mut out[16..32], &self.name);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutexStatus {
    pub owner: Option<Pid>,
    pub waiters: Vec<Pid, MAX_MUTEX_QUEUE_SIZE>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemaphoreStatus {
    pub count: u32,
    pub waiters: Vec<Pid, MAX_SEMAPHORE_QUEUE_SIZE>,
}

/// The `ipcs` report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcStatus {
    pub mutexes: Vec<MutexStatus, MAX_MUTEXES>,
    pub semaphores: Vec<SemaphoreStatus, MAX_SEMAPHORES>,
}

impl IpcStatus {
    const RECORD: usize = 16;
    pub const WIRE_SIZE: usize = Self::RECORD * (MAX_MUTEXES + MAX_SEMAPHORES);

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        let mut records = out.chunks_exact_mut(Self::RECORD);
        for (m, rec) in self.mutexes.iter().zip(records.by_ref()) {
            rec[0] = m.owner.is_some() as u8;
            rec[1] = m.waiters.len() as u8;
            rec[4..8].copy_from_slice(&m.owner.unwrap_or(NONE).as_u32().to_le_bytes());
            put_pids(&mut rec[8..], &m.waiters);
        }
        for (s, rec) in self.semaphores.iter().zip(records) {
            rec[0..4].copy_from_slice(&s.count.to_le_bytes());
            rec[4] = s.waiters.len() as u8;
            put_pids(&mut rec[8..], &s.waiters);
        }
        out
    }
}

fn put_name(out: &mut [u8], name: &str) {
    let bytes = name.as_bytes();
    let n = bytes.len().min(out.len());
    out[..n].copy_from_slice(&bytes[..n]);
}

fn put_pids(out: &mut [u8], pids: &[Pid]) {
    for (pid, slot) in pids.iter().zip(out.chunks_exact_mut(4)) {
        slot.copy_from_slice(&pid.as_u32().to_le_bytes());
    }
}

impl Kernel {
    /// One line per occupied slot, in table order.
    pub fn process_list(&self) -> impl Iterator<Item = ProcessInfo> + '_ {
        self.tasks.iter().filter(|t| t.is_live()).map(|t| ProcessInfo {
            pid: t.pid,
            entry: t.entry,
            name: t.name.clone(),
            state: t.state,
            priority: t.priority,
            current_priority: t.current_priority,
            blocked_on: t.blocked_on,
        })
    }

    pub fn ipc_status(&self) -> IpcStatus {
        let pid_of = |index: usize| self.tasks[index].pid;
        IpcStatus {
            mutexes: self
                .mutexes
                .iter()
                .map(|m| MutexStatus {
                    owner: m.owner().map(pid_of),
                    waiters: m.waiters().iter().map(|&w| pid_of(w)).collect(),
                })
                .collect(),
            semaphores: self
                .semaphores
                .iter()
                .map(|s| SemaphoreStatus {
                    count: s.count(),
                    waiters: s.waiters().iter().map(|&w| pid_of(w)).collect(),
                })
                .collect(),
        }
    }

    /// Memory held by each occupied slot.
    pub fn memory_info(&self) -> impl Iterator<Item = MemInfo> + '_ {
        self.tasks.iter().filter(|t| t.is_live()).map(|t| {
            let (stack_base, stack_size) = t.stack.map_or((0, 0), |s| (s.base, s.size));
            MemInfo {
                pid: t.pid,
                name: t.name.clone(),
                stack_base,
                stack_size,
                heap_bytes: self.heap.owned_bytes(t.pid).saturating_sub(stack_size),
            }
        })
    }

    pub fn pidof(&self, name: &str) -> Result<Pid> {
        self.find_by_name(name).map(|i| self.tasks[i].pid)
    }

    pub fn kill(&mut self, port: &mut impl Port, pid: Pid) -> Result<()> {
        let index = self.find_by_pid(pid)?;
        self.stop_index(port, index)
    }

    pub fn pkill(&mut self, port: &mut impl Port, name: &str) -> Result<()> {
        let index = self.find_by_name(name)?;
        self.stop_index(port, index)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{started, switch};
    use super::*;
    use crate::error::KernelError;
    use crate::testing::MockPort;

    fn named() -> (Kernel, MockPort) {
        let mut kernel = Kernel::new();
        let mut port = MockPort::new();
        for (i, name) in ["idle", "flash", "shell"].iter().enumerate() {
            kernel
                .create_thread(&mut port, super::super::tests::entry(i as u32), name, 4, 512)
                .unwrap();
        }
        kernel.start(&mut port).unwrap();
        (kernel, port)
    }

    #[test]
    fn test_process_list() {
        let (mut kernel, mut port) = named();
        switch(&mut kernel, &mut port);
        kernel.sleep(&mut port, 9).unwrap();

        let list: std::vec::Vec<ProcessInfo> = kernel.process_list().collect();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].name.as_str(), "idle");
        assert_eq!(list[0].state, TaskState::Delayed);
        assert_eq!(list[2].pid, Pid::new(3));

        let wire = list[1].encode();
        assert_eq!(&wire[0..4], &2u32.to_le_bytes());
        assert_eq!(wire[8], TaskState::Ready as u8);
        assert_eq!(&wire[16..21], b"flash");
        assert_eq!(wire[21], 0);
    }

    #[test]
    fn test_ipc_status() {
        let (mut kernel, mut port) = started(&[15, 5, 5]);
        kernel.init_semaphore(2, 3).unwrap();
        switch(&mut kernel, &mut port);
        kernel.lock(&mut port, 0).unwrap();
        switch(&mut kernel, &mut port);
        kernel.lock(&mut port, 0).unwrap();

        let status = kernel.ipc_status();
        assert_eq!(status.mutexes[0].owner, Some(Pid::new(2)));
        assert_eq!(status.mutexes[0].waiters.as_slice(), &[Pid::new(3)]);
        assert_eq!(status.semaphores[2].count, 3);

        let wire = status.encode();
        assert_eq!(wire.len(), 64);
        assert_eq!(wire[0], 1);
        assert_eq!(wire[1], 1);
        assert_eq!(&wire[4..8], &2u32.to_le_bytes());
        assert_eq!(&wire[8..12], &3u32.to_le_bytes());
        assert_eq!(&wire[48..52], &3u32.to_le_bytes());
    }

    #[test]
    fn test_ipc_status_carries_every_queued_pid() {
        let (mut kernel, mut port) = started(&[15, 5, 5, 5]);
        for i in 1..=3 {
            while switch(&mut kernel, &mut port) != i {}
            kernel.lock(&mut port, 0).unwrap();
        }
        let status = kernel.ipc_status();
        assert_eq!(status.mutexes[0].waiters.len(), MAX_MUTEX_QUEUE_SIZE);

        let wire = status.encode();
        assert_eq!(wire[1], 2);
        assert_eq!(&wire[4..8], &2u32.to_le_bytes());
        assert_eq!(&wire[8..12], &3u32.to_le_bytes());
        assert_eq!(&wire[12..16], &4u32.to_le_bytes());
    }

    #[test]
    fn test_memory_info_separates_stack_and_heap() {
        let (mut kernel, mut port) = started(&[15, 3]);
        switch(&mut kernel, &mut port);
        kernel.malloc(&mut port, 2048).unwrap();

        let info: std::vec::Vec<MemInfo> = kernel.memory_info().collect();
        assert_eq!(info[1].stack_size, 1024);
        assert_eq!(info[1].heap_bytes, 2048);
        assert_eq!(info[0].heap_bytes, 0);
        assert_eq!(&info[1].encode()[12..16], &2048u32.to_le_bytes());
    }

    #[test]
    fn test_pidof_kill_pkill() {
        let (mut kernel, mut port) = named();
        assert_eq!(kernel.pidof("shell"), Ok(Pid::new(3)));
        assert_eq!(kernel.pidof("nope"), Err(KernelError::NoSuchTask));

        kernel.kill(&mut port, Pid::new(2)).unwrap();
        assert_eq!(kernel.tasks()[1].state, TaskState::Stopped);
        assert_eq!(kernel.kill(&mut port, Pid::new(42)), Err(KernelError::NoSuchTask));

        kernel.pkill(&mut port, "shell").unwrap();
        assert_eq!(kernel.tasks()[2].state, TaskState::Stopped);
        assert_eq!(kernel.pkill(&mut port, "shell"), Err(KernelError::InvalidState));
    }
}

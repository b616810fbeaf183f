//! # Service Calls
//!
//! Tasks reach the kernel with `svc #n`. The SVCall handler passes the
//! caller's stacked frame to [`Kernel::dispatch`], which reads `n` from the
//! instruction before the stacked return address and the arguments from the
//! stacked `r0`..`r2`, runs the decoded [`ServiceCall`] through
//! [`Kernel::service`] and writes the outcome back with [`complete`].
//!
//! ```text
//! r0  reply for calls that have one, 0 if such a call failed
//! pc  moved back onto the `svc` when a wait queue was full
//! ```

use heapless::String;

use super::status::{IpcStatus, MemInfo, ProcessInfo};
use super::Kernel;
use crate::config::{SchedulingPolicy, TASK_NAME_LEN};
use crate::error::{KernelError, Result};
use crate::port::{Port, UserMemory};
use crate::task::{EntryPoint, HardwareFrame, Pid};

/// Immediate operand of each `svc` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceNumber {
    Start = 0,
    Yield = 1,
    Restart = 2,
    Stop = 3,
    SetPriority = 4,
    Sleep = 5,
    Lock = 6,
    Unlock = 7,
    Wait = 8,
    Post = 9,
    Malloc = 10,
    Free = 11,
    Reboot = 12,
    Ps = 13,
    Ipcs = 14,
    Kill = 15,
    Pkill = 16,
    Pidof = 17,
    Sched = 18,
    Preempt = 19,
    Pi = 20,
    Meminfo = 21,
}

impl TryFrom<u8> for ServiceNumber {
    type Error = KernelError;

    fn try_from(n: u8) -> Result<Self> {
        use ServiceNumber::*;
        const ALL: [ServiceNumber; 22] = [
            Start, Yield, Restart, Stop, SetPriority, Sleep, Lock, Unlock, Wait, Post, Malloc,
            Free, Reboot, Ps, Ipcs, Kill, Pkill, Pidof, Sched, Preempt, Pi, Meminfo,
        ];
        ALL.get(n as usize)
            .copied()
            .ok_or(KernelError::UnknownService(n))
    }
}

/// A decoded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceCall {
    Start,
    Yield,
    Restart(EntryPoint),
    Stop(EntryPoint),
    SetPriority(EntryPoint, u8),
    Sleep(u32),
    Lock(u8),
    Unlock(u8),
    Wait(u8),
    Post(u8),
    Malloc(u32),
    Free(u32),
    Reboot,
    Ps { buf: u32, capacity: u32 },
    Ipcs { buf: u32 },
    Kill(Pid),
    Pkill { name: u32, len: u32 },
    Pidof { name: u32, len: u32 },
    Sched(SchedulingPolicy),
    Preempt(bool),
    Pi(bool),
    Meminfo { buf: u32, capacity: u32 },
}

impl ServiceCall {
    /// Decode service `number` with stacked arguments `r0`, `r1`, `r2`.
    pub fn decode(number: u8, args: [u32; 3]) -> Result<Self> {
        let [r0, r1, _] = args;
        let mutex = || u8::try_from(r0).map_err(|_| KernelError::InvalidMutex(u8::MAX));
        let semaphore = || u8::try_from(r0).map_err(|_| KernelError::InvalidSemaphore(u8::MAX));

        Ok(match ServiceNumber::try_from(number)? {
            ServiceNumber::Start => Self::Start,
            ServiceNumber::Yield => Self::Yield,
            ServiceNumber::Restart => Self::Restart(EntryPoint::from_addr(r0)),
            ServiceNumber::Stop => Self::Stop(EntryPoint::from_addr(r0)),
            ServiceNumber::SetPriority => Self::SetPriority(
                EntryPoint::from_addr(r0),
                u8::try_from(r1).map_err(|_| KernelError::InvalidPriority(u8::MAX))?,
            ),
            ServiceNumber::Sleep => Self::Sleep(r0),
            ServiceNumber::Lock => Self::Lock(mutex()?),
            ServiceNumber::Unlock => Self::Unlock(mutex()?),
            ServiceNumber::Wait => Self::Wait(semaphore()?),
            ServiceNumber::Post => Self::Post(semaphore()?),
            ServiceNumber::Malloc => Self::Malloc(r0),
            ServiceNumber::Free => Self::Free(r0),
            ServiceNumber::Reboot => Self::Reboot,
            ServiceNumber::Ps => Self::Ps { buf: r0, capacity: r1 },
            ServiceNumber::Ipcs => Self::Ipcs { buf: r0 },
            ServiceNumber::Kill => Self::Kill(Pid::new(r0)),
            ServiceNumber::Pkill => Self::Pkill { name: r0, len: r1 },
            ServiceNumber::Pidof => Self::Pidof { name: r0, len: r1 },
            ServiceNumber::Sched => Self::Sched(if r0 != 0 {
                SchedulingPolicy::Priority
            } else {
                SchedulingPolicy::RoundRobin
            }),
            ServiceNumber::Preempt => Self::Preempt(r0 != 0),
            ServiceNumber::Pi => Self::Pi(r0 != 0),
            ServiceNumber::Meminfo => Self::Meminfo { buf: r0, capacity: r1 },
        })
    }

    /// Whether the caller expects a value in `r0`.
    pub fn has_reply(&self) -> bool {
        matches!(
            self,
            Self::Malloc(_)
                | Self::Ps { .. }
                | Self::Ipcs { .. }
                | Self::Kill(_)
                | Self::Pkill { .. }
                | Self::Pidof { .. }
                | Self::Meminfo { .. }
        )
    }
}

/// Number of the `svc` that returns to `pc`: the immediate is the low byte
/// of the Thumb halfword just before it.
pub fn service_number(code: &impl UserMemory, pc: u32) -> u8 {
    let mut insn = [0u8; 2];
    code.read(pc.wrapping_sub(2), &mut insn);
    insn[0]
}

/// Write the outcome of `call` into the caller's stacked frame.
pub fn complete(call: &ServiceCall, result: Result<u32>, frame: &mut HardwareFrame) {
    match result {
        Ok(reply) => {
            if call.has_reply() {
                frame.r0 = reply;
            }
        }
        // issue the same svc again once the caller is scheduled
        Err(KernelError::QueueFull) => frame.pc = frame.pc.wrapping_sub(2),
        Err(e) => {
            log::debug!("{:?} failed: {}", call, e);
            if call.has_reply() {
                frame.r0 = 0;
            }
        }
    }
}

impl Kernel {
    /// Handle the service call that trapped with `frame` on the caller's
    /// stack. An unknown number leaves the frame untouched.
    pub fn dispatch(
        &mut self,
        port: &mut impl Port,
        mem: &mut impl UserMemory,
        frame: &mut HardwareFrame,
    ) {
        let number = service_number(&*mem, frame.pc);
        let call = match ServiceCall::decode(number, [frame.r0, frame.r1, frame.r2]) {
            Ok(call) => call,
            Err(e) => {
                log::warn!("svc #{}: {}", number, e);
                return;
            }
        };
        let result = self.service(port, mem, call);
        complete(&call, result, frame);
    }

    /// Carry out `call` for the running task. Returns the `r0` reply, 0 for
    /// calls without one.
    pub fn service(
        &mut self,
        port: &mut impl Port,
        mem: &mut impl UserMemory,
        call: ServiceCall,
    ) -> Result<u32> {
        log::trace!("svc {:?}", call);
        match call {
            ServiceCall::Start => self.start(port).map(|_| 0),
            ServiceCall::Yield => self.yield_now(port).map(|_| 0),
            ServiceCall::Restart(entry) => self.restart_thread(port, entry).map(|_| 0),
            ServiceCall::Stop(entry) => self.stop_thread(port, entry).map(|_| 0),
            ServiceCall::SetPriority(entry, prio) => {
                self.set_thread_priority(entry, prio).map(|_| 0)
            }
            ServiceCall::Sleep(ticks) => self.sleep(port, ticks).map(|_| 0),
            ServiceCall::Lock(m) => self.lock(port, m).map(|_| 0),
            ServiceCall::Unlock(m) => self.unlock(port, m).map(|_| 0),
            ServiceCall::Wait(s) => self.wait(port, s).map(|_| 0),
            ServiceCall::Post(s) => self.post(port, s).map(|_| 0),
            ServiceCall::Malloc(size) => self.malloc(port, size),
            ServiceCall::Free(addr) => self.free(port, addr).map(|_| 0),
            ServiceCall::Reboot => {
                self.reboot(port);
                Ok(0)
            }
            ServiceCall::Ps { buf, capacity } => {
                self.check_buffer(buf, capacity, ProcessInfo::WIRE_SIZE)?;
                let mut written = 0;
                for info in self.process_list().take(capacity as usize) {
                    mem.write(buf + written * ProcessInfo::WIRE_SIZE as u32, &info.encode());
                    written += 1;
                }
                Ok(written)
            }
            ServiceCall::Ipcs { buf } => {
                self.check_buffer(buf, 1, IpcStatus::WIRE_SIZE)?;
                mem.write(buf, &self.ipc_status().encode());
                Ok(1)
            }
            ServiceCall::Kill(pid) => self.kill(port, pid).map(|_| 1),
            ServiceCall::Pkill { name, len } => {
                let name = self.read_name(&*mem, name, len)?;
                self.pkill(port, &name).map(|_| 1)
            }
            ServiceCall::Pidof { name, len } => {
                let name = self.read_name(&*mem, name, len)?;
                self.pidof(&name).map(Pid::as_u32)
            }
            ServiceCall::Sched(policy) => {
                self.set_policy(policy);
                Ok(0)
            }
            ServiceCall::Preempt(on) => {
                self.set_preemption(on);
                Ok(0)
            }
            ServiceCall::Pi(on) => {
                self.set_priority_inheritance(on);
                Ok(0)
            }
            ServiceCall::Meminfo { buf, capacity } => {
                self.check_buffer(buf, capacity, MemInfo::WIRE_SIZE)?;
                let mut written = 0;
                for info in self.memory_info().take(capacity as usize) {
                    mem.write(buf + written * MemInfo::WIRE_SIZE as u32, &info.encode());
                    written += 1;
                }
                Ok(written)
            }
        }
    }

    /// `count` records of `size` bytes at `buf` must be writable by the caller.
    fn check_buffer(&self, buf: u32, count: u32, size: usize) -> Result<()> {
        let current = self.current_index()?;
        let len = count
            .checked_mul(size as u32)
            .ok_or(KernelError::BadUserBuffer)?;
        if !self.tasks[current].srd.permits(buf, len) {
            log::warn!("'{}': buffer {:#010x}+{:#x} not accessible", self.tasks[current].name(), buf, len);
            return Err(KernelError::BadUserBuffer);
        }
        Ok(())
    }

    fn read_name(
        &self,
        mem: &impl UserMemory,
        ptr: u32,
        len: u32,
    ) -> Result<String<TASK_NAME_LEN>> {
        if len as usize > TASK_NAME_LEN {
            return Err(KernelError::BadUserBuffer);
        }
        self.check_buffer(ptr, len, 1)?;

        let mut raw = [0u8; TASK_NAME_LEN];
        let raw = &mut raw[..len as usize];
        mem.read(ptr, raw);
        let text = core::str::from_utf8(raw).map_err(|_| KernelError::BadUserBuffer)?;
        let mut name = String::new();
        name.push_str(text).map_err(|_| KernelError::BadUserBuffer)?;
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{entry, started, switch};
    use super::*;
    use crate::task::TaskState;
    use crate::testing::MockMemory;

    #[test]
    fn test_decode() {
        assert_eq!(ServiceCall::decode(1, [0; 3]), Ok(ServiceCall::Yield));
        assert_eq!(ServiceCall::decode(5, [40, 0, 0]), Ok(ServiceCall::Sleep(40)));
        assert_eq!(
            ServiceCall::decode(4, [0x1001, 3, 0]),
            Ok(ServiceCall::SetPriority(EntryPoint::from_addr(0x1001), 3))
        );
        assert_eq!(
            ServiceCall::decode(18, [0, 0, 0]),
            Ok(ServiceCall::Sched(SchedulingPolicy::RoundRobin))
        );
        assert_eq!(
            ServiceCall::decode(6, [300, 0, 0]),
            Err(KernelError::InvalidMutex(u8::MAX))
        );
        assert_eq!(
            ServiceCall::decode(22, [0; 3]),
            Err(KernelError::UnknownService(22))
        );
        assert_eq!(ServiceNumber::try_from(21), Ok(ServiceNumber::Meminfo));
    }

    #[test]
    fn test_replies() {
        assert!(ServiceCall::Malloc(4).has_reply());
        assert!(ServiceCall::Pidof { name: 0, len: 0 }.has_reply());
        assert!(!ServiceCall::Lock(0).has_reply());
        assert!(!ServiceCall::Sleep(1).has_reply());
    }

    /// Frame of a task trapped on an `svc` placed at `at`.
    fn trapped(mem: &mut MockMemory, at: u32, number: u8, r0: u32) -> HardwareFrame {
        mem.put(at, &[number, 0xDF]);
        HardwareFrame {
            r0,
            pc: at + 2,
            ..HardwareFrame::default()
        }
    }

    #[test]
    fn test_service_number_is_svc_immediate() {
        let mut mem = MockMemory::new();
        let at = crate::mm::HEAP_START + 0x40;
        mem.put(at, &[ServiceNumber::Pidof as u8, 0xDF]);
        assert_eq!(service_number(&mem, at + 2), 17);
    }

    #[test]
    fn test_complete_reply_rules() {
        let mut frame = HardwareFrame {
            r0: 7,
            pc: 0x0000_2002,
            ..HardwareFrame::default()
        };
        complete(&ServiceCall::Malloc(64), Ok(0x2000_2000), &mut frame);
        assert_eq!(frame.r0, 0x2000_2000);

        complete(
            &ServiceCall::Malloc(0),
            Err(KernelError::UnsupportedSize(0)),
            &mut frame,
        );
        assert_eq!(frame.r0, 0, "failed call with a reply reads 0");

        frame.r0 = 7;
        complete(&ServiceCall::Sleep(5), Ok(0), &mut frame);
        complete(&ServiceCall::Yield, Err(KernelError::NotStarted), &mut frame);
        assert_eq!(frame.r0, 7, "no reply register, r0 untouched");
        assert_eq!(frame.pc, 0x0000_2002);
    }

    #[test]
    fn test_complete_replays_on_full_queue() {
        let mut frame = HardwareFrame {
            r0: 0,
            pc: 0x0000_2002,
            ..HardwareFrame::default()
        };
        complete(&ServiceCall::Lock(0), Err(KernelError::QueueFull), &mut frame);
        assert_eq!(frame.pc, 0x0000_2000);
        assert_eq!(frame.r0, 0);
    }

    #[test]
    fn test_dispatch_from_frame() {
        let (mut kernel, mut port) = started(&[15, 5]);
        let mut mem = MockMemory::new();
        switch(&mut kernel, &mut port);
        let code = kernel.tasks()[1].stack.unwrap().base + 0x20;

        let mut frame = trapped(&mut mem, code, ServiceNumber::Malloc as u8, 1024);
        kernel.dispatch(&mut port, &mut mem, &mut frame);
        assert_ne!(frame.r0, 0);
        assert!(kernel.tasks()[1].srd.permits(frame.r0, 1024));
        assert_eq!(frame.pc, code + 2);

        let mut frame = trapped(&mut mem, code, 0x30, 99);
        let before = frame;
        kernel.dispatch(&mut port, &mut mem, &mut frame);
        assert_eq!(frame, before, "unknown number leaves the frame alone");
    }

    #[test]
    fn test_dispatch_rewinds_lock_on_full_queue() {
        let (mut kernel, mut port) = started(&[15, 5, 5, 5, 5]);
        let mut mem = MockMemory::new();
        for i in 1..=4 {
            while switch(&mut kernel, &mut port) != i {}
            if i < 4 {
                kernel.lock(&mut port, 0).unwrap();
            }
        }
        let code = kernel.tasks()[4].stack.unwrap().base + 0x20;
        let mut frame = trapped(&mut mem, code, ServiceNumber::Lock as u8, 0);
        kernel.dispatch(&mut port, &mut mem, &mut frame);
        assert_eq!(frame.pc, code, "svc issued again");
        assert_eq!(kernel.tasks()[4].state, TaskState::Ready);
    }

    #[test]
    fn test_dispatch_lifecycle_calls() {
        let (mut kernel, mut port) = started(&[15, 5]);
        let mut mem = MockMemory::new();
        switch(&mut kernel, &mut port);

        kernel
            .service(&mut port, &mut mem, ServiceCall::Stop(entry(0)))
            .unwrap();
        assert_eq!(kernel.tasks()[0].state, TaskState::Stopped);
        kernel
            .service(&mut port, &mut mem, ServiceCall::Restart(entry(0)))
            .unwrap();
        assert_eq!(kernel.tasks()[0].state, TaskState::Ready);
        kernel
            .service(&mut port, &mut mem, ServiceCall::Pi(true))
            .unwrap();
        assert!(kernel.options().priority_inheritance);
        kernel
            .service(&mut port, &mut mem, ServiceCall::Reboot)
            .unwrap();
        assert_eq!(port.resets, 1);
    }

    #[test]
    fn test_ps_into_task_buffer() {
        let (mut kernel, mut port) = started(&[15, 5]);
        let mut mem = MockMemory::new();
        switch(&mut kernel, &mut port);
        let buf = kernel
            .service(&mut port, &mut mem, ServiceCall::Malloc(2048))
            .unwrap();

        let n = kernel
            .service(&mut port, &mut mem, ServiceCall::Ps { buf, capacity: 8 })
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(mem.get(buf, 4), &1u32.to_le_bytes());
        assert_eq!(mem.get(buf + 32, 4), &2u32.to_le_bytes());

        let n = kernel
            .service(&mut port, &mut mem, ServiceCall::Ps { buf, capacity: 1 })
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_buffers_outside_caller_mask_are_refused() {
        let (mut kernel, mut port) = started(&[15, 5]);
        let mut mem = MockMemory::new();
        switch(&mut kernel, &mut port);
        let foreign = kernel.tasks()[0].stack.unwrap().base;

        assert_eq!(
            kernel.service(&mut port, &mut mem, ServiceCall::Ipcs { buf: foreign }),
            Err(KernelError::BadUserBuffer)
        );
        assert_eq!(
            kernel.service(&mut port, &mut mem, ServiceCall::Ps { buf: 0x2000_0000, capacity: 1 }),
            Err(KernelError::BadUserBuffer)
        );
        assert_eq!(
            kernel.service(&mut port, &mut mem, ServiceCall::Meminfo { buf: 0, capacity: u32::MAX }),
            Err(KernelError::BadUserBuffer)
        );
    }

    #[test]
    fn test_pidof_and_pkill_read_name_from_caller() {
        let mut kernel = Kernel::new();
        let mut port = crate::testing::MockPort::new();
        let mut mem = MockMemory::new();
        kernel.create_thread(&mut port, entry(0), "shell", 5, 1024).unwrap();
        kernel.create_thread(&mut port, entry(1), "flash", 9, 1024).unwrap();
        kernel.start(&mut port).unwrap();
        switch(&mut kernel, &mut port);

        let name = kernel.tasks()[0].stack.unwrap().base;
        mem.put(name, b"flash");
        let pid = kernel
            .service(&mut port, &mut mem, ServiceCall::Pidof { name, len: 5 })
            .unwrap();
        assert_eq!(pid, 2);

        assert_eq!(
            kernel.service(&mut port, &mut mem, ServiceCall::Pidof { name, len: 17 }),
            Err(KernelError::BadUserBuffer)
        );

        let reply = kernel
            .service(&mut port, &mut mem, ServiceCall::Pkill { name, len: 5 })
            .unwrap();
        assert_eq!(reply, 1);
        assert_eq!(kernel.tasks()[1].state, TaskState::Stopped);
    }

    #[test]
    fn test_ipcs_and_meminfo_write_reports() {
        let (mut kernel, mut port) = started(&[15, 5]);
        let mut mem = MockMemory::new();
        switch(&mut kernel, &mut port);
        let buf = kernel
            .service(&mut port, &mut mem, ServiceCall::Malloc(1024))
            .unwrap();

        assert_eq!(kernel.service(&mut port, &mut mem, ServiceCall::Ipcs { buf }), Ok(1));
        let n = kernel
            .service(&mut port, &mut mem, ServiceCall::Meminfo { buf, capacity: 2 })
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(mem.get(buf + 32 + 12, 4), &1024u32.to_le_bytes());
    }
}

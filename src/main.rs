//! # SrdOS Example Firmware
//!
//! Exercises the kernel services with a small task set:
//!
//! | Task | Priority | Stack | Behavior |
//! |------|----------|-------|----------|
//! | `idle` | 15 | 512 | Yields forever, keeps one task Ready |
//! | `lengthy` | 12 | 1024 | Holds a 5000 B heap block, fills it under the mutex |
//! | `monitor` | 10 | 2048 | Pulls `ps`, `ipcs` and `meminfo` reports every 5 s |
//! | `flash` | 8 | 512 | Toggles a counter every 125 ms |
//! | `producer` | 6 | 1024 | Posts `FLASH_REQ`, stops/restarts `flash`, demotes `lengthy` |
//! | `oneshot` | 4 | 1024 | Waits on `FLASH_REQ`, then sleeps 1 s |
//! | `important` | 0 | 1024 | Takes the mutex for 1 s at a time |
//!
//! `important` and `lengthy` contend for `RESOURCE`; turn priority
//! inheritance on and `lengthy` runs at priority 0 while `important` waits.

#![cfg_attr(target_arch = "arm", no_std)]
#![cfg_attr(target_arch = "arm", no_main)]

#[cfg(target_arch = "arm")]
mod firmware {
    use core::hint::black_box;

    use cortex_m_rt::entry;
    use panic_halt as _;

    use srdos::api;
    use srdos::config::SchedulingPolicy;
    use srdos::kernel::status::{IpcStatus, MemInfo, ProcessInfo};
    use srdos::logging;

    const RESOURCE: u8 = 0;

    const KEY_PRESSED: u8 = 0;
    const KEY_RELEASED: u8 = 1;
    const FLASH_REQ: u8 = 2;

    // -----------------------------------------------------------------------
    // Task entry points
    // -----------------------------------------------------------------------

    /// One task must always be Ready.
    extern "C" fn idle() -> ! {
        loop {
            api::yield_now();
        }
    }

    extern "C" fn flash() -> ! {
        let mut on = false;
        loop {
            on = !on;
            black_box(on);
            api::sleep(125);
        }
    }

    extern "C" fn oneshot() -> ! {
        loop {
            api::wait(FLASH_REQ);
            api::sleep(1000);
        }
    }

    /// Long job over a private heap block, yielding between steps and
    /// holding the mutex for the whole pass.
    extern "C" fn lengthy() -> ! {
        const LEN: usize = 5000;
        let Some(block) = api::malloc(LEN as u32) else {
            loop {
                api::sleep(1000);
            }
        };
        loop {
            api::lock(RESOURCE);
            for i in 0..LEN {
                unsafe { block.as_ptr().add(i).write_volatile(i as u8) };
                if i % 64 == 0 {
                    api::yield_now();
                }
            }
            api::unlock(RESOURCE);
        }
    }

    extern "C" fn important() -> ! {
        loop {
            api::lock(RESOURCE);
            api::sleep(1000);
            api::unlock(RESOURCE);
        }
    }

    /// Stands in for the push-button handler: every 2 s it fires one of
    /// the task-control services.
    extern "C" fn producer() -> ! {
        let mut round: u32 = 0;
        loop {
            api::sleep(2000);
            api::post(KEY_PRESSED);
            api::wait(KEY_PRESSED);
            match round % 4 {
                0 => api::post(FLASH_REQ),
                1 => api::stop_thread(flash),
                2 => api::restart_thread(flash),
                _ => api::set_thread_priority(lengthy, 4),
            }
            api::post(KEY_RELEASED);
            api::wait(KEY_RELEASED);
            round = round.wrapping_add(1);
        }
    }

    extern "C" fn monitor() -> ! {
        let mut processes = [[0u8; ProcessInfo::WIRE_SIZE]; 8];
        let mut memory = [[0u8; MemInfo::WIRE_SIZE]; 8];
        let mut ipc = [0u8; IpcStatus::WIRE_SIZE];
        let mut round: u32 = 0;
        loop {
            api::sleep(5000);
            black_box(api::ps(&mut processes));
            black_box(api::meminfo(&mut memory));
            black_box(api::ipcs(&mut ipc));
            black_box(api::pidof("flash"));
            // alternate between cooperative and preemptive scheduling
            api::preempt(round % 2 == 0);
            api::pi(round % 2 == 0);
            api::sched(SchedulingPolicy::Priority);
            round = round.wrapping_add(1);
        }
    }

    // -----------------------------------------------------------------------
    // Main entry point
    // -----------------------------------------------------------------------

    /// Firmware entry point. Initializes the kernel, creates tasks, and
    /// starts the scheduler. Does not return.
    #[entry]
    fn main() -> ! {
        logging::init(log::LevelFilter::Info);

        let Some(cp) = cortex_m::Peripherals::take() else {
            loop {}
        };
        api::init(cp);

        let setup = api::init_mutex(RESOURCE)
            .and(api::init_semaphore(KEY_PRESSED, 1))
            .and(api::init_semaphore(KEY_RELEASED, 0))
            .and(api::init_semaphore(FLASH_REQ, 0));
        if let Err(e) = setup {
            log::error!("primitive setup failed: {}", e);
        }

        let tasks: [(srdos::task::TaskFn, &str, u8, u32); 7] = [
            (idle, "idle", 15, 512),
            (lengthy, "lengthy", 12, 1024),
            (monitor, "monitor", 10, 2048),
            (flash, "flash", 8, 512),
            (producer, "producer", 6, 1024),
            (oneshot, "oneshot", 4, 1024),
            (important, "important", 0, 1024),
        ];
        for (entry, name, priority, stack) in tasks {
            if let Err(e) = api::create_thread(entry, name, priority, stack) {
                log::error!("could not create '{}': {}", name, e);
            }
        }

        api::start()
    }
}

#[cfg(not(target_arch = "arm"))]
fn main() {}

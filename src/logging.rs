//! # ITM Logger
//!
//! `log` backend writing one line per record to ITM stimulus port 0.
//! Records are emitted from exception handlers as well as from `main`, so
//! each line is written with interrupts masked and never interleaves.

use cortex_m::interrupt;
use cortex_m::peripheral::{itm, ITM};
use log::{LevelFilter, Log, Metadata, Record};

struct ItmLogger;

static LOGGER: ItmLogger = ItmLogger;

impl Log for ItmLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        interrupt::free(|_| {
            // the ITM is only ever written from inside this critical section
            let stim = unsafe { &mut (*(ITM::PTR as *mut itm::RegisterBlock)).stim[0] };
            cortex_m::itm::write_fmt(
                stim,
                format_args!("[{:<5}] {}: {}\n", record.level(), record.target(), record.args()),
            );
        });
    }

    fn flush(&self) {}
}

/// Install the logger. Later calls leave the first logger in place.
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

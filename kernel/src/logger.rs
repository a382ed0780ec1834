//! Kernel logger: routes the `log` facade to the UART console.
//!
//! Boot progress and driver diagnostics go through `log::info!` and
//! friends; the panic path deliberately bypasses this and prints
//! directly, so a broken logger can never hide a panic message.

use log::{Level, LevelFilter, Metadata, Record};

struct ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        crate::println!(
            "[{:<5}] {}",
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: ConsoleLogger = ConsoleLogger;

/// Install the console logger. Called once, early in boot, right after
/// the UART is usable.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}

#![no_std]

use crate_interface::call_interface;
use log::{Level, LevelFilter};

struct SimpleLogger;

/// Forwards every enabled record to whoever implements [`LogInterface`].
impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }
    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        call_interface!(LogInterface::print_log(record));
    }
    fn flush(&self) {}
}

/// The sink for log records.
///
/// Exactly one crate in the final binary implements this with
/// `#[crate_interface::impl_interface]`, e.g. a console driver or a test
/// harness printing to stdout.
#[crate_interface::def_interface]
pub trait LogInterface: Send + Sync {
    fn print_log(record: &log::Record);
}

/// Installs the logger and sets the level from the `LOG` build-time variable.
///
/// Calling this more than once is harmless.
pub fn init() {
    static LOGGER: SimpleLogger = SimpleLogger;
    log::set_logger(&LOGGER).ok();
    log::set_max_level(level_filter(option_env!("LOG")));
}

fn level_filter(level: Option<&str>) -> LevelFilter {
    match level {
        Some("trace") => LevelFilter::Trace,
        Some("debug") => LevelFilter::Debug,
        Some("info") => LevelFilter::Info,
        Some("warn") => LevelFilter::Warn,
        Some("error") => LevelFilter::Error,
        _ => LevelFilter::Off,
    }
}

/// ANSI color code used when printing a record of the given level.
pub fn level2color(level: Level) -> u8 {
    match level {
        Level::Error => 31, // Red
        Level::Warn => 93,  // BrightYellow
        Level::Info => 36,  // Blue
        Level::Debug => 32, // Green
        Level::Trace => 90, // BrightBlack
    }
}

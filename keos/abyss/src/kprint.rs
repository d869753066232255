//! Kernel print utilities.
//!
//! Kernel messages go through the [`log`] facade. [`init`] installs
//! [`KernelLogger`], which renders each record on the console with a
//! bracketed level tag, e.g. `[INFO] Machine: halted`.

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::io::Write;

/// The console logger of the kernel.
pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        _print(format_args!("[{tag}] {}\n", record.args()));
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
    }
}

/// Install the kernel logger and set the maximum level to display.
///
/// The logger can be installed once per process; later calls only update
/// the level.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    // Goes through `std::print!` so that the test harness can capture it.
    std::print!("{fmt}");
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the standard output.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
///
/// Use the format! syntax to write data to the standard output.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Display an information message.
#[macro_export]
macro_rules! info {
    ($($arg:tt)+) => ($crate::log::info!($($arg)+));
}

/// Display a warning message.
#[macro_export]
macro_rules! warning {
    ($($arg:tt)+) => ($crate::log::warn!($($arg)+));
}

/// Display a debug message.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)+) => ($crate::log::debug!($($arg)+));
}

//! Thin facade over `slog`: the macros and `Logger` are re-exported here so
//! the rest of the workspace logs through one module, and the constructors
//! build the concrete drains via `sloggers`.

use std::path::Path;

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::file::FileLoggerBuilder;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// File-backed logger for the engine process.
pub fn file_logger(path: &Path) -> Result<Logger, String> {
    let mut builder = FileLoggerBuilder::new(path);
    builder.level(Severity::Debug);
    builder.build().map_err(|err| err.to_string())
}

/// Terminal logger for tools and for running the engine in a shell.
pub fn terminal_logger() -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Debug);
    builder.destination(Destination::Stderr);
    builder.build().unwrap_or_else(|_| discard())
}

/// Logger that swallows everything; used by tests.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

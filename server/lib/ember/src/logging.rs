//! Thin wrapper over slog/sloggers so every crate builds its loggers the
//! same way. Components take an `Option<&Logger>` and fall back to a
//! discarding root logger when run without one (tests, tools).

pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Drain, Logger};

use crate::config::LogConfig;
use sloggers::file::FileLoggerBuilder;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds the worker's root logger from the `[log]` config section.
///
/// A file sink that cannot be opened degrades to terminal logging rather
/// than aborting the worker.
pub fn init(config: &LogConfig) -> Logger {
    let level = severity(&config.level);

    if let Some(path) = &config.file {
        let mut builder = FileLoggerBuilder::new(path);
        builder.level(level);
        builder.rotate_size(config.max_file_size);
        builder.rotate_keep(config.max_files);
        match builder.build() {
            Ok(logger) => return logger,
            Err(err) => {
                let fallback = terminal(level);
                error!(fallback, "log file unavailable, using terminal";
                       "path" => path, "error" => %err);
                return fallback;
            }
        }
    }

    terminal(level)
}

/// Stderr logger at the given severity.
pub fn terminal(level: Severity) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);
    builder
        .build()
        .unwrap_or_else(|_| Logger::root(Discard, o!()))
}

/// Root logger that drops everything. Used by components constructed
/// without a parent logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

pub fn severity(level: &str) -> Severity {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Severity::Trace,
        "debug" => Severity::Debug,
        "info" => Severity::Info,
        "warn" | "warning" => Severity::Warning,
        "error" => Severity::Error,
        "crit" | "critical" => Severity::Critical,
        _ => Severity::Info,
    }
}

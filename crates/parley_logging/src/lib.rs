#![deny(missing_docs)]
//! Shared logging utilities for the parley workspace.
//!
//! This crate provides the `parley_*` logging macros used across the codebase,
//! the dispatch-loop event sequence tag, and the initializers for the global
//! logger (application and tests).

use std::cell::Cell;
use std::fs::File;
use std::path::Path;

use log::LevelFilter;
use simplelog::{
    ColorChoice, CombinedLogger, Config, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};

thread_local! {
    /// Sequence number of the message the dispatch loop is currently applying.
    static EVENT_SEQ: Cell<u64> = const { Cell::new(0) };
}

/// Sets the event sequence number for the current thread.
/// The dispatch loop calls this once per processed message.
pub fn set_event_seq(seq: u64) {
    EVENT_SEQ.with(|v| v.set(seq));
}

/// Retrieves the event sequence number for the current thread.
/// Returns 0 outside the dispatch loop.
pub fn event_seq() -> u64 {
    EVENT_SEQ.with(|v| v.get())
}

/// Logs a trace-level message using the global logging facade.
#[macro_export]
macro_rules! parley_trace {
    ($($arg:tt)*) => {{
        log::trace!("[#{}] {}", $crate::event_seq(), format_args!($($arg)*));
    }};
}

/// Logs a debug-level message using the global logging facade.
#[macro_export]
macro_rules! parley_debug {
    ($($arg:tt)*) => {{
        log::debug!("[#{}] {}", $crate::event_seq(), format_args!($($arg)*));
    }};
}

/// Logs an info-level message using the global logging facade.
#[macro_export]
macro_rules! parley_info {
    ($($arg:tt)*) => {{
        log::info!("[#{}] {}", $crate::event_seq(), format_args!($($arg)*));
    }};
}

/// Logs a warn-level message using the global logging facade.
#[macro_export]
macro_rules! parley_warn {
    ($($arg:tt)*) => {{
        log::warn!("[#{}] {}", $crate::event_seq(), format_args!($($arg)*));
    }};
}

/// Logs an error-level message using the global logging facade.
#[macro_export]
macro_rules! parley_error {
    ($($arg:tt)*) => {{
        log::error!("[#{}] {}", $crate::event_seq(), format_args!($($arg)*));
    }};
}

/// Destination for log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogDestination {
    /// Write to the log file only. The terminal belongs to the chat view.
    #[default]
    File,
    /// Write to the terminal (stderr/stdout mixed).
    Terminal,
    /// Write to both file and terminal.
    Both,
}

/// Initializes the global logger.
///
/// File output goes to `log_path`, truncated on start. If the file cannot be
/// created the terminal fallback is used for `Both`, and logging is disabled
/// for `File`. Calling this twice is harmless: the second call is ignored.
pub fn initialize(destination: LogDestination, level: LevelFilter, log_path: &Path) {
    let config = build_config();

    let loggers: Vec<Box<dyn SharedLogger>> = match destination {
        LogDestination::File => match create_file_logger(level, config, log_path) {
            Some(file_logger) => vec![file_logger],
            None => return,
        },
        LogDestination::Terminal => vec![TermLogger::new(
            level,
            config,
            TerminalMode::Mixed,
            ColorChoice::Auto,
        )],
        LogDestination::Both => {
            let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
                level,
                config.clone(),
                TerminalMode::Mixed,
                ColorChoice::Auto,
            )];
            if let Some(file_logger) = create_file_logger(level, config, log_path) {
                loggers.push(file_logger);
            }
            loggers
        }
    };

    let _ = CombinedLogger::init(loggers);
}

/// Initializes a simple terminal logger for use in unit tests.
///
/// This safely no-ops if another logger has already been initialized.
pub fn initialize_for_tests() {
    // Use debug level in debug builds, info in release builds.
    let level = if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    // Ignore the error if a logger was already set by another test.
    let _ = CombinedLogger::init(vec![TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )]);
}

fn build_config() -> Config {
    ConfigBuilder::new()
        .set_time_format_rfc3339()
        .set_target_level(LevelFilter::Error)
        .build()
}

fn create_file_logger(
    level: LevelFilter,
    config: Config,
    log_path: &Path,
) -> Option<Box<WriteLogger<File>>> {
    if let Some(parent) = log_path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            eprintln!("Warning: Could not create log directory {:?}: {}", parent, err);
            return None;
        }
    }
    match File::create(log_path) {
        Ok(file) => Some(WriteLogger::new(level, config, file)),
        Err(err) => {
            eprintln!("Warning: Could not create log file at {:?}: {}", log_path, err);
            None
        }
    }
}

//! Logger setup for the parley binary.
//!
//! Logs go to `parley.log` in the active data directory unless `system.ron`
//! asks for the terminal.

use std::path::{Path, PathBuf};

use log::LevelFilter;
use parley_logging::LogDestination;

use crate::persistence::{LogOutput, SystemConfig};

pub const LOG_FILE: &str = "parley.log";

pub fn log_path(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_FILE)
}

pub fn destination(output: LogOutput) -> LogDestination {
    match output {
        LogOutput::File => LogDestination::File,
        LogOutput::Terminal => LogDestination::Terminal,
        LogOutput::Both => LogDestination::Both,
    }
}

/// Unknown level names fall back to `Info`.
pub fn level(name: &str) -> LevelFilter {
    name.parse().unwrap_or(LevelFilter::Info)
}

pub fn initialize(config: &SystemConfig, data_dir: &Path) {
    parley_logging::initialize(
        destination(config.log_output),
        level(&config.log_level),
        &log_path(data_dir),
    );
}

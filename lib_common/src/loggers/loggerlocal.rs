//! # Local Logger
//!
//! Installs a `fern` dispatcher that writes every record to stdout and to
//! `<log_dir>/<app>_<YYYY-mm-dd_HH-MM-SS>.log`, formatted as
//! `[date time][target][LEVEL] message`.
//!
//! Before the new file is opened, older files of the same app are rotated
//! away: only the most recent previous log survives.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::LevelFilter;
use thiserror::Error;

/// Errors raised while installing the logger.
#[derive(Debug, Error)]
pub enum LoggerError {
    /// The log directory or file could not be created.
    #[error("I/O error occurred: {0}")]
    Io(#[from] io::Error),
    /// A global logger was already installed.
    #[error("Logger already installed: {0}")]
    AlreadySet(#[from] log::SetLoggerError),
}

/// Parses `trace|debug|info|warn|error`; anything else is `info`.
pub fn parse_level(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

/// File name of a log started now.
pub fn log_file_name(app_name: &str) -> String {
    format!("{}_{}.log", app_name, Local::now().format("%Y-%m-%d_%H-%M-%S"))
}

/// Deletes all but the newest log file of `app_name` in `log_dir`.
/// Returns how many files were deleted.
///
/// File names embed a sortable timestamp, so the newest file is the one with
/// the greatest name.
pub fn rotate_logs(app_name: &str, log_dir: &Path) -> io::Result<usize> {
    let prefix = format!("{}_", app_name);
    let mut log_files: Vec<PathBuf> = fs::read_dir(log_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".log"))
        })
        .collect();

    // Newest first
    log_files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    let mut removed = 0;
    for old_file in log_files.iter().skip(1) {
        match fs::remove_file(old_file) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Error deleting old log file {}: {}", old_file.display(), e),
        }
    }
    Ok(removed)
}

/// Installs the global logger for `app_name`. Returns the path of the new
/// log file.
pub fn setup_logging(app_name: &str, log_dir: &Path, level: LevelFilter) -> Result<PathBuf, LoggerError> {
    fs::create_dir_all(log_dir)?;
    rotate_logs(app_name, log_dir)?;

    let log_path = log_dir.join(log_file_name(app_name));

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(io::stdout())
        .chain(fern::log_file(&log_path)?)
        .apply()?;

    Ok(log_path)
}

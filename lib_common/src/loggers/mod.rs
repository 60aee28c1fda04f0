//! # Loggers
//!
//! Log sink setup for the binaries. Library code only uses the `log` macros.

/// `fern` dispatcher writing to stdout and a rotated, timestamped file.
pub mod loggerlocal;

pub use loggerlocal::{parse_level, rotate_logs, setup_logging, LoggerError};

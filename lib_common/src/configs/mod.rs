//! # Configuration Modules
//!
//! Typed settings shared by the engine and the binaries that host it. Loading
//! (files, environment, CLI) is the host's job; this module only defines the
//! shapes, their defaults and their validation.

/// Engine tuning: buffer threshold, timers, feed routing, membership source.
pub mod engine;

pub use engine::{ConfigError, EngineSettings};

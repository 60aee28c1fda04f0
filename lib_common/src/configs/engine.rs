//! # Engine Settings
//!
//! Every field is optional in configuration files; missing fields take the
//! defaults below. Field names are camelCase on the wire:
//!
//! ```json
//! {
//!   "bufferSize": 100,
//!   "flushIntervalMs": 10000,
//!   "idleCheckIntervalMs": 1000,
//!   "feeds": { "powerByBand": "states", "focus": "states", "calm": "states" },
//!   "invalidateOnFailure": false,
//!   "membershipTable": "tokens",
//!   "provider": "neurosity",
//!   "conflictKeys": { "states": ["user_id", "created_at"] }
//! }
//! ```
//!
//! `conflictKeys` names, per category, the unique key a batched write
//! upserts on. A category without keys is written with plain inserts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::ingestors::FeedKind;
use crate::telemetry::{Category, ProviderKind};

/// Errors raised by settings validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// `bufferSize` must be at least one.
    #[error("bufferSize must be greater than zero")]
    ZeroBufferSize,
    /// A timer period is zero.
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    /// No feed is configured, so sessions could never receive anything.
    #[error("at least one feed must be configured")]
    NoFeeds,
    /// A table or category name is not a plain SQL identifier.
    #[error("'{0}' is not a valid table name")]
    InvalidTable(String),
    /// A conflict key is not a plain SQL identifier.
    #[error("'{0}' is not a valid column name")]
    InvalidColumn(String),
}

/// # Engine Settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Buffer length that triggers an immediate flush.
    pub buffer_size: usize,
    /// Delay of the one-shot flush timer, in milliseconds.
    pub flush_interval_ms: u64,
    /// Period of the per-session idle check, in milliseconds.
    pub idle_check_interval_ms: u64,
    /// Feeds each session subscribes to, and the category each one writes to.
    pub feeds: BTreeMap<FeedKind, Category>,
    /// Mark a member's credential invalid when its session fails to start.
    pub invalidate_on_failure: bool,
    /// Membership table read and watched by the watcher.
    pub membership_table: String,
    /// Provider whose members this engine serves.
    pub provider: ProviderKind,
    /// Unique key columns of each category's table.
    pub conflict_keys: BTreeMap<Category, Vec<String>>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            flush_interval_ms: 10_000,
            idle_check_interval_ms: 1_000,
            feeds: FeedKind::ALL.iter().map(|f| (*f, Category::states())).collect(),
            invalidate_on_failure: false,
            membership_table: "tokens".to_string(),
            provider: ProviderKind::Neurosity,
            conflict_keys: BTreeMap::new(),
        }
    }
}

impl EngineSettings {
    /// Flush timer delay.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Idle check period.
    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("flushIntervalMs"));
        }
        if self.idle_check_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("idleCheckIntervalMs"));
        }
        if self.feeds.is_empty() {
            return Err(ConfigError::NoFeeds);
        }
        if !is_identifier(&self.membership_table) {
            return Err(ConfigError::InvalidTable(self.membership_table.clone()));
        }
        if let Some(bad) = self.feeds.values().find(|c| !is_identifier(c.as_str())) {
            return Err(ConfigError::InvalidTable(bad.to_string()));
        }
        for (category, keys) in &self.conflict_keys {
            if !is_identifier(category.as_str()) {
                return Err(ConfigError::InvalidTable(category.to_string()));
            }
            if let Some(bad) = keys.iter().find(|k| !is_identifier(k)) {
                return Err(ConfigError::InvalidColumn(bad.clone()));
            }
        }
        Ok(())
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
        _ => false,
    }
}

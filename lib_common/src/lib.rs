//! # lib_common
//!
//! Session lifecycle and buffered-write engine for per-user biosignal
//! telemetry. The always-on modules hold the engine and its capability
//! traits; concrete integrations sit behind cargo features:
//!
//! - `connections`: the PostgreSQL store.
//! - `ingestors`: the HTTP/WebSocket streaming provider and the retrying
//!   HTTP client it uses.
//! - `loggers`: `fern` log setup and rotation.
//! - `testkit`: in-memory collaborators for tests of dependent crates.

pub mod configs;
pub mod core;
pub mod ingestors;
pub mod store;
pub mod telemetry;

#[cfg(feature = "connections")]
pub mod connections;

#[cfg(feature = "ingestors")]
pub mod retrieve;

#[cfg(feature = "loggers")]
pub mod loggers;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

// Re-export the types every host touches
pub use crate::configs::{ConfigError, EngineSettings};
pub use crate::core::{
    Coalescer, CoalescerSettings, IsolationSettings, IsolationSupervisor, LifecycleManager, LifecycleSettings,
    MembershipWatcher, SessionControl, SessionState, SpawnMessage,
};
pub use crate::ingestors::{FeedKind, Provider, ProviderError};
pub use crate::store::{Store, StoreError};
pub use crate::telemetry::{Category, Entity, ProviderKind, Record};

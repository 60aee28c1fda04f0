//! # Core Engine Module
//!
//! The session lifecycle and buffered-write engine. Components, leaves first:
//!
//! - **`coalescer`**: the process-wide write buffer. Records are grouped per
//!   category and written in batches, on size or on a one-shot timer.
//!
//! - **`registry`** and **`session`**: the per-entity session map and the
//!   session itself (tokens, feed tasks, idle check, state machine).
//!
//! - **`lifecycle`**: `LifecycleManager`, which starts, replaces, stops and
//!   introspects sessions.
//!
//! - **`membership`**: the watcher that turns the membership table and its
//!   change feed into session starts and stops.
//!
//! - **`isolation`**: the supervisor that runs each entity's session in its
//!   own worker process instead.
//!
//! The watcher does not care which of the last two it drives: both implement
//! `SessionControl`.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use async_trait::async_trait;

use crate::telemetry::Entity;

/// Batches records per category and flushes them to the store.
pub mod coalescer;
/// Worker-process supervisor.
pub mod isolation;
/// In-process session management.
pub mod lifecycle;
/// Membership snapshot and change routing.
pub mod membership;
/// Per-entity session map.
pub mod registry;
/// Session state, handle and tasks.
pub mod session;

// --- Public API Re-exports ---
pub use coalescer::{Coalescer, CoalescerSettings, FlushReport, IngestError};
pub use isolation::{IsolationError, IsolationSettings, IsolationSupervisor, SpawnMessage, UnitExit};
pub use lifecycle::{LifecycleManager, LifecycleSettings};
pub use membership::{route, MembershipError, MembershipWatcher, Route};
pub use registry::Registry;
pub use session::{SessionError, SessionHandle, SessionInfo, SessionState};

/// # Session Control
///
/// Where the membership watcher sends its decisions. Implementations handle
/// and log their own failures; the watcher only routes.
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Starts, or restarts, the session for `entity`.
    async fn start(&self, entity: &Entity);

    /// Stops the session of `internal_id`, if there is one.
    async fn stop(&self, internal_id: &str);
}

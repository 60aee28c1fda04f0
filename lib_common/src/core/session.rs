//! # Sessions
//!
//! A session is the live link between one entity and the provider: a parent
//! cancellation token, one subscription task per feed (each holding a child
//! token), the last-activity flag and the idle-check task.
//!
//! ```text
//! Idle -> Authenticating -> Active -> IdleDetected -> Terminated
//!              |                |
//!              +-> Terminated   +-> Terminated (stop / superseded / feeds ended)
//! ```
//!
//! Teardown is first-caller-wins: whichever path closes the session (explicit
//! stop, replacement by a newer start, idle detection, the last feed ending)
//! cancels the parent token and deregisters it. Every other path becomes a
//! no-op.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::coalescer::Coalescer;
use crate::core::registry::Registry;
use crate::ingestors::{FeedKind, FeedStream, ProviderError};
use crate::telemetry::{Category, Entity, ProviderKind};

/// Errors raised while starting a session.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// The provider would not hand out a credential. Not retried.
    #[error("Credential exchange failed for {internal_id}: {source}")]
    CredentialExchange {
        /// Entity whose session was aborted.
        internal_id: String,
        /// Provider failure.
        #[source]
        source: ProviderError,
    },
    /// A feed could not be opened, so the session was aborted.
    #[error("Subscription failed for {internal_id}: {source}")]
    Subscribe {
        /// Entity whose session was aborted.
        internal_id: String,
        /// Provider failure.
        #[source]
        source: ProviderError,
    },
    /// A newer start or a stop for the same entity arrived while this one
    /// was still authenticating.
    #[error("Session {session_id} for {internal_id} was superseded before it became active")]
    Superseded {
        /// Entity concerned.
        internal_id: String,
        /// The abandoned session.
        session_id: u64,
    },
    /// The manager no longer accepts sessions.
    #[error("Lifecycle manager is shut down")]
    ShutDown,
}

/// Lifecycle state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    /// Created, not yet authenticating.
    Idle,
    /// Exchanging the entity's identity for a credential.
    Authenticating,
    /// Feeds are open and flowing.
    Active,
    /// The idle check saw no activity for a full period.
    IdleDetected,
    /// Torn down.
    Terminated,
}

impl SessionState {
    /// True for the states a session never leaves.
    pub fn is_finished(&self) -> bool {
        matches!(self, SessionState::IdleDetected | SessionState::Terminated)
    }
}

/// Point-in-time view of a registered session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Unique id of this session instance.
    pub session_id: u64,
    /// Entity internal id.
    pub internal_id: String,
    /// Entity external id.
    pub external_id: String,
    /// Current state.
    pub state: SessionState,
    /// Number of feed subscriptions still running.
    pub live_feeds: usize,
}

struct SessionShared {
    session_id: u64,
    internal_id: String,
    external_id: String,
    token: CancellationToken,
    state: watch::Sender<SessionState>,
    activity: AtomicBool,
    live_feeds: AtomicUsize,
    closed: AtomicBool,
}

/// # Session Handle
///
/// Shared reference to one session. Cloning does not create a new session.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionShared>,
}

impl SessionHandle {
    /// Creates a session for `entity` in the `Idle` state.
    pub fn new(session_id: u64, entity: &Entity) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            inner: Arc::new(SessionShared {
                session_id,
                internal_id: entity.internal_id.clone(),
                external_id: entity.external_id.clone(),
                token: CancellationToken::new(),
                state,
                activity: AtomicBool::new(false),
                live_feeds: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Unique id of this session instance.
    pub fn session_id(&self) -> u64 {
        self.inner.session_id
    }

    /// Entity internal id.
    pub fn internal_id(&self) -> &str {
        &self.inner.internal_id
    }

    /// Entity external id.
    pub fn external_id(&self) -> &str {
        &self.inner.external_id
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Number of feed subscriptions still running.
    pub fn live_feeds(&self) -> usize {
        self.inner.live_feeds.load(Ordering::SeqCst)
    }

    /// True once the session has been torn down.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Parent token; cancelled by teardown.
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Snapshot for introspection.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id(),
            internal_id: self.internal_id().to_string(),
            external_id: self.external_id().to_string(),
            state: self.state(),
            live_feeds: self.live_feeds(),
        }
    }

    /// Moves `from -> to`. Returns false, changing nothing, when the session
    /// is not in `from` (for instance because it was already torn down).
    pub fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Marks the session as having seen an event since the last idle check.
    pub fn mark_activity(&self) {
        self.inner.activity.store(true, Ordering::SeqCst);
    }

    /// Reads and resets the activity flag in one step.
    pub fn take_activity(&self) -> bool {
        self.inner.activity.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn set_live_feeds(&self, count: usize) {
        self.inner.live_feeds.store(count, Ordering::SeqCst);
    }

    // Returns the number of feeds still running.
    pub(crate) fn feed_ended(&self) -> usize {
        self.inner.live_feeds.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }

    /// Tears the session down. Only the first call has an effect; it returns
    /// true. `IdleDetected` is published before the final `Terminated`.
    pub fn close(&self, reason: SessionState) -> bool {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if reason == SessionState::IdleDetected {
            self.inner.state.send_replace(SessionState::IdleDetected);
        }
        self.inner.token.cancel();
        self.inner.state.send_replace(SessionState::Terminated);
        true
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id())
            .field("internal_id", &self.internal_id())
            .field("state", &self.state())
            .finish()
    }
}

/// What a running session needs to move records and to take itself down.
pub(crate) struct SessionRuntime {
    pub(crate) handle: SessionHandle,
    pub(crate) registry: Arc<Registry>,
    pub(crate) coalescer: Coalescer,
    pub(crate) provider: ProviderKind,
}

impl SessionRuntime {
    /// Closes the session and removes it from the registry, unless a newer
    /// session already took its slot.
    pub(crate) fn teardown(&self, reason: SessionState) {
        if self.handle.close(reason) {
            self.registry.remove_if(self.handle.internal_id(), self.handle.session_id());
            log::info!(
                "Session {} for {} torn down ({:?})",
                self.handle.session_id(),
                self.handle.internal_id(),
                reason
            );
        }
    }

    /// Pumps one feed into the coalescer until the subscription is cancelled,
    /// the feed ends or a write fails. Cancelling the child token stops this
    /// feed only.
    pub(crate) async fn run_feed(self: Arc<Self>, feed: FeedKind, category: Category, mut stream: FeedStream) {
        let token = self.handle.token().child_token();
        let internal_id = self.handle.internal_id().to_string();

        let reason = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break "cancelled".to_string(),
                next = stream.next() => {
                    let Some(event) = next else {
                        break "feed ended".to_string();
                    };
                    if token.is_cancelled() {
                        break "cancelled".to_string();
                    }

                    self.handle.mark_activity();
                    let record = event.into_record(&internal_id, self.provider);
                    if let Err(e) = self.coalescer.enqueue(record, category.clone()) {
                        token.cancel();
                        break format!("write failed: {}", e);
                    }
                }
            }
        };
        drop(stream);

        // On-cancel cleanup runs on every exit path.
        let remaining = self.handle.feed_ended();
        log::info!(
            "Subscription '{}' for {} closed: {} ({} still open)",
            feed,
            internal_id,
            reason,
            remaining
        );
        if remaining == 0 {
            self.teardown(SessionState::Terminated);
        }
    }

    /// Checks the activity flag every `period`. A period without activity
    /// tears the session down.
    pub(crate) async fn run_idle_check(self: Arc<Self>, period: Duration) {
        let token = self.handle.token().clone();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    if !self.handle.take_activity() {
                        log::warn!(
                            "No activity for {} within {:?}; closing session {}",
                            self.handle.internal_id(),
                            period,
                            self.handle.session_id()
                        );
                        self.teardown(SessionState::IdleDetected);
                        return;
                    }
                }
            }
        }
    }
}

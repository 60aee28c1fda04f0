//! # Session Lifecycle Manager
//!
//! Owns every in-process session. `start` replaces whatever session the entity
//! had, exchanges the entity's identity for a credential, opens all configured
//! feeds concurrently and then runs one task per feed plus the idle check.
//!
//! Operations on the same entity are ordered by registration: `start` puts its
//! session in the registry before its first await, so a later `start` or
//! `stop` for that entity always closes it. A session closed while it was
//! still authenticating notices at its next step and abandons the start.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;

use crate::configs::EngineSettings;
use crate::core::coalescer::Coalescer;
use crate::core::registry::Registry;
use crate::core::session::{SessionError, SessionHandle, SessionInfo, SessionRuntime, SessionState};
use crate::core::SessionControl;
use crate::ingestors::{FeedKind, Provider};
use crate::store::Store;
use crate::telemetry::{Category, Entity, MemberStatus};

/// Per-session behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleSettings {
    /// Period of the idle check.
    pub idle_check_interval: Duration,
    /// Feeds to open and where each one's records go.
    pub feeds: BTreeMap<FeedKind, Category>,
    /// Flag the member's credential invalid when authentication fails.
    pub invalidate_on_failure: bool,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self::from(&EngineSettings::default())
    }
}

impl From<&EngineSettings> for LifecycleSettings {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            idle_check_interval: settings.idle_check_interval(),
            feeds: settings.feeds.clone(),
            invalidate_on_failure: settings.invalidate_on_failure,
        }
    }
}

struct ManagerInner {
    provider: Arc<dyn Provider>,
    store: Arc<dyn Store>,
    coalescer: Coalescer,
    registry: Arc<Registry>,
    settings: LifecycleSettings,
    tasks: TaskTracker,
    shut_down: AtomicBool,
}

/// # Lifecycle Manager
///
/// Cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<ManagerInner>,
}

impl LifecycleManager {
    /// Creates a manager with no sessions.
    pub fn new(
        provider: Arc<dyn Provider>,
        store: Arc<dyn Store>,
        coalescer: Coalescer,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                provider,
                store,
                coalescer,
                registry: Arc::new(Registry::new()),
                settings,
                tasks: TaskTracker::new(),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Starts (or restarts) the session for `entity` and waits until it is
    /// active or has failed.
    pub async fn start(&self, entity: &Entity) -> Result<SessionInfo, SessionError> {
        let runtime = self.register(entity)?;
        self.activate(runtime, entity).await
    }

    /// Tears down the entity's session. Returns false when it had none.
    pub fn stop(&self, internal_id: &str) -> bool {
        match self.inner.registry.remove(internal_id) {
            Some(handle) => {
                if handle.close(SessionState::Terminated) {
                    log::info!("Session {} for {} stopped", handle.session_id(), internal_id);
                }
                true
            }
            None => false,
        }
    }

    /// The entity's registered session.
    pub fn lookup(&self, internal_id: &str) -> Option<SessionInfo> {
        self.inner.registry.get(internal_id).map(|handle| handle.info())
    }

    /// State updates of the entity's current session.
    pub fn subscribe_state(&self, internal_id: &str) -> Option<watch::Receiver<SessionState>> {
        self.inner.registry.get(internal_id).map(|handle| handle.subscribe_state())
    }

    /// Number of sessions in the `Active` state.
    pub fn active_count(&self) -> usize {
        self.inner
            .registry
            .snapshot()
            .iter()
            .filter(|handle| handle.state() == SessionState::Active)
            .count()
    }

    /// Number of registered sessions in any state.
    pub fn session_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// The coalescer sessions write to.
    pub fn coalescer(&self) -> &Coalescer {
        &self.inner.coalescer
    }

    /// Refuses new sessions, tears down every session and waits for their
    /// tasks to finish. Records already handed over stay buffered.
    pub async fn shutdown_all(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);

        let sessions = self.inner.registry.drain();
        log::info!("Shutting down {} sessions", sessions.len());
        for handle in sessions {
            handle.close(SessionState::Terminated);
        }

        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    // Synchronous half of `start`: registers the new session, displacing the
    // previous one.
    fn register(&self, entity: &Entity) -> Result<Arc<SessionRuntime>, SessionError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(SessionError::ShutDown);
        }

        let handle = SessionHandle::new(self.inner.registry.next_session_id(), entity);
        handle.transition(SessionState::Idle, SessionState::Authenticating);

        if let Some(previous) = self.inner.registry.insert(handle.clone()) {
            if previous.close(SessionState::Terminated) {
                log::info!(
                    "Session {} for {} replaced by session {}",
                    previous.session_id(),
                    entity.internal_id,
                    handle.session_id()
                );
            }
        }
        log::info!("Session {} for {}: authenticating", handle.session_id(), entity.internal_id);

        Ok(Arc::new(SessionRuntime {
            handle,
            registry: Arc::clone(&self.inner.registry),
            coalescer: self.inner.coalescer.clone(),
            provider: self.inner.provider.kind(),
        }))
    }

    async fn activate(&self, runtime: Arc<SessionRuntime>, entity: &Entity) -> Result<SessionInfo, SessionError> {
        let handle = runtime.handle.clone();
        let superseded = || SessionError::Superseded {
            internal_id: entity.internal_id.clone(),
            session_id: handle.session_id(),
        };

        // 1. Authenticate
        let credential = match self.inner.provider.exchange_credential(entity).await {
            Ok(credential) => credential,
            Err(source) => {
                if handle.is_closed() {
                    return Err(superseded());
                }
                runtime.teardown(SessionState::Terminated);
                log::error!("Session {} for {}: {}", handle.session_id(), entity.internal_id, source);
                self.invalidate(entity).await;
                return Err(SessionError::CredentialExchange {
                    internal_id: entity.internal_id.clone(),
                    source,
                });
            }
        };
        if handle.is_closed() {
            return Err(superseded());
        }
        log::info!("Session {} for {}: authenticated", handle.session_id(), entity.internal_id);

        // 2. Open every feed concurrently
        let provider = &self.inner.provider;
        let credential = &credential;
        let opened = join_all(self.inner.settings.feeds.iter().map(|(feed, category)| async move {
            (*feed, category.clone(), provider.subscribe(credential, *feed).await)
        }))
        .await;

        let mut streams = Vec::with_capacity(opened.len());
        for (feed, category, result) in opened {
            match result {
                Ok(stream) => streams.push((feed, category, stream)),
                Err(source) => {
                    runtime.teardown(SessionState::Terminated);
                    log::error!("Session {} for {}: {}", handle.session_id(), entity.internal_id, source);
                    return Err(SessionError::Subscribe {
                        internal_id: entity.internal_id.clone(),
                        source,
                    });
                }
            }
        }

        // 3. Go live, unless a newer start or a stop got here first
        handle.set_live_feeds(streams.len());
        if !handle.transition(SessionState::Authenticating, SessionState::Active) {
            return Err(superseded());
        }

        for (feed, category, stream) in streams {
            self.inner
                .tasks
                .spawn(Arc::clone(&runtime).run_feed(feed, category, stream));
        }
        self.inner
            .tasks
            .spawn(Arc::clone(&runtime).run_idle_check(self.inner.settings.idle_check_interval));

        log::info!(
            "Session {} for {}: active with {} feeds",
            handle.session_id(),
            entity.internal_id,
            handle.live_feeds()
        );
        Ok(handle.info())
    }

    async fn invalidate(&self, entity: &Entity) {
        if !self.inner.settings.invalidate_on_failure {
            return;
        }
        match self
            .inner
            .store
            .update_status(&entity.external_id, &MemberStatus::invalid())
            .await
        {
            Ok(()) => log::warn!("Marked credential of {} invalid", entity.external_id),
            Err(e) => log::error!("Failed to mark credential of {} invalid: {}", entity.external_id, e),
        }
    }
}

#[async_trait]
impl SessionControl for LifecycleManager {
    /// Registers the session now and finishes authentication in the
    /// background, so the caller is not held up by the provider.
    async fn start(&self, entity: &Entity) {
        let runtime = match self.register(entity) {
            Ok(runtime) => runtime,
            Err(e) => {
                log::warn!("Not starting session for {}: {}", entity.internal_id, e);
                return;
            }
        };

        let this = self.clone();
        let entity = entity.clone();
        self.inner.tasks.spawn(async move {
            match this.activate(runtime, &entity).await {
                Ok(_) => {}
                Err(e @ SessionError::Superseded { .. }) => log::debug!("{}", e),
                Err(e) => log::error!("Failed to start session for {}: {}", entity.internal_id, e),
            }
        });
    }

    async fn stop(&self, internal_id: &str) {
        if !LifecycleManager::stop(self, internal_id) {
            log::debug!("No session to stop for {}", internal_id);
        }
    }
}

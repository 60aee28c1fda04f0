//! # Membership Watcher
//!
//! Turns the membership table into session starts and stops. At startup it
//! reads the full membership once; afterwards it follows the table's change
//! feed in delivery order. Routing of each change is a pure function
//! (`route`) so the decision table can be tested without any session.
//!
//! | Change                                      | Action |
//! |---------------------------------------------|--------|
//! | INSERT, provider matches, not invalid       | start  |
//! | UPDATE, provider matches, not invalid       | start (restart with new credential) |
//! | UPDATE, provider matches, marked invalid    | stop   |
//! | UPDATE, provider changed away from ours     | stop   |
//! | DELETE, provider ours or unknown            | stop   |
//! | anything for another provider               | ignore |

use std::sync::Arc;

use futures_util::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::SessionControl;
use crate::store::{ChangeStream, Store, StoreError};
use crate::telemetry::{Entity, MemberFilter, MembershipEvent, ProviderKind};

/// Errors raised by the watcher.
#[derive(Debug, Clone, Error)]
pub enum MembershipError {
    /// The initial membership read failed.
    #[error("Failed to load initial members: {0}")]
    Load(#[source] StoreError),
    /// The change feed could not be opened.
    #[error("Failed to watch membership changes: {0}")]
    Watch(#[source] StoreError),
    /// The change feed ended. It cannot be resumed.
    #[error("Membership change feed ended")]
    FeedEnded,
}

/// What a membership change asks of the session layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Start, or restart, the entity's session.
    Start(Entity),
    /// Stop the session with this internal id.
    Stop(String),
    /// Not ours.
    Ignore,
}

/// Decides what `event` means for sessions of `provider`.
pub fn route(event: &MembershipEvent, provider: ProviderKind) -> Route {
    match event {
        MembershipEvent::Added(row) => {
            if row.is_marked_invalid() {
                return Route::Ignore;
            }
            row.to_entity(provider).map_or(Route::Ignore, Route::Start)
        }
        MembershipEvent::Updated { old, new } => match new.to_entity(provider) {
            Some(_) if new.is_marked_invalid() => Route::Stop(new.internal_id.clone()),
            Some(entity) => Route::Start(entity),
            None => match old {
                Some(old) if old.provider_kind() == Some(provider) => Route::Stop(old.internal_id.clone()),
                _ => Route::Ignore,
            },
        },
        // Deleted row images often carry only the key columns.
        MembershipEvent::Removed(row) => match row.provider.as_deref() {
            Some(tag) if ProviderKind::parse(tag) != Some(provider) => Route::Ignore,
            _ => Route::Stop(row.internal_id.clone()),
        },
    }
}

/// # Membership Watcher
pub struct MembershipWatcher {
    store: Arc<dyn Store>,
    control: Arc<dyn SessionControl>,
    provider: ProviderKind,
    table: String,
}

impl MembershipWatcher {
    /// Creates a watcher over `table` for members of `provider`.
    pub fn new(store: Arc<dyn Store>, control: Arc<dyn SessionControl>, provider: ProviderKind, table: &str) -> Self {
        Self {
            store,
            control,
            provider,
            table: table.to_string(),
        }
    }

    /// Reads the current membership once. Members whose credential is
    /// marked invalid are left out.
    pub async fn load_initial_members(&self) -> Result<Vec<Entity>, MembershipError> {
        let rows = self
            .store
            .select_members(&MemberFilter { provider: self.provider })
            .await
            .map_err(MembershipError::Load)?;

        let total = rows.len();
        let members: Vec<Entity> = rows
            .iter()
            .filter(|row| !row.is_marked_invalid())
            .filter_map(|row| row.to_entity(self.provider))
            .collect();

        log::info!(
            "Loaded {} {} members ({} skipped)",
            members.len(),
            self.provider,
            total - members.len()
        );
        Ok(members)
    }

    /// Loads the initial membership and starts a session for each member.
    pub async fn start_initial(&self) -> Result<usize, MembershipError> {
        let members = self.load_initial_members().await?;
        for entity in &members {
            self.control.start(entity).await;
        }
        Ok(members.len())
    }

    /// Opens the change feed of the membership table.
    pub async fn watch_changes(&self) -> Result<ChangeStream, MembershipError> {
        self.store.watch_changes(&self.table).await.map_err(MembershipError::Watch)
    }

    /// Routes one change to the session layer and returns the decision.
    pub async fn apply(&self, event: &MembershipEvent) -> Route {
        let decision = route(event, self.provider);
        match &decision {
            Route::Start(entity) => {
                log::info!("Membership {:?} for {}: starting session", event.kind(), entity.internal_id);
                self.control.start(entity).await;
            }
            Route::Stop(internal_id) => {
                log::info!("Membership {:?} for {}: stopping session", event.kind(), internal_id);
                self.control.stop(internal_id).await;
            }
            Route::Ignore => {
                log::debug!("Membership {:?} for {}: ignored", event.kind(), event.internal_id());
            }
        }
        decision
    }

    /// Opens the change feed and follows it until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), MembershipError> {
        let changes = self.watch_changes().await?;
        self.follow(changes, shutdown).await
    }

    /// Follows an already opened change feed. Hosts open the feed before the
    /// initial load so that no change falls between the two. Malformed
    /// payloads are logged and skipped; the end of the feed is an error.
    pub async fn follow(&self, mut changes: ChangeStream, shutdown: CancellationToken) -> Result<(), MembershipError> {
        log::info!("Watching '{}' for membership changes", self.table);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    log::info!("Membership watcher stopped");
                    return Ok(());
                }
                next = changes.next() => match next {
                    Some(Ok(event)) => {
                        self.apply(&event).await;
                    }
                    Some(Err(e)) => log::warn!("Skipping membership change: {}", e),
                    None => {
                        log::error!("Membership change feed for '{}' ended", self.table);
                        return Err(MembershipError::FeedEnded);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{MemberRow, MemberStatus};
    use crate::testkit::{member, ControlCall, MemoryStore, RecordingControl};
    use serde_json::json;

    const NEURO: ProviderKind = ProviderKind::Neurosity;

    fn other_provider(row: MemberRow) -> MemberRow {
        MemberRow { provider: Some("muse".into()), ..row }
    }

    fn invalid(row: MemberRow) -> MemberRow {
        MemberRow { status: Some(MemberStatus::invalid()), ..row }
    }

    #[test]
    fn test_route_insert() {
        let row = member("u1", "E1", Some("t1"));
        match route(&MembershipEvent::Added(row.clone()), NEURO) {
            Route::Start(entity) => {
                assert_eq!(entity.internal_id, "E1");
                assert_eq!(entity.credential.as_deref(), Some("t1"));
            }
            other => panic!("unexpected route {:?}", other),
        }
        assert_eq!(route(&MembershipEvent::Added(other_provider(row.clone())), NEURO), Route::Ignore);
        assert_eq!(route(&MembershipEvent::Added(invalid(row)), NEURO), Route::Ignore);
    }

    #[test]
    fn test_route_update() {
        let old = member("u1", "E1", Some("t1"));
        let new = member("u1", "E1", Some("t2"));

        let rotated = MembershipEvent::Updated { old: Some(old.clone()), new: new.clone() };
        assert!(matches!(route(&rotated, NEURO), Route::Start(e) if e.credential.as_deref() == Some("t2")));

        let invalidated = MembershipEvent::Updated { old: Some(old.clone()), new: invalid(new.clone()) };
        assert_eq!(route(&invalidated, NEURO), Route::Stop("E1".into()));

        let moved_away = MembershipEvent::Updated { old: Some(old.clone()), new: other_provider(new.clone()) };
        assert_eq!(route(&moved_away, NEURO), Route::Stop("E1".into()));

        let never_ours = MembershipEvent::Updated { old: Some(other_provider(old)), new: other_provider(new.clone()) };
        assert_eq!(route(&never_ours, NEURO), Route::Ignore);

        let no_old_image = MembershipEvent::Updated { old: None, new: other_provider(new) };
        assert_eq!(route(&no_old_image, NEURO), Route::Ignore);
    }

    #[test]
    fn test_route_delete() {
        let row = member("u1", "E1", None);
        assert_eq!(route(&MembershipEvent::Removed(row.clone()), NEURO), Route::Stop("E1".into()));

        let key_only = MemberRow { provider: None, ..row.clone() };
        assert_eq!(route(&MembershipEvent::Removed(key_only), NEURO), Route::Stop("E1".into()));

        assert_eq!(route(&MembershipEvent::Removed(other_provider(row)), NEURO), Route::Ignore);
    }

    #[tokio::test]
    async fn test_initial_load_skips_invalid_and_foreign_members() {
        let store = Arc::new(MemoryStore::with_members(vec![
            member("u1", "E1", Some("t1")),
            invalid(member("u2", "E2", Some("t2"))),
            other_provider(member("u3", "E3", Some("t3"))),
            MemberRow { status: Some(MemberStatus(json!({ "valid": true }))), ..member("u4", "E4", None) },
        ]));
        let control = Arc::new(RecordingControl::default());
        let watcher = MembershipWatcher::new(store, control.clone(), NEURO, "tokens");

        assert_eq!(watcher.start_initial().await.unwrap(), 2);
        assert_eq!(control.started(), vec!["E1".to_string(), "E4".to_string()]);
    }

    #[tokio::test]
    async fn test_initial_load_follows_external_id_order() {
        let store = Arc::new(MemoryStore::with_members(vec![
            member("u3", "E3", Some("t3")),
            member("u1", "E1", Some("t1")),
            member("u2", "E2", Some("t2")),
        ]));
        let control = Arc::new(RecordingControl::default());
        let watcher = MembershipWatcher::new(store, control.clone(), NEURO, "tokens");

        let loaded = watcher.load_initial_members().await.unwrap();
        let ids: Vec<&str> = loaded.iter().map(|e| e.internal_id.as_str()).collect();
        assert_eq!(ids, vec!["E1", "E2", "E3"]);

        assert_eq!(watcher.start_initial().await.unwrap(), 3);
        assert_eq!(control.started(), vec!["E1".to_string(), "E2".to_string(), "E3".to_string()]);
    }

    #[tokio::test]
    async fn test_initial_load_failure() {
        let store = Arc::new(MemoryStore::default());
        store.fail_select(true);
        let control = Arc::new(RecordingControl::default());
        let watcher = MembershipWatcher::new(store, control.clone(), NEURO, "tokens");

        assert!(matches!(watcher.start_initial().await, Err(MembershipError::Load(_))));
        assert!(control.calls().is_empty());
    }

    #[tokio::test]
    async fn test_run_routes_changes_in_order_until_feed_ends() {
        let store = Arc::new(MemoryStore::default());
        let control = Arc::new(RecordingControl::default());
        let watcher = MembershipWatcher::new(store.clone(), control.clone(), NEURO, "tokens");

        // 1. Queue a start, a malformed payload, a restart and a removal
        store.push_change(MembershipEvent::Added(member("u1", "E1", Some("t1"))));
        store.push_change_error(StoreError::Payload("bad json".into()));
        store.push_change(MembershipEvent::Updated {
            old: Some(member("u1", "E1", Some("t1"))),
            new: member("u1", "E1", Some("t2")),
        });
        store.push_change(MembershipEvent::Added(other_provider(member("u9", "E9", None))));
        store.push_change(MembershipEvent::Removed(member("u1", "E1", None)));
        store.close_changes();

        // 2. The feed ending is reported
        let result = watcher.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(MembershipError::FeedEnded)));

        // 3. Order preserved, foreign member ignored
        let calls = control.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(&calls[0], ControlCall::Start(e) if e.credential.as_deref() == Some("t1")));
        assert!(matches!(&calls[1], ControlCall::Start(e) if e.credential.as_deref() == Some("t2")));
        assert_eq!(calls[2], ControlCall::Stop("E1".into()));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::default());
        let control = Arc::new(RecordingControl::default());
        let watcher = MembershipWatcher::new(store, control, NEURO, "tokens");

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert!(watcher.run(shutdown).await.is_ok());
    }
}

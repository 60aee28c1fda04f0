//! # Test Kit
//!
//! In-memory stand-ins for the engine's collaborators:
//!
//! - **`MemoryStore`**: a `Store` that records every batch and status update,
//!   with injectable per-category write failures, a failing member read and a
//!   change feed driven from the test.
//! - **`ScriptedProvider`**: a `Provider` whose feeds are channels the test
//!   pushes events into. Credentials are taken from the entity, so a test can
//!   tell which credential a subscription was opened with.
//! - **`RecordingControl`**: a `SessionControl` that only records calls.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;

use crate::core::SessionControl;
use crate::ingestors::{Credential, FeedEvent, FeedKind, FeedStream, Provider, ProviderError};
use crate::store::{ChangeStream, Store, StoreError};
use crate::telemetry::{Category, Entity, MemberFilter, MemberRow, MemberStatus, MembershipEvent, ProviderKind, Record};

type ChangeItem = Result<MembershipEvent, StoreError>;

struct StoreState {
    members: Vec<MemberRow>,
    fail_select: bool,
    failing: HashSet<Category>,
    write_delay: Option<Duration>,
    batches: Vec<(Category, Vec<Record>)>,
    statuses: Vec<(String, MemberStatus)>,
    change_tx: Option<mpsc::UnboundedSender<ChangeItem>>,
    change_rx: Option<mpsc::UnboundedReceiver<ChangeItem>>,
}

/// In-memory `Store`.
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(StoreState {
                members: Vec::new(),
                fail_select: false,
                failing: HashSet::new(),
                write_delay: None,
                batches: Vec::new(),
                statuses: Vec::new(),
                change_tx: Some(tx),
                change_rx: Some(rx),
            }),
        }
    }
}

impl MemoryStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().expect("MemoryStore lock poisoned")
    }

    /// Store pre-filled with membership rows.
    pub fn with_members(members: Vec<MemberRow>) -> Self {
        let store = Self::default();
        store.lock().members = members;
        store
    }

    pub fn fail_select(&self, fail: bool) {
        self.lock().fail_select = fail;
    }

    /// Every later write to `category` fails.
    pub fn fail_category(&self, category: &Category) {
        self.lock().failing.insert(category.clone());
    }

    /// Every later write takes `delay` before it lands.
    pub fn set_write_delay(&self, delay: Duration) {
        self.lock().write_delay = Some(delay);
    }

    pub fn heal_category(&self, category: &Category) {
        self.lock().failing.remove(category);
    }

    /// Successful batches, in write order.
    pub fn batches(&self) -> Vec<(Category, Vec<Record>)> {
        self.lock().batches.clone()
    }

    /// All records written to `category`, in write order.
    pub fn records_in(&self, category: &Category) -> Vec<Record> {
        self.lock()
            .batches
            .iter()
            .filter(|(c, _)| c == category)
            .flat_map(|(_, records)| records.iter().cloned())
            .collect()
    }

    pub fn status_updates(&self) -> Vec<(String, MemberStatus)> {
        self.lock().statuses.clone()
    }

    /// Delivers one change to the watcher. Returns false once the feed is closed.
    pub fn push_change(&self, event: MembershipEvent) -> bool {
        self.send_change(Ok(event))
    }

    pub fn push_change_error(&self, error: StoreError) -> bool {
        self.send_change(Err(error))
    }

    /// Ends the change feed.
    pub fn close_changes(&self) {
        self.lock().change_tx = None;
    }

    fn send_change(&self, item: ChangeItem) -> bool {
        match &self.lock().change_tx {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn select_members(&self, filter: &MemberFilter) -> Result<Vec<MemberRow>, StoreError> {
        let state = self.lock();
        if state.fail_select {
            return Err(StoreError::Query("select refused".into()));
        }
        let mut rows: Vec<MemberRow> = state
            .members
            .iter()
            .filter(|row| row.provider_kind() == Some(filter.provider))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        Ok(rows)
    }

    async fn watch_changes(&self, _table: &str) -> Result<ChangeStream, StoreError> {
        let rx = self
            .lock()
            .change_rx
            .take()
            .ok_or_else(|| StoreError::Connection("change feed already taken".into()))?;
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed())
    }

    async fn batch_upsert(&self, category: &Category, records: &[Record]) -> Result<(), StoreError> {
        let delay = self.lock().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.failing.contains(category) {
            return Err(StoreError::Query(format!("relation \"{}\" refused the write", category)));
        }
        state.batches.push((category.clone(), records.to_vec()));
        Ok(())
    }

    async fn update_status(&self, external_id: &str, status: &MemberStatus) -> Result<(), StoreError> {
        self.lock().statuses.push((external_id.to_string(), status.clone()));
        Ok(())
    }
}

struct OpenFeed {
    credential: String,
    feed: FeedKind,
    tx: mpsc::UnboundedSender<FeedEvent>,
}

#[derive(Default)]
struct ScriptState {
    refused: HashSet<String>,
    failing_feeds: HashSet<FeedKind>,
    exchange_delay: Option<Duration>,
    exchanges: Vec<Entity>,
    subscriptions: Vec<(String, FeedKind)>,
    open: Vec<OpenFeed>,
}

/// Scripted `Provider`.
///
/// The credential handed out for an entity is its stored credential, or
/// `cred-<external_id>` when it has none.
#[derive(Default)]
pub struct ScriptedProvider {
    state: Mutex<ScriptState>,
}

impl ScriptedProvider {
    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().expect("ScriptedProvider lock poisoned")
    }

    /// Exchanges for `external_id` answer without a credential.
    pub fn refuse_credential(&self, external_id: &str) {
        self.lock().refused.insert(external_id.to_string());
    }

    pub fn fail_feed(&self, feed: FeedKind) {
        self.lock().failing_feeds.insert(feed);
    }

    /// Every exchange takes `delay` before answering.
    pub fn set_exchange_delay(&self, delay: Duration) {
        self.lock().exchange_delay = Some(delay);
    }

    pub fn exchanges(&self) -> Vec<Entity> {
        self.lock().exchanges.clone()
    }

    /// `(credential, feed)` of every subscription ever opened.
    pub fn subscriptions(&self) -> Vec<(String, FeedKind)> {
        self.lock().subscriptions.clone()
    }

    /// Pushes `event` into every open `feed` subscription using `credential`.
    /// Returns how many subscriptions received it.
    pub fn push(&self, credential: &str, feed: FeedKind, event: FeedEvent) -> usize {
        let mut state = self.lock();
        state.open.retain(|f| !f.tx.is_closed());
        state
            .open
            .iter()
            .filter(|f| f.credential == credential && f.feed == feed)
            .filter(|f| f.tx.send(event.clone()).is_ok())
            .count()
    }

    /// Ends every open subscription to `feed`.
    pub fn end_feed(&self, feed: FeedKind) {
        self.lock().open.retain(|f| f.feed != feed);
    }

    /// Number of subscriptions whose stream is still held by a session.
    pub fn open_feeds(&self) -> usize {
        let mut state = self.lock();
        state.open.retain(|f| !f.tx.is_closed());
        state.open.len()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Neurosity
    }

    async fn exchange_credential(&self, entity: &Entity) -> Result<Credential, ProviderError> {
        let delay = {
            let mut state = self.lock();
            state.exchanges.push(entity.clone());
            state.exchange_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.lock().refused.contains(&entity.external_id) {
            return Err(ProviderError::NoCredential {
                external_id: entity.external_id.clone(),
            });
        }
        let token = entity
            .credential
            .clone()
            .unwrap_or_else(|| format!("cred-{}", entity.external_id));
        Ok(Credential::new(&token))
    }

    async fn subscribe(&self, credential: &Credential, feed: FeedKind) -> Result<FeedStream, ProviderError> {
        let mut state = self.lock();
        if state.failing_feeds.contains(&feed) {
            return Err(ProviderError::Subscribe {
                feed,
                reason: "scripted failure".into(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.subscriptions.push((credential.expose().to_string(), feed));
        state.open.push(OpenFeed {
            credential: credential.expose().to_string(),
            feed,
            tx,
        });
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) }).boxed())
    }
}

/// A call received by `RecordingControl`.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCall {
    Start(Entity),
    Stop(String),
}

/// `SessionControl` that records calls and does nothing else.
#[derive(Default)]
pub struct RecordingControl {
    calls: Mutex<Vec<ControlCall>>,
}

impl RecordingControl {
    pub fn calls(&self) -> Vec<ControlCall> {
        self.calls.lock().expect("RecordingControl lock poisoned").clone()
    }

    /// Internal ids of started entities, in call order.
    pub fn started(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ControlCall::Start(entity) => Some(entity.internal_id),
                ControlCall::Stop(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl SessionControl for RecordingControl {
    async fn start(&self, entity: &Entity) {
        self.calls
            .lock()
            .expect("RecordingControl lock poisoned")
            .push(ControlCall::Start(entity.clone()));
    }

    async fn stop(&self, internal_id: &str) {
        self.calls
            .lock()
            .expect("RecordingControl lock poisoned")
            .push(ControlCall::Stop(internal_id.to_string()));
    }
}

/// Membership row for the default provider.
pub fn member(external_id: &str, internal_id: &str, token: Option<&str>) -> MemberRow {
    MemberRow {
        external_id: external_id.to_string(),
        internal_id: internal_id.to_string(),
        token: token.map(str::to_string),
        provider: Some(ProviderKind::Neurosity.as_str().to_string()),
        status: None,
    }
}

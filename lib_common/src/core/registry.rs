//! # Session Registry
//!
//! The per-entity map of registered sessions, keyed by internal id. It holds at
//! most one session per entity: registering a new one hands back the session
//! it displaced so the caller can tear it down.
//!
//! Removal is generation-checked. A session that ends on its own only removes
//! its own slot, never the slot of a newer session for the same entity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::core::session::SessionHandle;

/// # Registry
#[derive(Default)]
pub struct Registry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
    next_id: AtomicU64,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a session id. Ids are never reused.
    pub fn next_session_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Registers `handle` for its entity and returns the session it replaced.
    pub fn insert(&self, handle: SessionHandle) -> Option<SessionHandle> {
        let mut sessions = self.sessions.lock().expect("Registry lock poisoned");
        sessions.insert(handle.internal_id().to_string(), handle)
    }

    /// Removes the entity's session, whichever it is.
    pub fn remove(&self, internal_id: &str) -> Option<SessionHandle> {
        let mut sessions = self.sessions.lock().expect("Registry lock poisoned");
        sessions.remove(internal_id)
    }

    /// Removes the entity's session only if it is still `session_id`.
    pub fn remove_if(&self, internal_id: &str, session_id: u64) -> Option<SessionHandle> {
        let mut sessions = self.sessions.lock().expect("Registry lock poisoned");
        match sessions.get(internal_id) {
            Some(current) if current.session_id() == session_id => sessions.remove(internal_id),
            _ => None,
        }
    }

    /// The entity's registered session, if any.
    pub fn get(&self, internal_id: &str) -> Option<SessionHandle> {
        let sessions = self.sessions.lock().expect("Registry lock poisoned");
        sessions.get(internal_id).cloned()
    }

    /// All registered sessions.
    pub fn snapshot(&self) -> Vec<SessionHandle> {
        let sessions = self.sessions.lock().expect("Registry lock poisoned");
        sessions.values().cloned().collect()
    }

    /// Empties the registry, returning what was in it.
    pub fn drain(&self) -> Vec<SessionHandle> {
        let mut sessions = self.sessions.lock().expect("Registry lock poisoned");
        sessions.drain().map(|(_, handle)| handle).collect()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().expect("Registry lock poisoned").len()
    }

    /// True when no session is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

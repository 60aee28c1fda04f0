//! # Store Capability
//!
//! The persistence store as seen by the engine. It is an external collaborator:
//! the engine only needs it to list members, stream membership changes, write
//! batches of records per category and flag a member's credential.
//!
//! The PostgreSQL implementation lives in `connections::db_postgres`; the
//! in-memory one used by tests lives in `testkit`.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::telemetry::{Category, MemberFilter, MemberRow, MemberStatus, MembershipEvent, Record};

/// Errors raised by a store implementation.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("Failed to connect to store: {0}")]
    Connection(String),
    /// A query or write was rejected.
    #[error("Query execution failed: {0}")]
    Query(String),
    /// A change-feed payload could not be decoded.
    #[error("Malformed change payload: {0}")]
    Payload(String),
}

/// Lazy, infinite sequence of membership changes in source delivery order.
pub type ChangeStream = BoxStream<'static, Result<MembershipEvent, StoreError>>;

/// # Store
///
/// Implementations must be safe to share across tasks; every method may be
/// called concurrently.
#[async_trait]
pub trait Store: Send + Sync {
    /// Reads the full current membership matching `filter`, ordered by
    /// external id.
    async fn select_members(&self, filter: &MemberFilter) -> Result<Vec<MemberRow>, StoreError>;

    /// Opens a standing subscription to the membership table's change feed.
    async fn watch_changes(&self, table: &str) -> Result<ChangeStream, StoreError>;

    /// Writes `records` to the table named by `category` as one batched
    /// insert-or-update.
    async fn batch_upsert(&self, category: &Category, records: &[Record]) -> Result<(), StoreError>;

    /// Overwrites the status column of the member with `external_id`.
    async fn update_status(&self, external_id: &str, status: &MemberStatus) -> Result<(), StoreError>;
}

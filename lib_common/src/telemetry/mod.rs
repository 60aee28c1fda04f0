//! # Telemetry Domain Model
//!
//! Plain data types shared by every layer of the ingest engine: the tracked
//! `Entity`, the two record shapes produced by provider feeds, the destination
//! `Category` of a record, and the membership rows and change events read from
//! the store.
//!
//! Nothing in here performs I/O. The `core` components move these values
//! between the provider, the coalescer and the store.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Tracked subjects and their provider.
pub mod entity;
/// Membership rows, filters and change events.
pub mod membership;
/// Record shapes and destination categories.
pub mod record;

// --- Public API Re-exports ---
pub use entity::{Entity, ProviderKind};
pub use membership::{ChangeKind, MemberFilter, MemberRow, MemberStatus, MembershipEvent};
pub use record::{
    BandPowerMetadata, BandPowerRecord, Category, Destined, ProbabilityMetadata, ProbabilityRecord,
    Record,
};

//! # Connections Module
//!
//! Persistent connections to external services. Currently the PostgreSQL
//! store backing membership, change notifications and record batches.

/// PostgreSQL pool and `Store` implementation.
pub mod db_postgres;

pub use db_postgres::PgStore;

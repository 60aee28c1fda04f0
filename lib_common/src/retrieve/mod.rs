//! # Data Retrieval Module
//!
//! Generic HTTP plumbing shared by the provider clients. It keeps request
//! building, retry policy and JSON response handling in one place so the
//! ingestors only deal with their own payloads.
//!
//! ## Contained Modules:
//!
//! - **`http_client`**: An `ApiClient` built on `reqwest` and
//!   `reqwest-middleware`, retrying transient failures with exponential
//!   backoff.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// HTTP API client with retry middleware.
pub mod http_client;

pub use http_client::{ApiClient, ApiResponse, HttpError};

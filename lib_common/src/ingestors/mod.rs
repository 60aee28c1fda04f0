//! # Data Ingestors Module
//!
//! This module is the "front door" for device telemetry. It defines the
//! provider capability the session lifecycle manager consumes, and the
//! concrete provider client that speaks to the remote streaming API.
//!
//! ## Provider Capability:
//! - **Credential exchange**: an entity's identity is traded for a provider
//!   credential. A provider that answers without a credential fails the
//!   exchange; the session start is aborted and not retried.
//! - **Feed subscription**: each named feed (`powerByBand`, `focus`, `calm`)
//!   yields a live push sequence of `FeedEvent`s. Dropping the stream is the
//!   cancellation; the session owns that lifetime through its tokens.
//!
//! ## Contained Modules:
//! - **`stream_api`** (feature `ingestors`): HTTP OAuth exchange plus one
//!   WebSocket per subscribed feed.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

#[cfg(feature = "ingestors")]
/// The HTTP + WebSocket client for the remote streaming API.
pub mod stream_api;

#[cfg(feature = "ingestors")]
pub use stream_api::{StreamApiConfig, StreamApiProvider};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::telemetry::{Entity, ProviderKind, Record};

/// Errors raised by a provider.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The provider answered the exchange without a credential.
    #[error("Provider returned no credential for {external_id}")]
    NoCredential {
        /// The entity whose exchange failed.
        external_id: String,
    },
    /// The exchange request itself failed.
    #[error("Credential exchange failed: {0}")]
    Exchange(String),
    /// A feed could not be opened.
    #[error("Failed to subscribe to feed '{feed}': {reason}")]
    Subscribe {
        /// The feed being opened.
        feed: FeedKind,
        /// Why the subscription failed.
        reason: String,
    },
    /// A feed frame did not match the feed's event shape.
    #[error("Malformed '{feed}' frame: {reason}")]
    Frame {
        /// The feed the frame arrived on.
        feed: FeedKind,
        /// What was wrong with it.
        reason: String,
    },
}

/// Named live feeds exposed by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FeedKind {
    /// Power per frequency band, per channel.
    #[serde(rename = "powerByBand")]
    PowerByBand,
    /// Focus probability.
    #[serde(rename = "focus")]
    Focus,
    /// Calm probability.
    #[serde(rename = "calm")]
    Calm,
}

impl FeedKind {
    /// Every feed, in subscription order.
    pub const ALL: [FeedKind; 3] = [FeedKind::PowerByBand, FeedKind::Focus, FeedKind::Calm];

    /// The feed name used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            FeedKind::PowerByBand => "powerByBand",
            FeedKind::Focus => "focus",
            FeedKind::Calm => "calm",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One event pushed by a feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A band-power snapshot.
    BandPower {
        /// Power per band, one value per channel.
        bands: BTreeMap<String, Vec<f64>>,
    },
    /// A probability with its label.
    Probability {
        /// Probability in `[0, 1]`.
        probability: f64,
        /// Provider label (`focus`, `calm`, ..).
        label: String,
    },
}

impl FeedEvent {
    /// Maps the event into the record shape persisted for `internal_id`.
    pub fn into_record(self, internal_id: &str, provider: ProviderKind) -> Record {
        match self {
            FeedEvent::BandPower { bands } => Record::band_power(internal_id, bands, provider.as_str()),
            FeedEvent::Probability { probability, label } => {
                Record::probability(internal_id, probability, &label, provider.as_str())
            }
        }
    }

    /// Decodes one JSON text frame received on `feed`.
    ///
    /// - `powerByBand`: `{"data": {"alpha": [..], "beta": [..], ..}, ..}`
    /// - `focus` / `calm`: `{"probability": 0.42, "label": "focus", ..}`
    pub fn from_frame(feed: FeedKind, text: &str) -> Result<Self, ProviderError> {
        let frame_err = |reason: String| ProviderError::Frame { feed, reason };
        let value: Value = serde_json::from_str(text).map_err(|e| frame_err(e.to_string()))?;

        match feed {
            FeedKind::PowerByBand => {
                let data = value
                    .get("data")
                    .and_then(Value::as_object)
                    .ok_or_else(|| frame_err("missing 'data' object".to_string()))?;

                let mut bands = BTreeMap::new();
                for (band, powers) in data {
                    let powers = match powers {
                        Value::Array(items) => items.iter().filter_map(Value::as_f64).collect(),
                        Value::Number(n) => n.as_f64().into_iter().collect(),
                        _ => return Err(frame_err(format!("band '{}' is not numeric", band))),
                    };
                    bands.insert(band.clone(), powers);
                }
                Ok(FeedEvent::BandPower { bands })
            }
            FeedKind::Focus | FeedKind::Calm => {
                let probability = value
                    .get("probability")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| frame_err("missing numeric 'probability'".to_string()))?;
                let label = value
                    .get("label")
                    .and_then(Value::as_str)
                    .unwrap_or(feed.name())
                    .to_string();
                Ok(FeedEvent::Probability { probability, label })
            }
        }
    }
}

/// Opaque provider credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wraps a raw token.
    pub fn new(token: &str) -> Self {
        Self(token.to_string())
    }

    /// The raw token, for placing into request headers.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Live push sequence of one feed. Dropping it cancels the subscription.
pub type FeedStream = BoxStream<'static, FeedEvent>;

/// # Provider
///
/// The device authentication and streaming capability.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Which provider this is; stamped into record metadata.
    fn kind(&self) -> ProviderKind;

    /// Exchanges the entity's identity for a credential.
    async fn exchange_credential(&self, entity: &Entity) -> Result<Credential, ProviderError>;

    /// Opens a live subscription to `feed` using `credential`.
    async fn subscribe(&self, credential: &Credential, feed: FeedKind) -> Result<FeedStream, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_by_band_frame() {
        let frame = r#"{"label":"powerByBand","data":{"alpha":[1.0,2.0],"gamma":3.5},"info":{"channelNames":["CP3","C3"]}}"#;
        let event = FeedEvent::from_frame(FeedKind::PowerByBand, frame).unwrap();
        match event {
            FeedEvent::BandPower { bands } => {
                assert_eq!(bands["alpha"], vec![1.0, 2.0]);
                assert_eq!(bands["gamma"], vec![3.5]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_probability_frames_default_label_to_feed() {
        let focus = FeedEvent::from_frame(FeedKind::Focus, r#"{"probability":0.4,"label":"focus"}"#).unwrap();
        assert_eq!(focus, FeedEvent::Probability { probability: 0.4, label: "focus".into() });

        let calm = FeedEvent::from_frame(FeedKind::Calm, r#"{"probability":0.9}"#).unwrap();
        assert_eq!(calm, FeedEvent::Probability { probability: 0.9, label: "calm".into() });
    }

    #[test]
    fn test_malformed_frames_are_rejected() {
        assert!(FeedEvent::from_frame(FeedKind::Focus, r#"{"label":"focus"}"#).is_err());
        assert!(FeedEvent::from_frame(FeedKind::PowerByBand, r#"{"data":{"alpha":"x"}}"#).is_err());
        assert!(FeedEvent::from_frame(FeedKind::Calm, "{").is_err());
    }

    #[test]
    fn test_event_maps_to_record_with_provider_tag() {
        let record = FeedEvent::Probability { probability: 0.5, label: "calm".into() }
            .into_record("E9", ProviderKind::Neurosity);
        assert_eq!(record, Record::probability("E9", 0.5, "calm", "neurosity"));
    }
}

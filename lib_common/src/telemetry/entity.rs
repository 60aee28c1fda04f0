//! # Tracked Entities
//!
//! An `Entity` is one subject whose device telemetry is ingested. It carries two
//! identities: the external id known to the device provider, and the internal id
//! stamped on every persisted record. The lifecycle manager keys its sessions on
//! the internal id.

use serde::{Deserialize, Serialize};
use std::fmt;

/// # Provider Kind
///
/// The live-data providers this engine knows how to talk to. Membership rows
/// naming any other provider are ignored by the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// The wearable EEG headset provider.
    Neurosity,
}

impl ProviderKind {
    /// The tag written into record metadata and matched against membership rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Neurosity => "neurosity",
        }
    }

    /// Parses a provider tag as stored in the membership table.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "neurosity" => Some(ProviderKind::Neurosity),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// # Entity
///
/// A tracked subject. Invariant upheld by the lifecycle manager: at most one
/// active session per `internal_id`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Identifier known to the device provider, used for credential exchange.
    pub external_id: String,
    /// Identifier stamped on persisted records (`user_id` column).
    pub internal_id: String,
    /// Opaque token last stored for this entity, if any.
    pub credential: Option<String>,
    /// Which provider serves this entity.
    pub provider: ProviderKind,
}

impl Entity {
    /// Creates an entity without a stored credential.
    pub fn new(external_id: &str, internal_id: &str, provider: ProviderKind) -> Self {
        Self {
            external_id: external_id.to_string(),
            internal_id: internal_id.to_string(),
            credential: None,
            provider,
        }
    }

    /// Returns the same entity carrying `credential`.
    pub fn with_credential(mut self, credential: &str) -> Self {
        self.credential = Some(credential.to_string());
        self
    }
}

// Credentials must never reach the logs.
impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("external_id", &self.external_id)
            .field("internal_id", &self.internal_id)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("provider", &self.provider)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_tag_round_trip() {
        assert_eq!(ProviderKind::parse("neurosity"), Some(ProviderKind::Neurosity));
        assert_eq!(ProviderKind::Neurosity.as_str(), "neurosity");
        assert_eq!(ProviderKind::parse("muse"), None);
    }

    #[test]
    fn test_debug_redacts_credential() {
        let entity = Entity::new("ext-1", "E1", ProviderKind::Neurosity).with_credential("secret-token");
        let rendered = format!("{:?}", entity);
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("<redacted>"));
        assert!(rendered.contains("E1"));
    }
}

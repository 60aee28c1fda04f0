//! # Membership Rows and Change Events
//!
//! The membership table lists which entities should be streaming. Each row maps
//! an external id (`user_id`) to an internal id (`mediar_user_id`) and names the
//! provider. The store delivers changes to the table as JSON payloads of the
//! form `{"eventType": "INSERT|UPDATE|DELETE", "new": {..}, "old": {..}}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::telemetry::entity::{Entity, ProviderKind};

/// Status column of a membership row. Only the `valid` flag is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberStatus(pub Value);

impl MemberStatus {
    /// The status written when a session could not be started for the entity.
    pub fn invalid() -> Self {
        Self(json!({ "valid": false }))
    }

    /// True only when the row explicitly says `"valid": false`.
    pub fn is_invalid(&self) -> bool {
        self.0.get("valid").and_then(Value::as_bool) == Some(false)
    }
}

/// One row of the membership table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRow {
    /// External id known to the provider.
    #[serde(rename = "user_id")]
    pub external_id: String,
    /// Internal id stamped on records.
    #[serde(rename = "mediar_user_id")]
    pub internal_id: String,
    /// Stored credential, if any.
    #[serde(default)]
    pub token: Option<String>,
    /// Provider tag.
    #[serde(default)]
    pub provider: Option<String>,
    /// Status column.
    #[serde(default)]
    pub status: Option<MemberStatus>,
}

impl MemberRow {
    /// The provider named by the row, when it is one this engine knows.
    pub fn provider_kind(&self) -> Option<ProviderKind> {
        self.provider.as_deref().and_then(ProviderKind::parse)
    }

    /// True when the row's status marks its credential invalid.
    pub fn is_marked_invalid(&self) -> bool {
        self.status.as_ref().is_some_and(MemberStatus::is_invalid)
    }

    /// Converts the row into an entity for `provider`, or `None` when the row
    /// belongs to another provider.
    pub fn to_entity(&self, provider: ProviderKind) -> Option<Entity> {
        if self.provider_kind() != Some(provider) {
            return None;
        }
        Some(Entity {
            external_id: self.external_id.clone(),
            internal_id: self.internal_id.clone(),
            credential: self.token.clone(),
            provider,
        })
    }
}

/// Row filter for the initial membership read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberFilter {
    /// Only rows with this provider are returned.
    pub provider: ProviderKind,
}

/// Kind of change reported by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    /// Row inserted.
    Insert,
    /// Row updated (credential rotation, status, provider).
    Update,
    /// Row deleted.
    Delete,
}

#[derive(Deserialize)]
struct ChangePayload {
    #[serde(rename = "eventType")]
    event_type: ChangeKind,
    #[serde(default)]
    new: Option<Value>,
    #[serde(default)]
    old: Option<Value>,
}

/// A membership change, ready for routing.
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    /// A member was added.
    Added(MemberRow),
    /// A member row changed. `old` is present when the feed carries it.
    Updated {
        /// Previous row image.
        old: Option<MemberRow>,
        /// New row image.
        new: MemberRow,
    },
    /// A member was removed.
    Removed(MemberRow),
}

impl MembershipEvent {
    /// Parses a change-feed payload. Returns `Ok(None)` when the payload lacks
    /// the row image its event type needs.
    pub fn parse(payload: &str) -> Result<Option<Self>, serde_json::Error> {
        let change: ChangePayload = serde_json::from_str(payload)?;
        let new = row_image(change.new);
        let old = row_image(change.old);

        let event = match change.event_type {
            ChangeKind::Insert => new.map(MembershipEvent::Added),
            ChangeKind::Update => new.map(|new| MembershipEvent::Updated { old, new }),
            ChangeKind::Delete => old.map(MembershipEvent::Removed),
        };
        Ok(event)
    }

    /// The change kind of this event.
    pub fn kind(&self) -> ChangeKind {
        match self {
            MembershipEvent::Added(_) => ChangeKind::Insert,
            MembershipEvent::Updated { .. } => ChangeKind::Update,
            MembershipEvent::Removed(_) => ChangeKind::Delete,
        }
    }

    /// The internal id the event concerns.
    pub fn internal_id(&self) -> &str {
        match self {
            MembershipEvent::Added(row) | MembershipEvent::Removed(row) => &row.internal_id,
            MembershipEvent::Updated { new, .. } => &new.internal_id,
        }
    }
}

// Empty objects (`{}`) and partial images are treated as absent.
fn row_image(value: Option<Value>) -> Option<MemberRow> {
    value.and_then(|v| serde_json::from_value(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_insert_update_delete() {
        let insert = r#"{"eventType":"INSERT","new":{"user_id":"u1","mediar_user_id":"E1","provider":"neurosity"},"old":{}}"#;
        let event = MembershipEvent::parse(insert).unwrap().unwrap();
        assert_eq!(event.kind(), ChangeKind::Insert);
        assert_eq!(event.internal_id(), "E1");

        let update = r#"{"eventType":"UPDATE","new":{"user_id":"u1","mediar_user_id":"E1","token":"t2","provider":"neurosity"},"old":{"user_id":"u1","mediar_user_id":"E1","token":"t1","provider":"neurosity"}}"#;
        match MembershipEvent::parse(update).unwrap().unwrap() {
            MembershipEvent::Updated { old, new } => {
                assert_eq!(old.unwrap().token.as_deref(), Some("t1"));
                assert_eq!(new.token.as_deref(), Some("t2"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        let delete = r#"{"eventType":"DELETE","new":null,"old":{"user_id":"u1","mediar_user_id":"E1"}}"#;
        let event = MembershipEvent::parse(delete).unwrap().unwrap();
        assert_eq!(event, MembershipEvent::Removed(MemberRow {
            external_id: "u1".into(),
            internal_id: "E1".into(),
            token: None,
            provider: None,
            status: None,
        }));
    }

    #[test]
    fn test_parse_delete_without_old_image() {
        let delete = r#"{"eventType":"DELETE","new":{},"old":{}}"#;
        assert_eq!(MembershipEvent::parse(delete).unwrap(), None);
        assert!(MembershipEvent::parse("not json").is_err());
    }

    #[test]
    fn test_row_to_entity_filters_provider_and_reads_status() {
        let row: MemberRow = serde_json::from_value(json!({
            "user_id": "u1",
            "mediar_user_id": "E1",
            "token": "t1",
            "provider": "neurosity",
            "status": { "valid": false }
        }))
        .unwrap();

        assert!(row.is_marked_invalid());
        let entity = row.to_entity(ProviderKind::Neurosity).unwrap();
        assert_eq!(entity.credential.as_deref(), Some("t1"));

        let other = MemberRow { provider: Some("muse".into()), ..row };
        assert!(other.to_entity(ProviderKind::Neurosity).is_none());
        assert!(!MemberStatus(json!({})).is_invalid());
    }
}

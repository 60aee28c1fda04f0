//! # Telemetry Records
//!
//! A `Record` is one ingested telemetry event, created inside a subscription
//! callback and moved straight into the coalescer buffer. Records are never
//! mutated after creation.
//!
//! The two shapes map onto rows of the destination tables:
//!
//! - **Band power**: `{"user_id": .., "metadata": {"alpha": [..], .., "provider": ..}}`
//! - **Probability**: `{"user_id": .., "probability": .., "metadata": {"label": .., "provider": ..}}`

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Destination grouping of a record. One category becomes one batched write
/// per flush, and names the destination table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(String);

impl Category {
    /// Creates a category from a table name.
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    /// The `states` table every feed writes to by default.
    pub fn states() -> Self {
        Self::new("states")
    }

    /// The table name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capability shared by every record shape: which entity it belongs to.
pub trait Destined {
    /// The internal id of the entity that produced the record.
    fn internal_id(&self) -> &str;
}

/// Metadata of a band-power snapshot: one entry per named band plus the
/// provider tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandPowerMetadata {
    /// Power per band, one value per headset channel.
    #[serde(flatten)]
    pub bands: BTreeMap<String, Vec<f64>>,
    /// Source provider tag.
    pub provider: String,
}

/// A band-power snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandPowerRecord {
    /// Internal entity id.
    pub user_id: String,
    /// Bands and provider.
    pub metadata: BandPowerMetadata,
}

/// Metadata of a probability-labelled event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityMetadata {
    /// Categorical label reported by the provider (`focus`, `calm`, ..).
    pub label: String,
    /// Source provider tag.
    pub provider: String,
}

/// A probability-labelled event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityRecord {
    /// Internal entity id.
    pub user_id: String,
    /// Probability in `[0, 1]` as reported by the provider.
    pub probability: f64,
    /// Label and provider.
    pub metadata: ProbabilityMetadata,
}

/// The closed set of record shapes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Record {
    /// A band-power snapshot.
    BandPower(BandPowerRecord),
    /// A probability-labelled event.
    Probability(ProbabilityRecord),
}

impl Record {
    /// Builds a band-power record for `internal_id`.
    pub fn band_power(internal_id: &str, bands: BTreeMap<String, Vec<f64>>, provider: &str) -> Self {
        Record::BandPower(BandPowerRecord {
            user_id: internal_id.to_string(),
            metadata: BandPowerMetadata {
                bands,
                provider: provider.to_string(),
            },
        })
    }

    /// Builds a probability record for `internal_id`.
    pub fn probability(internal_id: &str, probability: f64, label: &str, provider: &str) -> Self {
        Record::Probability(ProbabilityRecord {
            user_id: internal_id.to_string(),
            probability,
            metadata: ProbabilityMetadata {
                label: label.to_string(),
                provider: provider.to_string(),
            },
        })
    }

    /// The JSON row written to the destination table.
    pub fn to_row(&self) -> Value {
        // Serializing plain structs of strings, floats and maps cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl Destined for BandPowerRecord {
    fn internal_id(&self) -> &str {
        &self.user_id
    }
}

impl Destined for ProbabilityRecord {
    fn internal_id(&self) -> &str {
        &self.user_id
    }
}

impl Destined for Record {
    fn internal_id(&self) -> &str {
        match self {
            Record::BandPower(r) => r.internal_id(),
            Record::Probability(r) => r.internal_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_band_power_row_shape() {
        let mut bands = BTreeMap::new();
        bands.insert("alpha".to_string(), vec![1.5, 2.0]);
        bands.insert("beta".to_string(), vec![0.25]);
        let record = Record::band_power("E1", bands, "neurosity");

        assert_eq!(
            record.to_row(),
            json!({
                "user_id": "E1",
                "metadata": { "alpha": [1.5, 2.0], "beta": [0.25], "provider": "neurosity" }
            })
        );
        assert_eq!(record.internal_id(), "E1");
    }

    #[test]
    fn test_probability_row_shape() {
        let record = Record::probability("E2", 0.75, "calm", "neurosity");
        assert_eq!(
            record.to_row(),
            json!({
                "user_id": "E2",
                "probability": 0.75,
                "metadata": { "label": "calm", "provider": "neurosity" }
            })
        );
    }
}

//! Memory unit types and identifiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::consolidation::ModelChange;

/// Unique identifier for a memory unit (UUID v4 in string form).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wraps an existing id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for UnitId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UnitId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The kind of a stored fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactType {
    /// External fact about the world or about others.
    World,
    /// Something the bank owner did, said, or lived through. First person.
    Experience,
    /// A belief or judgement the bank owner holds. First person.
    Opinion,
    /// A raw note retained without interpretation.
    Observation,
    /// A consolidated summary produced by the consolidation engine.
    ///
    /// Invariant: units carry this type iff consolidation created them.
    MentalModel,
}

impl FactType {
    /// Stable storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::World => "world",
            Self::Experience => "experience",
            Self::Opinion => "opinion",
            Self::Observation => "observation",
            Self::MentalModel => "mental_model",
        }
    }

    /// Parses a storage label.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "world" => Some(Self::World),
            "experience" => Some(Self::Experience),
            "opinion" => Some(Self::Opinion),
            "observation" => Some(Self::Observation),
            "mental_model" => Some(Self::MentalModel),
            _ => None,
        }
    }

    /// Whether units of this type feed consolidation.
    #[must_use]
    pub const fn is_consolidatable(self) -> bool {
        matches!(self, Self::World | Self::Experience)
    }
}

impl fmt::Display for FactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The atomic stored fact.
#[derive(Debug, Clone)]
pub struct MemoryUnit {
    /// Unique identifier.
    pub id: UnitId,
    /// Owning bank.
    pub bank_id: String,
    /// The fact text.
    pub text: String,
    /// The kind of fact.
    pub fact_type: FactType,
    /// Optional free-text context captured at retain time.
    pub context: Option<String>,
    /// Insertion timestamp.
    pub created_at: DateTime<Utc>,
    /// When the fact occurred. Midpoint of `[occurred_start, occurred_end]`
    /// when both are set, else whichever is set, else the retain reference
    /// date.
    pub event_date: DateTime<Utc>,
    /// Start of the occurrence interval, if known.
    pub occurred_start: Option<DateTime<Utc>>,
    /// End of the occurrence interval, if known.
    pub occurred_end: Option<DateTime<Utc>>,
    /// When the fact was mentioned to the system.
    pub mentioned_at: Option<DateTime<Utc>>,
    /// Owning document, if retained through a document batch.
    pub document_id: Option<String>,
    /// Consolidation watermark. Non-null means this unit has been processed
    /// and is exempt from further consolidation.
    pub consolidated_at: Option<DateTime<Utc>>,
    /// Unit-normalized embedding of `text`.
    pub embedding: Vec<f32>,
    /// User tags (sorted, deduplicated, case-sensitive).
    pub tags: Vec<String>,
    /// Free-form string metadata.
    pub metadata: BTreeMap<String, String>,
    /// Mental models only: number of supporting source units.
    pub proof_count: Option<u32>,
    /// Mental models only: ids of the units this model summarizes.
    pub source_memory_ids: Vec<UnitId>,
    /// Mental models only: structured change records, oldest first.
    pub history: Vec<ModelChange>,
}

impl MemoryUnit {
    /// Whether this unit is a consolidated mental model.
    #[must_use]
    pub fn is_mental_model(&self) -> bool {
        self.fact_type == FactType::MentalModel
    }

    /// Estimated token footprint of the unit text.
    #[must_use]
    pub fn estimated_tokens(&self, overhead: usize) -> usize {
        self.text.len() / 4 + overhead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fact_type_roundtrip() {
        for ft in [
            FactType::World,
            FactType::Experience,
            FactType::Opinion,
            FactType::Observation,
            FactType::MentalModel,
        ] {
            assert_eq!(FactType::parse(ft.as_str()), Some(ft));
        }
        assert_eq!(FactType::parse("belief"), None);
    }

    #[test]
    fn test_consolidatable_types() {
        assert!(FactType::World.is_consolidatable());
        assert!(FactType::Experience.is_consolidatable());
        assert!(!FactType::Opinion.is_consolidatable());
        assert!(!FactType::MentalModel.is_consolidatable());
    }

    #[test]
    fn test_unit_id_generate_unique() {
        assert_ne!(UnitId::generate(), UnitId::generate());
    }
}

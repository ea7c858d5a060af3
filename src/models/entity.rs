//! Entity types for the knowledge graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for an entity (UUID v4 in string form).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
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

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The category of a canonical referent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A person.
    Person,
    /// A company, team, or institution.
    Organization,
    /// A geographic or named place.
    Place,
    /// A product or named artifact.
    Product,
    /// An abstract concept or topic.
    Concept,
    /// Anything else.
    Other,
}

impl EntityType {
    /// Stable storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Organization => "organization",
            Self::Place => "place",
            Self::Product => "product",
            Self::Concept => "concept",
            Self::Other => "other",
        }
    }

    /// Parses a storage label. Unknown labels map to `Other`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "person" => Self::Person,
            "organization" | "org" => Self::Organization,
            "place" | "location" => Self::Place,
            "product" => Self::Product,
            "concept" => Self::Concept,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A canonical referent within a bank.
///
/// Invariant: within a bank no two entities share a normalized canonical
/// name within the same type. The resolver enforces this.
#[derive(Debug, Clone)]
pub struct Entity {
    /// Unique identifier.
    pub id: EntityId,
    /// Owning bank.
    pub bank_id: String,
    /// Display name as first encountered.
    pub canonical_name: String,
    /// Case-folded, punctuation-stripped name used for exact matching.
    pub normalized_name: String,
    /// Entity category.
    pub entity_type: EntityType,
    /// Unit-normalized embedding of the canonical name.
    pub embedding: Vec<f32>,
    /// Alternative surface forms seen for this entity.
    pub aliases: Vec<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// An entity mention emitted by fact extraction, before resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMention {
    /// The entity name as it appears in the fact.
    pub text: String,
    /// The mention's category.
    #[serde(default = "default_mention_type")]
    pub entity_type: EntityType,
}

fn default_mention_type() -> EntityType {
    EntityType::Concept
}

/// Normalizes a mention for exact matching: case-fold, strip punctuation,
/// collapse whitespace.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let stripped: String = lowered
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  Dr. Marcus  O'Neil "), "dr marcus o neil");
        assert_eq!(normalize_name("ACME, Inc."), "acme inc");
        assert_eq!(normalize_name("café"), "café");
    }

    #[test]
    fn test_entity_type_parse_unknown_is_other() {
        assert_eq!(EntityType::parse("galaxy"), EntityType::Other);
        assert_eq!(EntityType::parse("ORG"), EntityType::Organization);
    }
}

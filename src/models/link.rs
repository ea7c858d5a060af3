//! Typed, weighted edges between memory units.

use super::entity::EntityId;
use super::memory::UnitId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of a memory link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    /// Near in time.
    Temporal,
    /// Near in embedding space.
    Semantic,
    /// Shares an entity; the edge carries the entity id.
    Entity,
}

impl LinkType {
    /// Stable storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Temporal => "temporal",
            Self::Semantic => "semantic",
            Self::Entity => "entity",
        }
    }

    /// Parses a storage label.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "temporal" => Some(Self::Temporal),
            "semantic" => Some(Self::Semantic),
            "entity" => Some(Self::Entity),
            _ => None,
        }
    }

    /// Spreading-activation coefficient for this edge type.
    #[must_use]
    pub const fn activation_coefficient(self) -> f32 {
        match self {
            Self::Semantic => 1.0,
            Self::Entity => 0.8,
            Self::Temporal => 0.4,
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directed, typed, weighted edge between two units in the same bank.
///
/// Uniqueness: `(from_unit, to_unit, link_type, entity_id-or-sentinel)`.
/// The sentinel for non-entity links is the empty string, so a null entity
/// id still participates in the unique key.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryLink {
    /// Source unit.
    pub from_unit: UnitId,
    /// Target unit. Same bank as the source.
    pub to_unit: UnitId,
    /// Edge type.
    pub link_type: LinkType,
    /// The shared entity, for `entity` links only.
    pub entity_id: Option<EntityId>,
    /// Edge weight in `(0, 1]`.
    pub weight: f32,
}

impl MemoryLink {
    /// Creates a semantic link with the given cosine weight.
    #[must_use]
    pub const fn semantic(from_unit: UnitId, to_unit: UnitId, weight: f32) -> Self {
        Self {
            from_unit,
            to_unit,
            link_type: LinkType::Semantic,
            entity_id: None,
            weight,
        }
    }

    /// Creates a temporal link with the given proximity weight.
    #[must_use]
    pub const fn temporal(from_unit: UnitId, to_unit: UnitId, weight: f32) -> Self {
        Self {
            from_unit,
            to_unit,
            link_type: LinkType::Temporal,
            entity_id: None,
            weight,
        }
    }

    /// Creates an entity link (weight 1.0) carrying the shared entity.
    #[must_use]
    pub const fn entity(from_unit: UnitId, to_unit: UnitId, entity_id: EntityId) -> Self {
        Self {
            from_unit,
            to_unit,
            link_type: LinkType::Entity,
            entity_id: Some(entity_id),
            weight: 1.0,
        }
    }

    /// The entity id coalesced to the storage sentinel.
    #[must_use]
    pub fn entity_sentinel(&self) -> &str {
        self.entity_id.as_ref().map_or("", EntityId::as_str)
    }
}

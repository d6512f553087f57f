use serde::{Deserialize, Serialize};

use crate::entity::{clamp_confidence, EntityKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationType {
    PublishedBy,
    AwardedTo,
    InCategory,
    HasRequirement,
    HasKeyword,
    HasDeadline,
    /// Chunk -> Entity traceability. Only ever written by the merger.
    Mentions,
}

impl RelationType {
    pub const ALL: [Self; 7] = [
        Self::PublishedBy,
        Self::AwardedTo,
        Self::InCategory,
        Self::HasRequirement,
        Self::HasKeyword,
        Self::HasDeadline,
        Self::Mentions,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PublishedBy => "PUBLISHED_BY",
            Self::AwardedTo => "AWARDED_TO",
            Self::InCategory => "IN_CATEGORY",
            Self::HasRequirement => "HAS_REQUIREMENT",
            Self::HasKeyword => "HAS_KEYWORD",
            Self::HasDeadline => "HAS_DEADLINE",
            Self::Mentions => "MENTIONS",
        }
    }
}

impl std::fmt::Display for RelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RelationType {
    type Err = crate::SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| crate::SchemaError::UnknownRelationType(s.to_string()))
    }
}

/// Identity of an entity-to-entity edge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationKey {
    pub source: EntityKey,
    pub relation_type: RelationType,
    pub target: EntityKey,
}

impl std::fmt::Display for RelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({})-[{}]->({})", self.source, self.relation_type, self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub key: RelationKey,
    pub confidence: f64,
}

impl Relation {
    #[must_use]
    pub fn new(
        source: EntityKey,
        relation_type: RelationType,
        target: EntityKey,
        confidence: f64,
    ) -> Self {
        Self {
            key: RelationKey {
                source,
                relation_type,
                target,
            },
            confidence: clamp_confidence(confidence),
        }
    }
}

/// A `MENTIONS` edge from a chunk to an entity it produced.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Mention {
    pub chunk_id: String,
    pub entity: EntityKey,
}

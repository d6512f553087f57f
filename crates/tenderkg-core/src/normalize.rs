//! Canonical identity keys for extracted strings.
//!
//! Keys must be stable across runs: the graph deduplicates on them. Any change
//! to folding rules or alias tables is a schema migration and must come with a
//! new schema version.

use serde::{Deserialize, Serialize};

use crate::entity::{EntityKey, EntityType};
use crate::error::{InvalidInputError, SchemaError};
use crate::schema::SchemaRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationStrategy {
    /// Reference numbers: upper-cased.
    Identifier,
    /// Agency and supplier names: upper-cased.
    Organization,
    /// Titles and free text: lower-cased.
    Text,
    /// Keywords and requirements: lower-cased, punctuation other than `-_/` removed.
    Token,
    /// Calendar dates: ISO `YYYY-MM-DD`.
    Date,
}

impl NormalizationStrategy {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Identifier => "identifier",
            Self::Organization => "organization",
            Self::Text => "text",
            Self::Token => "token",
            Self::Date => "date",
        }
    }

    /// Strategy used for a type that the schema does not declare.
    #[must_use]
    pub const fn default_for(entity_type: EntityType) -> Self {
        match entity_type {
            EntityType::Tender => Self::Identifier,
            EntityType::Agency | EntityType::Supplier => Self::Organization,
            EntityType::Category => Self::Text,
            EntityType::Requirement | EntityType::Keyword => Self::Token,
            EntityType::Date => Self::Date,
        }
    }

    /// Case-folds an already trimmed and collapsed string.
    pub fn fold(self, collapsed: &str) -> Result<String, InvalidInputError> {
        match self {
            Self::Identifier | Self::Organization => Ok(collapsed.to_uppercase()),
            Self::Text => Ok(collapsed.to_lowercase()),
            Self::Token => {
                let kept: String = collapsed
                    .to_lowercase()
                    .chars()
                    .filter(|c| c.is_alphanumeric() || c.is_whitespace() || matches!(c, '-' | '_' | '/'))
                    .collect();
                Ok(collapse_whitespace(&kept))
            }
            Self::Date => crate::chunk::parse_date(collapsed).map(|d| d.format("%Y-%m-%d").to_string()),
        }
    }
}

impl std::str::FromStr for NormalizationStrategy {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identifier" => Ok(Self::Identifier),
            "organization" => Ok(Self::Organization),
            "text" => Ok(Self::Text),
            "token" => Ok(Self::Token),
            "date" => Ok(Self::Date),
            _ => Err(SchemaError::UnknownStrategy(s.to_string())),
        }
    }
}

#[must_use]
pub fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Result of normalising one raw string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub key: EntityKey,
    /// Alias canonical form when an alias matched, else the cleaned raw string.
    pub display: String,
    pub alias_hit: bool,
}

pub struct Normalizer<'a> {
    registry: &'a SchemaRegistry,
}

impl<'a> Normalizer<'a> {
    #[must_use]
    pub const fn new(registry: &'a SchemaRegistry) -> Self {
        Self { registry }
    }

    pub fn normalize(
        &self,
        entity_type: EntityType,
        raw: &str,
    ) -> Result<Normalized, InvalidInputError> {
        let collapsed = collapse_whitespace(raw);
        if collapsed.is_empty() {
            return Err(InvalidInputError::Empty(entity_type));
        }

        let spec = self.registry.entity(entity_type);
        let strategy = spec.map_or_else(
            || NormalizationStrategy::default_for(entity_type),
            |s| s.strategy,
        );
        let folded = strategy.fold(&collapsed)?;
        if folded.is_empty() {
            return Err(InvalidInputError::Empty(entity_type));
        }

        if let Some(alias) = spec.and_then(|s| s.aliases.get(&folded)) {
            return Ok(Normalized {
                key: EntityKey::new(entity_type, alias.key.clone()),
                display: alias.canonical.clone(),
                alias_hit: true,
            });
        }

        let display = if strategy == NormalizationStrategy::Date {
            folded.clone()
        } else {
            collapsed
        };
        Ok(Normalized {
            key: EntityKey::new(entity_type, folded),
            display,
            alias_hit: false,
        })
    }
}

/// A pair of canonical keys that look like spellings of the same thing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AliasSuggestion {
    pub entity_type: EntityType,
    pub key: String,
    pub candidate: String,
    pub similarity: f64,
}

/// Lists near-duplicate keys so an analyst can extend the alias table.
///
/// Never feeds back into normalisation.
#[must_use]
pub fn suggest_aliases(
    entity_type: EntityType,
    keys: &[String],
    threshold: f64,
) -> Vec<AliasSuggestion> {
    let mut sorted: Vec<&String> = keys.iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut suggestions = Vec::new();
    for (i, a) in sorted.iter().enumerate() {
        for b in &sorted[i + 1..] {
            let similarity = strsim::jaro_winkler(a, b);
            if similarity >= threshold {
                suggestions.push(AliasSuggestion {
                    entity_type,
                    key: (*a).clone(),
                    candidate: (*b).clone(),
                    similarity,
                });
            }
        }
    }
    suggestions.sort_by(|x, y| {
        y.similarity
            .total_cmp(&x.similarity)
            .then_with(|| x.key.cmp(&y.key))
            .then_with(|| x.candidate.cmp(&y.candidate))
    });
    suggestions
}

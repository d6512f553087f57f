//! Declarative extraction schema.
//!
//! A [`SchemaRegistry`] is built once per run from a JSON [`SchemaDocument`]
//! and shared read-only (usually behind an `Arc`) by the extractor, the
//! normalizer and the merger.

mod document;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use regex::Regex;
use tracing::debug;

pub use document::{AttributeDecl, AttributeKind, EntityDecl, RelationDecl, RuleDecl, SchemaDocument};

use crate::entity::EntityType;
use crate::error::SchemaError;
use crate::normalize::{collapse_whitespace, NormalizationStrategy};
use crate::relation::RelationType;

const TENDER_SCHEMA: &str = include_str!("default.json");

/// Canonical target of an alias entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasTarget {
    /// Folded canonical form; this becomes the entity key.
    pub key: String,
    /// Canonical display form as written in the document.
    pub canonical: String,
}

#[derive(Debug, Clone)]
pub struct EntitySpec {
    pub entity_type: EntityType,
    pub fields: Vec<String>,
    pub strategy: NormalizationStrategy,
    /// Folded alias -> canonical form. Canonical forms map to themselves.
    pub aliases: HashMap<String, AliasTarget>,
    /// Stored folded with the entity's strategy.
    pub stopwords: HashSet<String>,
    pub max_per_chunk: Option<usize>,
    pub attributes: Vec<AttributeDecl>,
    /// Canonical key -> group name.
    pub groups: HashMap<String, String>,
}

impl EntitySpec {
    #[must_use]
    pub fn is_stopword(&self, folded: &str) -> bool {
        self.stopwords.contains(folded)
    }

    /// The group a canonical key belongs to, if the schema places it in one.
    #[must_use]
    pub fn group_of(&self, key: &str) -> Option<&str> {
        self.groups.get(key).map(String::as_str)
    }
}

/// How a rule finds its spans in chunk text.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// `Label: value` card line, optionally split into several values.
    Label { label: String, split: Option<String> },
    /// Every match of the pattern; capture group 1 when present.
    Pattern(Regex),
    /// Whole-word, case-insensitive occurrences of any listed term.
    Lexicon(Regex),
}

#[derive(Debug, Clone)]
pub struct FieldRule {
    pub entity_type: EntityType,
    pub field: String,
    pub matcher: Matcher,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationSpec {
    pub relation_type: RelationType,
    pub source: EntityType,
    pub target: EntityType,
}

#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    version: String,
    confidence_threshold: f64,
    entities: BTreeMap<EntityType, EntitySpec>,
    rules: Vec<FieldRule>,
    relations: BTreeMap<RelationType, RelationSpec>,
}

impl SchemaRegistry {
    /// The built-in GeBIZ tender schema.
    pub fn tender_default() -> Result<Self, SchemaError> {
        Self::from_json(TENDER_SCHEMA)
    }

    pub fn from_path(path: &Path) -> Result<Self, SchemaError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, SchemaError> {
        let document: SchemaDocument = serde_json::from_str(raw)?;
        Self::from_document(&document)
    }

    pub fn from_document(document: &SchemaDocument) -> Result<Self, SchemaError> {
        check_confidence("confidence_threshold", document.confidence_threshold)?;

        let mut entities = BTreeMap::new();
        for decl in &document.entities {
            let spec = compile_entity(decl)?;
            if entities.contains_key(&spec.entity_type) {
                return Err(SchemaError::DuplicateEntity(spec.entity_type));
            }
            entities.insert(spec.entity_type, spec);
        }

        let rules = document
            .rules
            .iter()
            .map(|decl| compile_rule(decl, &entities))
            .collect::<Result<Vec<_>, _>>()?;

        let mut relations = BTreeMap::new();
        for decl in &document.relations {
            let spec = compile_relation(decl, &entities)?;
            if relations.insert(spec.relation_type, spec).is_some() {
                return Err(SchemaError::DuplicateRelation(decl.relation_type.clone()));
            }
        }

        debug!(
            version = %document.version,
            entities = entities.len(),
            rules = rules.len(),
            relations = relations.len(),
            "Schema compiled"
        );

        Ok(Self {
            version: document.version.clone(),
            confidence_threshold: document.confidence_threshold,
            entities,
            rules,
            relations,
        })
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub const fn confidence_threshold(&self) -> f64 {
        self.confidence_threshold
    }

    #[must_use]
    pub fn entity(&self, entity_type: EntityType) -> Option<&EntitySpec> {
        self.entities.get(&entity_type)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntitySpec> {
        self.entities.values()
    }

    #[must_use]
    pub fn is_declared(&self, entity_type: EntityType) -> bool {
        self.entities.contains_key(&entity_type)
    }

    #[must_use]
    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }

    pub fn relations(&self) -> impl Iterator<Item = &RelationSpec> {
        self.relations.values()
    }

    #[must_use]
    pub fn relation(&self, relation_type: RelationType) -> Option<&RelationSpec> {
        self.relations.get(&relation_type)
    }

    /// Whether `relation_type` may connect `source` to `target`.
    #[must_use]
    pub fn allows(&self, relation_type: RelationType, source: EntityType, target: EntityType) -> bool {
        self.relations
            .get(&relation_type)
            .is_some_and(|spec| spec.source == source && spec.target == target)
    }
}

fn check_confidence(context: &str, value: f64) -> Result<(), SchemaError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(SchemaError::ConfidenceOutOfRange {
            context: context.to_string(),
            value,
        })
    }
}

fn compile_entity(decl: &EntityDecl) -> Result<EntitySpec, SchemaError> {
    let entity_type: EntityType = decl.entity_type.parse()?;
    let strategy: NormalizationStrategy = decl.normalization.parse()?;

    let fold = |raw: &str| -> Result<String, SchemaError> {
        let collapsed = collapse_whitespace(raw);
        match strategy.fold(&collapsed) {
            Ok(folded) if !folded.is_empty() => Ok(folded),
            _ => Err(SchemaError::EmptyAlias {
                entity: entity_type,
                alias: raw.to_string(),
            }),
        }
    };

    let mut folded_pairs = Vec::with_capacity(decl.aliases.len());
    for (alias, canonical) in &decl.aliases {
        folded_pairs.push((alias, fold(alias)?, canonical, fold(canonical)?));
    }

    let mut aliases = HashMap::new();
    for (alias, alias_key, canonical, canonical_key) in &folded_pairs {
        let chained = folded_pairs
            .iter()
            .any(|(_, other_key, _, other_target)| other_key == canonical_key && other_target != canonical_key);
        if chained {
            return Err(SchemaError::AliasChain {
                entity: entity_type,
                alias: (*alias).clone(),
                target: (*canonical).clone(),
            });
        }
        let target = AliasTarget {
            key: canonical_key.clone(),
            canonical: collapse_whitespace(canonical),
        };
        aliases.insert(canonical_key.clone(), target.clone());
        aliases.insert(alias_key.clone(), target);
    }

    let stopwords = decl
        .stopwords
        .iter()
        .filter_map(|w| strategy.fold(&collapse_whitespace(w)).ok())
        .filter(|w| !w.is_empty())
        .collect();

    let mut groups: HashMap<String, String> = HashMap::new();
    for (group, members) in &decl.groups {
        for member in members {
            let folded = strategy
                .fold(&collapse_whitespace(member))
                .ok()
                .filter(|m| !m.is_empty())
                .ok_or_else(|| SchemaError::EmptyGroupMember {
                    entity: entity_type,
                    group: group.clone(),
                })?;
            let key = aliases.get(&folded).map_or(folded, |target| target.key.clone());
            match groups.get(&key) {
                Some(first) if first != group => {
                    return Err(SchemaError::GroupConflict {
                        entity: entity_type,
                        member: member.clone(),
                        first: first.clone(),
                        second: group.clone(),
                    });
                }
                _ => {
                    groups.insert(key, group.clone());
                }
            }
        }
    }

    Ok(EntitySpec {
        entity_type,
        fields: decl.fields.clone(),
        strategy,
        aliases,
        stopwords,
        max_per_chunk: decl.max_per_chunk,
        attributes: decl.attributes.clone(),
        groups,
    })
}

fn compile_rule(
    decl: &RuleDecl,
    entities: &BTreeMap<EntityType, EntitySpec>,
) -> Result<FieldRule, SchemaError> {
    let entity_type: EntityType = decl.entity.parse()?;
    let spec = entities
        .get(&entity_type)
        .ok_or(SchemaError::UndeclaredEntity(entity_type))?;
    if !spec.fields.iter().any(|f| f == &decl.field) {
        return Err(SchemaError::UnknownField {
            entity: entity_type,
            field: decl.field.clone(),
        });
    }
    check_confidence(&format!("rule {entity_type}.{}", decl.field), decl.confidence)?;

    let invalid = |source| SchemaError::InvalidPattern {
        entity: entity_type,
        field: decl.field.clone(),
        source,
    };

    let matcher = match (&decl.label, &decl.pattern, &decl.terms) {
        (Some(label), None, None) => Matcher::Label {
            label: label.trim().to_string(),
            split: decl.split.clone().filter(|s| !s.is_empty()),
        },
        (None, Some(pattern), None) => Matcher::Pattern(Regex::new(pattern).map_err(invalid)?),
        (None, None, Some(terms)) if !terms.is_empty() => {
            let alternation = terms.iter().map(|t| lexicon_term(t)).collect::<Vec<_>>().join("|");
            Matcher::Lexicon(Regex::new(&format!(r"(?i)\b(?:{alternation})\b")).map_err(invalid)?)
        }
        _ => {
            return Err(SchemaError::AmbiguousRule {
                entity: entity_type,
                field: decl.field.clone(),
            })
        }
    };

    Ok(FieldRule {
        entity_type,
        field: decl.field.clone(),
        matcher,
        confidence: decl.confidence,
    })
}

// Acronyms such as "IT" only match upper-case, otherwise the pronoun matches too.
fn lexicon_term(term: &str) -> String {
    let term = term.trim();
    let escaped = regex::escape(term);
    let letters: Vec<char> = term.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() > 1 && letters.iter().all(|c| c.is_uppercase()) {
        format!("(?-i:{escaped})")
    } else {
        escaped
    }
}

fn compile_relation(
    decl: &RelationDecl,
    entities: &BTreeMap<EntityType, EntitySpec>,
) -> Result<RelationSpec, SchemaError> {
    let relation_type: RelationType = decl.relation_type.parse()?;
    if relation_type == RelationType::Mentions {
        return Err(SchemaError::MentionsNotExtractable);
    }
    let source: EntityType = decl.source.parse()?;
    let target: EntityType = decl.target.parse()?;
    for endpoint in [source, target] {
        if !entities.contains_key(&endpoint) {
            return Err(SchemaError::UndeclaredEndpoint {
                relation: decl.relation_type.clone(),
                endpoint,
            });
        }
    }
    Ok(RelationSpec {
        relation_type,
        source,
        target,
    })
}

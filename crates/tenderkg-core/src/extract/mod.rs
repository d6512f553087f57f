//! Schema-driven extraction of entities and relations from chunk text.

mod recognizer;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub use recognizer::{
    CandidateRelation, CandidateSpan, CompositeRecognizer, Recognition, Recognizer, RuleRecognizer,
};

use crate::chunk::Chunk;
use crate::entity::{Entity, EntityKey, EntityType};
use crate::error::InvalidInputError;
use crate::normalize::Normalizer;
use crate::relation::{Relation, RelationKey};
use crate::schema::SchemaRegistry;

/// Why a candidate did not make it into the extraction output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DropReason {
    BelowThreshold { confidence: f64, threshold: f64 },
    UndeclaredEntityType,
    UndeclaredRelationPair,
    DanglingEndpoint { endpoint: String },
    InvalidInput { error: InvalidInputError },
    Stopword,
    OverCap { limit: usize },
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BelowThreshold {
                confidence,
                threshold,
            } => write!(f, "confidence {confidence:.2} below threshold {threshold:.2}"),
            Self::UndeclaredEntityType => f.write_str("entity type not declared"),
            Self::UndeclaredRelationPair => f.write_str("relation pair not declared"),
            Self::DanglingEndpoint { endpoint } => write!(f, "endpoint {endpoint} was not extracted"),
            Self::InvalidInput { error } => write!(f, "{error}"),
            Self::Stopword => f.write_str("stopword"),
            Self::OverCap { limit } => write!(f, "over per-chunk limit of {limit}"),
        }
    }
}

/// A logged, deliberate decision not to keep a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dropped {
    pub subject: String,
    #[serde(flatten)]
    pub reason: DropReason,
}

/// Output of one `extract` call. Entities and relations are sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub chunk_id: String,
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
    pub dropped: Vec<Dropped>,
}

impl Extraction {
    #[must_use]
    pub fn entity(&self, key: &EntityKey) -> Option<&Entity> {
        self.entities.iter().find(|e| &e.key == key)
    }

    pub fn entities_of_type(&self, entity_type: EntityType) -> impl Iterator<Item = &Entity> {
        self.entities.iter().filter(move |e| e.entity_type() == entity_type)
    }

    #[must_use]
    pub fn has_entities(&self) -> bool {
        !self.entities.is_empty()
    }

    #[must_use]
    pub fn has_relations(&self) -> bool {
        !self.relations.is_empty()
    }
}

pub struct Extractor {
    registry: Arc<SchemaRegistry>,
    recognizer: Box<dyn Recognizer>,
}

impl Extractor {
    /// Extractor backed by the schema's own field rules.
    #[must_use]
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        let recognizer = Box::new(RuleRecognizer::new(Arc::clone(&registry)));
        Self {
            registry,
            recognizer,
        }
    }

    #[must_use]
    pub fn with_recognizer(mut self, recognizer: Box<dyn Recognizer>) -> Self {
        self.recognizer = recognizer;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn extract(&self, chunk: &Chunk) -> Extraction {
        let recognition = self.recognizer.recognize(chunk);
        let normalizer = Normalizer::new(&self.registry);
        let threshold = self.registry.confidence_threshold();
        let mut dropped = Vec::new();

        let mut entities: Vec<Entity> = Vec::new();
        let mut index: HashMap<EntityKey, usize> = HashMap::new();

        for span in recognition.spans {
            let subject = format!("{}:{}", span.entity_type, span.text);
            if !self.registry.is_declared(span.entity_type) {
                dropped.push(decision(subject, DropReason::UndeclaredEntityType));
                continue;
            }
            if span.confidence.is_nan() || span.confidence < threshold {
                dropped.push(decision(
                    subject,
                    DropReason::BelowThreshold {
                        confidence: span.confidence,
                        threshold,
                    },
                ));
                continue;
            }
            let normalized = match normalizer.normalize(span.entity_type, &span.text) {
                Ok(n) => n,
                Err(error) => {
                    dropped.push(decision(subject, DropReason::InvalidInput { error }));
                    continue;
                }
            };
            let spec = self.registry.entity(span.entity_type);
            if spec.is_some_and(|spec| spec.is_stopword(&normalized.key.canonical_key)) {
                dropped.push(decision(subject, DropReason::Stopword));
                continue;
            }
            let group = spec.and_then(|spec| spec.group_of(&normalized.key.canonical_key));

            let mut entity = Entity::new(normalized.key, normalized.display, span.confidence)
                .with_attributes(span.attributes);
            entity
                .attributes
                .push("surface_forms", crate::normalize::collapse_whitespace(&span.text));
            if let Some(group) = group {
                entity.attributes.insert("group", Value::String(group.to_string()));
            }

            match index.get(&entity.key) {
                Some(&i) => entities[i].absorb(&entity),
                None => {
                    index.insert(entity.key.clone(), entities.len());
                    entities.push(entity);
                }
            }
        }

        let entities = self.apply_caps(entities, &mut dropped);
        let kept: BTreeMap<EntityKey, Entity> =
            entities.into_iter().map(|e| (e.key.clone(), e)).collect();

        let mut relations: BTreeMap<RelationKey, Relation> = BTreeMap::new();
        for candidate in recognition.relations {
            let subject = format!(
                "({}:{})-[{}]->({}:{})",
                candidate.source.0,
                candidate.source.1,
                candidate.relation_type,
                candidate.target.0,
                candidate.target.1
            );
            if !self.registry.allows(candidate.relation_type, candidate.source.0, candidate.target.0) {
                dropped.push(decision(subject, DropReason::UndeclaredRelationPair));
                continue;
            }
            if candidate.confidence.is_nan() || candidate.confidence < threshold {
                dropped.push(decision(
                    subject,
                    DropReason::BelowThreshold {
                        confidence: candidate.confidence,
                        threshold,
                    },
                ));
                continue;
            }
            let endpoints = normalizer
                .normalize(candidate.source.0, &candidate.source.1)
                .and_then(|s| Ok((s, normalizer.normalize(candidate.target.0, &candidate.target.1)?)));
            let (source, target) = match endpoints {
                Ok(pair) => pair,
                Err(error) => {
                    dropped.push(decision(subject, DropReason::InvalidInput { error }));
                    continue;
                }
            };
            if let Some(missing) = [&source.key, &target.key].into_iter().find(|k| !kept.contains_key(*k)) {
                dropped.push(decision(
                    subject,
                    DropReason::DanglingEndpoint {
                        endpoint: missing.to_string(),
                    },
                ));
                continue;
            }

            let relation = Relation::new(
                source.key,
                candidate.relation_type,
                target.key,
                candidate.confidence,
            );
            relations
                .entry(relation.key.clone())
                .and_modify(|existing| existing.confidence = existing.confidence.max(relation.confidence))
                .or_insert(relation);
        }

        for d in &dropped {
            debug!(chunk_id = %chunk.id, subject = %d.subject, reason = %d.reason, "Candidate dropped");
        }

        Extraction {
            chunk_id: chunk.id.clone(),
            entities: kept.into_values().collect(),
            relations: relations.into_values().collect(),
            dropped,
        }
    }

    /// Keeps the highest-confidence entities per capped type, earliest first on ties.
    fn apply_caps(&self, entities: Vec<Entity>, dropped: &mut Vec<Dropped>) -> Vec<Entity> {
        let mut ranked: Vec<(usize, Entity)> = entities.into_iter().enumerate().collect();
        ranked.sort_by(|(ia, a), (ib, b)| {
            a.entity_type()
                .cmp(&b.entity_type())
                .then_with(|| b.confidence.total_cmp(&a.confidence))
                .then_with(|| ia.cmp(ib))
        });

        let mut seen: HashMap<EntityType, usize> = HashMap::new();
        let mut kept = Vec::with_capacity(ranked.len());
        for (_, entity) in ranked {
            let limit = self
                .registry
                .entity(entity.entity_type())
                .and_then(|spec| spec.max_per_chunk);
            let count = seen.entry(entity.entity_type()).or_default();
            match limit {
                Some(limit) if *count >= limit => {
                    dropped.push(decision(entity.key.to_string(), DropReason::OverCap { limit }));
                }
                _ => {
                    *count += 1;
                    kept.push(entity);
                }
            }
        }
        kept
    }
}

fn decision(subject: String, reason: DropReason) -> Dropped {
    Dropped { subject, reason }
}

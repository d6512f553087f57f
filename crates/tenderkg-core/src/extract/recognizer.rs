use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chunk::{parse_date, parse_money, Chunk};
use crate::entity::{Attributes, EntityType};
use crate::relation::RelationType;
use crate::schema::{AttributeKind, FieldRule, Matcher, SchemaRegistry};

/// A raw span proposed by a recognizer, before thresholding and normalisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSpan {
    pub entity_type: EntityType,
    pub text: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Attributes::is_empty")]
    pub attributes: Attributes,
}

impl CandidateSpan {
    #[must_use]
    pub fn new(entity_type: EntityType, text: impl Into<String>, confidence: f64) -> Self {
        Self {
            entity_type,
            text: text.into(),
            confidence,
            attributes: Attributes::new(),
        }
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }
}

/// A proposed edge between two raw spans of the same chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRelation {
    pub relation_type: RelationType,
    pub source: (EntityType, String),
    pub target: (EntityType, String),
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recognition {
    pub spans: Vec<CandidateSpan>,
    pub relations: Vec<CandidateRelation>,
}

impl Recognition {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_span(mut self, span: CandidateSpan) -> Self {
        self.spans.push(span);
        self
    }

    #[must_use]
    pub fn with_relation(mut self, relation: CandidateRelation) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn merge(&mut self, other: Self) {
        self.spans.extend(other.spans);
        self.relations.extend(other.relations);
    }
}

/// Source of candidate spans for a chunk.
///
/// Implementations may be noisy: everything they return is filtered and
/// normalised by the [`super::Extractor`] before it reaches the graph.
pub trait Recognizer: Send + Sync {
    fn name(&self) -> &'static str;

    fn recognize(&self, chunk: &Chunk) -> Recognition;
}

/// Applies the schema's field rules to the tender card.
pub struct RuleRecognizer {
    registry: Arc<SchemaRegistry>,
}

impl RuleRecognizer {
    #[must_use]
    pub const fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    fn card_attributes(&self, entity_type: EntityType, text: &str) -> Attributes {
        let mut attributes = Attributes::new();
        let Some(spec) = self.registry.entity(entity_type) else {
            return attributes;
        };
        for decl in &spec.attributes {
            let Some(raw) = label_values(text, &decl.label).next() else {
                continue;
            };
            let value = match decl.kind {
                AttributeKind::Text => Some(Value::String(raw.to_string())),
                AttributeKind::Date => parse_date(raw)
                    .ok()
                    .map(|d| Value::String(d.format("%Y-%m-%d").to_string())),
                AttributeKind::Money => parse_money(raw)
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number),
            };
            if let Some(value) = value {
                attributes.insert(decl.name.clone(), value);
            }
        }
        attributes
    }
}

impl Recognizer for RuleRecognizer {
    fn name(&self) -> &'static str {
        "rules"
    }

    fn recognize(&self, chunk: &Chunk) -> Recognition {
        let mut out = Recognition::new();
        for rule in self.registry.rules() {
            let attributes = self.card_attributes(rule.entity_type, &chunk.text);
            for text in rule_matches(rule, &chunk.text) {
                out.spans.push(
                    CandidateSpan::new(rule.entity_type, text, rule.confidence)
                        .with_attributes(attributes.clone()),
                );
            }
        }

        for relation in self.registry.relations() {
            let sources = out.spans.iter().filter(|s| s.entity_type == relation.source);
            for source in sources {
                for target in out.spans.iter().filter(|s| s.entity_type == relation.target) {
                    out.relations.push(CandidateRelation {
                        relation_type: relation.relation_type,
                        source: (source.entity_type, source.text.clone()),
                        target: (target.entity_type, target.text.clone()),
                        confidence: source.confidence.min(target.confidence),
                    });
                }
            }
        }
        out
    }
}

fn rule_matches(rule: &FieldRule, text: &str) -> Vec<String> {
    match &rule.matcher {
        Matcher::Label { label, split } => label_values(text, label)
            .flat_map(|value| match split {
                Some(sep) => value.split(sep.as_str()).map(str::trim).collect::<Vec<_>>(),
                None => vec![value],
            })
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect(),
        Matcher::Pattern(re) => re
            .captures_iter(text)
            .filter_map(|caps| caps.get(1).or_else(|| caps.get(0)))
            .map(|m| m.as_str().to_string())
            .collect(),
        Matcher::Lexicon(re) => re.find_iter(text).map(|m| m.as_str().to_string()).collect(),
    }
}

/// Values of `Label: value` lines, skipping the `N/A` placeholder.
fn label_values<'a>(text: &'a str, label: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    text.lines().filter_map(move |line| {
        let (key, value) = line.split_once(':')?;
        let value = value.trim();
        (key.trim().eq_ignore_ascii_case(label) && !value.is_empty() && !value.eq_ignore_ascii_case("n/a"))
            .then_some(value)
    })
}

/// Runs several recognizers and concatenates their output.
#[derive(Default)]
pub struct CompositeRecognizer {
    recognizers: Vec<Box<dyn Recognizer>>,
}

impl CompositeRecognizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_recognizer(mut self, recognizer: Box<dyn Recognizer>) -> Self {
        self.recognizers.push(recognizer);
        self
    }

    pub fn add_recognizer(&mut self, recognizer: Box<dyn Recognizer>) {
        self.recognizers.push(recognizer);
    }
}

impl Recognizer for CompositeRecognizer {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn recognize(&self, chunk: &Chunk) -> Recognition {
        let mut combined = Recognition::new();
        for recognizer in &self.recognizers {
            combined.merge(recognizer.recognize(chunk));
        }
        combined
    }
}

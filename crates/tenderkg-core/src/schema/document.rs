use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// On-disk form of the extraction schema. Validated and compiled by
/// [`super::SchemaRegistry::from_document`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaDocument {
    pub version: String,
    #[serde(default = "default_threshold")]
    pub confidence_threshold: f64,
    pub entities: Vec<EntityDecl>,
    #[serde(default)]
    pub rules: Vec<RuleDecl>,
    #[serde(default)]
    pub relations: Vec<RelationDecl>,
}

const fn default_threshold() -> f64 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntityDecl {
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub fields: Vec<String>,
    pub normalization: String,
    /// Raw variant -> canonical display form.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    #[serde(default)]
    pub stopwords: Vec<String>,
    #[serde(default)]
    pub max_per_chunk: Option<usize>,
    #[serde(default)]
    pub attributes: Vec<AttributeDecl>,
    /// Group name -> raw member values. Members are folded like entity text.
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
}

/// A card line copied onto the entity as an attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributeDecl {
    pub name: String,
    pub label: String,
    #[serde(default)]
    pub kind: AttributeKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    #[default]
    Text,
    Date,
    Money,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDecl {
    pub entity: String,
    pub field: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub split: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub terms: Option<Vec<String>>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelationDecl {
    #[serde(rename = "type")]
    pub relation_type: String,
    pub source: String,
    pub target: String,
}

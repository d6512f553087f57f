use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entity::EntityType;

/// Problems with the extraction schema document. Fatal at load time.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("Unknown relation type: {0}")]
    UnknownRelationType(String),

    #[error("Unknown normalization strategy: {0}")]
    UnknownStrategy(String),

    #[error("Entity type {0} is declared more than once")]
    DuplicateEntity(EntityType),

    #[error("Rule references undeclared entity type {0}")]
    UndeclaredEntity(EntityType),

    #[error("Rule for {entity} references unknown field {field:?}")]
    UnknownField { entity: EntityType, field: String },

    #[error("Rule {entity}.{field} must set exactly one of label, pattern, terms")]
    AmbiguousRule { entity: EntityType, field: String },

    #[error("Invalid pattern for {entity}.{field}: {source}")]
    InvalidPattern {
        entity: EntityType,
        field: String,
        #[source]
        source: regex::Error,
    },

    #[error("Confidence {value} for {context} is outside [0, 1]")]
    ConfidenceOutOfRange { context: String, value: f64 },

    #[error("Relation {relation} endpoint {endpoint} is not a declared entity type")]
    UndeclaredEndpoint { relation: String, endpoint: EntityType },

    #[error("Relation {0} is declared more than once")]
    DuplicateRelation(String),

    #[error("MENTIONS is created by the merger and cannot be declared as an extraction relation")]
    MentionsNotExtractable,

    #[error("Alias {alias:?} for {entity} folds to an empty key")]
    EmptyAlias { entity: EntityType, alias: String },

    #[error("Alias {alias:?} for {entity} resolves to {target:?}, which is itself an alias")]
    AliasChain {
        entity: EntityType,
        alias: String,
        target: String,
    },

    #[error("Member of group {group:?} for {entity} folds to an empty key")]
    EmptyGroupMember { entity: EntityType, group: String },

    #[error("{entity} {member:?} is placed in both group {first:?} and group {second:?}")]
    GroupConflict {
        entity: EntityType,
        member: String,
        first: String,
        second: String,
    },

    #[error("Graph was built with schema version {stored}, loaded schema is {loaded}")]
    VersionMismatch { stored: String, loaded: String },

    #[error("Failed to read schema document: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse schema document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Malformed input to a single field or chunk. Recovered locally.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum InvalidInputError {
    #[error("Empty value for {0}")]
    Empty(EntityType),

    #[error("Unrecognised date: {0:?}")]
    InvalidDate(String),

    #[error("Chunk has no id")]
    MissingChunkId,

    #[error("Record has no tender number")]
    MissingTenderNo,
}

/// Failures talking to the graph store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Transient store error: {0}")]
    Transient(String),

    #[error("Store call timed out after {0} ms")]
    Timeout(u64),

    #[error("Store error: {0}")]
    Permanent(String),

    /// An immutable chunk already exists with different field values.
    #[error("Chunk {chunk_id} conflicts with stored values for: {}", fields.join(", "))]
    ChunkConflict {
        chunk_id: String,
        fields: Vec<String>,
    },
}

impl StoreError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => {
                Self::Transient(err.to_string())
            }
            sqlx::Error::Database(db_err) if is_busy_code(db_err.code().as_deref()) => {
                Self::Transient(err.to_string())
            }
            _ => Self::Permanent(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Permanent(format!("attribute encoding: {err}"))
    }
}

// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including their extended codes.
fn is_busy_code(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i32>().ok())
        .is_some_and(|c| matches!(c & 0xff, 5 | 6))
}

/// Per-chunk merge failure surfaced in a `MergeReport`. The batch continues.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeError {
    #[error("Chunk {chunk_id} already stored with different values for: {}", fields.join(", "))]
    ChunkConflict {
        chunk_id: String,
        fields: Vec<String>,
    },

    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Store rejected merge: {message}")]
    Store { message: String },

    #[error("Relation {relation} references {endpoint} which the chunk did not contribute")]
    DanglingRelation { relation: String, endpoint: String },

    #[error("Invalid chunk: {reason}")]
    InvalidChunk { reason: String },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Tender {0} is not in the graph")]
    UnknownTender(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed record on line {line}: {source}")]
    Record {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

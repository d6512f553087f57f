use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::snapshot::GraphState;
use crate::chunk::Chunk;
use crate::entity::{Attributes, Entity, EntityKey, EntityType};
use crate::error::{MergeError, StoreError};
use crate::extract::Extraction;
use crate::relation::{Relation, RelationType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

/// Everything one chunk contributes to the graph. Applied as one atomic unit.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeBatch {
    pub run_id: Uuid,
    pub chunk: Chunk,
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
}

impl MergeBatch {
    #[must_use]
    pub fn new(run_id: Uuid, chunk: Chunk, extraction: Extraction) -> Self {
        Self {
            run_id,
            chunk,
            entities: extraction.entities,
            relations: extraction.relations,
        }
    }

    /// Rejects batches that could leave an entity without a mention.
    pub fn validate(&self) -> Result<(), MergeError> {
        self.chunk
            .validate()
            .map_err(|e| MergeError::InvalidChunk {
                reason: e.to_string(),
            })?;

        let keys: BTreeSet<&EntityKey> = self.entities.iter().map(|e| &e.key).collect();
        for relation in &self.relations {
            if relation.key.relation_type == RelationType::Mentions {
                return Err(MergeError::InvalidChunk {
                    reason: format!("{} is created by the merger", relation.key),
                });
            }
            for endpoint in [&relation.key.source, &relation.key.target] {
                if !keys.contains(endpoint) {
                    return Err(MergeError::DanglingRelation {
                        relation: relation.key.to_string(),
                        endpoint: endpoint.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Counts of what an `apply` call changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub chunk_created: bool,
    pub entities_created: usize,
    pub entities_updated: usize,
    pub relations_created: usize,
    pub relations_updated: usize,
    pub mentions_created: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntity {
    pub key: EntityKey,
    pub display_name: String,
    pub confidence: f64,
    pub attributes: Attributes,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An entity reached by [`GraphStore::traverse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraversalHit {
    pub key: EntityKey,
    pub depth: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub chunks: u64,
    pub entities: u64,
    pub relations: u64,
    pub mentions: u64,
    pub entities_by_type: BTreeMap<EntityType, u64>,
}

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs one store call under `limit`. Running out of time is a
/// [`StoreError::Timeout`], which callers treat as transient.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    let limit_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(StoreError::Timeout(limit_ms)))
}

/// The store boundary used by the merger and the ranker.
///
/// Every write in `apply` must be an idempotent upsert so that retrying a
/// whole batch after a lost acknowledgement is harmless.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn schema_version(&self) -> Result<Option<String>, StoreError>;

    async fn set_schema_version(&self, version: &str) -> Result<(), StoreError>;

    async fn apply(&self, batch: &MergeBatch) -> Result<MergeOutcome, StoreError>;

    async fn chunk(&self, id: &str) -> Result<Option<Chunk>, StoreError>;

    async fn entity(&self, key: &EntityKey) -> Result<Option<StoredEntity>, StoreError>;

    async fn entities_of_type(&self, entity_type: EntityType) -> Result<Vec<StoredEntity>, StoreError>;

    /// Chunk ids holding a `MENTIONS` edge to `key`.
    async fn mentions_of(&self, key: &EntityKey) -> Result<Vec<String>, StoreError>;

    /// Entities reachable from `start` over `relation_types` within `depth` hops.
    /// An empty type list means every type. `start` itself is never returned.
    async fn traverse(
        &self,
        start: &EntityKey,
        relation_types: &[RelationType],
        direction: Direction,
        depth: u32,
    ) -> Result<Vec<TraversalHit>, StoreError>;

    async fn snapshot(&self) -> Result<GraphState, StoreError>;

    async fn stats(&self) -> Result<GraphStats, StoreError>;
}

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::debug;

use super::snapshot::{EntityState, GraphState};
use super::store::{Direction, GraphStats, GraphStore, MergeBatch, MergeOutcome, StoredEntity, TraversalHit};
use crate::chunk::Chunk;
use crate::entity::{Attributes, EntityKey, EntityType};
use crate::error::StoreError;
use crate::relation::{Mention, RelationKey, RelationType};

const INIT_SQL: &str = r"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    run_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS entities (
    entity_type TEXT NOT NULL,
    canonical_key TEXT NOT NULL,
    display_name TEXT NOT NULL,
    confidence REAL NOT NULL,
    attributes TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (entity_type, canonical_key)
);

CREATE TABLE IF NOT EXISTS relations (
    source_type TEXT NOT NULL,
    source_key TEXT NOT NULL,
    relation_type TEXT NOT NULL,
    target_type TEXT NOT NULL,
    target_key TEXT NOT NULL,
    confidence REAL NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (source_type, source_key, relation_type, target_type, target_key)
);

CREATE INDEX IF NOT EXISTS idx_relations_target ON relations(target_type, target_key);

CREATE TABLE IF NOT EXISTS mentions (
    chunk_id TEXT NOT NULL REFERENCES chunks(id),
    entity_type TEXT NOT NULL,
    canonical_key TEXT NOT NULL,
    run_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (chunk_id, entity_type, canonical_key)
);

CREATE INDEX IF NOT EXISTS idx_mentions_entity ON mentions(entity_type, canonical_key);
";

const TRAVERSE_SQL: &str = r"
WITH RECURSIVE
edges(from_type, from_key, next_type, next_key) AS (
    SELECT source_type, source_key, target_type, target_key FROM relations
    WHERE ?4 IN ('outgoing', 'both')
      AND (?5 = '' OR instr(?5, ',' || relation_type || ',') > 0)
    UNION ALL
    SELECT target_type, target_key, source_type, source_key FROM relations
    WHERE ?4 IN ('incoming', 'both')
      AND (?5 = '' OR instr(?5, ',' || relation_type || ',') > 0)
),
walk(entity_type, canonical_key, depth) AS (
    SELECT ?1, ?2, 0
    UNION
    SELECT e.next_type, e.next_key, walk.depth + 1
    FROM walk
    JOIN edges e ON e.from_type = walk.entity_type AND e.from_key = walk.canonical_key
    WHERE walk.depth < ?3
)
SELECT entity_type, canonical_key, MIN(depth)
FROM walk
WHERE depth > 0 AND NOT (entity_type = ?1 AND canonical_key = ?2)
GROUP BY entity_type, canonical_key
";

type EntityRow = (String, String, String, f64, String, String, String);

/// [`GraphStore`] over SQLite. Each `apply` is one transaction.
#[derive(Clone)]
pub struct SqliteGraphStore {
    pool: Pool<Sqlite>,
}

impl SqliteGraphStore {
    pub async fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(INIT_SQL).execute(&pool).await?;
        debug!(path = %path.display(), "Graph store opened");

        Ok(Self { pool })
    }

    pub async fn open_memory() -> Result<Self, StoreError> {
        // One connection that never expires: the database lives in it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        sqlx::query(INIT_SQL).execute(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn schema_version(&self) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM meta WHERE key = 'schema_version'")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    async fn set_schema_version(&self, version: &str) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO meta (key, value) VALUES ('schema_version', ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            ",
        )
        .bind(version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn apply(&self, batch: &MergeBatch) -> Result<MergeOutcome, StoreError> {
        let now = Utc::now().to_rfc3339();
        let run_id = batch.run_id.to_string();
        let chunk = &batch.chunk;
        let mut outcome = MergeOutcome::default();
        let mut tx = self.pool.begin().await?;

        // 1. chunk: insert once, immutable afterwards. Written first so the
        // transaction holds the write lock from its first statement.
        let inserted = sqlx::query(
            "INSERT INTO chunks (id, data, run_id, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&chunk.id)
        .bind(serde_json::to_string(chunk)?)
        .bind(&run_id)
        .bind(&now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            let (data,): (String,) = sqlx::query_as("SELECT data FROM chunks WHERE id = ?")
                .bind(&chunk.id)
                .fetch_one(&mut *tx)
                .await?;
            let stored: Chunk = serde_json::from_str(&data)?;
            let fields = stored.conflicting_fields(chunk);
            if !fields.is_empty() {
                tx.rollback().await?;
                return Err(StoreError::ChunkConflict {
                    chunk_id: chunk.id.clone(),
                    fields,
                });
            }
        } else {
            outcome.chunk_created = true;
        }

        // 2. entities: create, or union attributes, keep max confidence and
        // the least display name
        for entity in &batch.entities {
            let key = &entity.key;
            let existing: Option<(String, f64, String)> = sqlx::query_as(
                r"
                SELECT display_name, confidence, attributes FROM entities
                WHERE entity_type = ? AND canonical_key = ?
                ",
            )
            .bind(key.entity_type.as_str())
            .bind(&key.canonical_key)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                None => {
                    sqlx::query(
                        r"
                        INSERT INTO entities
                            (entity_type, canonical_key, display_name, confidence, attributes, created_at, updated_at)
                        VALUES (?, ?, ?, ?, ?, ?, ?)
                        ",
                    )
                    .bind(key.entity_type.as_str())
                    .bind(&key.canonical_key)
                    .bind(&entity.display_name)
                    .bind(entity.confidence)
                    .bind(serde_json::to_string(&entity.attributes)?)
                    .bind(&now)
                    .bind(&now)
                    .execute(&mut *tx)
                    .await?;
                    outcome.entities_created += 1;
                }
                Some((display_name, confidence, attributes)) => {
                    let mut merged: Attributes = serde_json::from_str(&attributes)?;
                    let changed = merged.union(&entity.attributes);
                    let renamed = entity.display_name < display_name;
                    if changed || renamed || entity.confidence > confidence {
                        sqlx::query(
                            r"
                            UPDATE entities
                            SET display_name = MIN(display_name, ?), confidence = MAX(confidence, ?),
                                attributes = ?, updated_at = ?
                            WHERE entity_type = ? AND canonical_key = ?
                            ",
                        )
                        .bind(&entity.display_name)
                        .bind(entity.confidence)
                        .bind(serde_json::to_string(&merged)?)
                        .bind(&now)
                        .bind(key.entity_type.as_str())
                        .bind(&key.canonical_key)
                        .execute(&mut *tx)
                        .await?;
                        outcome.entities_updated += 1;
                    }
                }
            }
        }

        // 3. relations: create, or raise confidence
        for relation in &batch.relations {
            let k = &relation.key;
            let existing: Option<(f64,)> = sqlx::query_as(
                r"
                SELECT confidence FROM relations
                WHERE source_type = ? AND source_key = ? AND relation_type = ?
                  AND target_type = ? AND target_key = ?
                ",
            )
            .bind(k.source.entity_type.as_str())
            .bind(&k.source.canonical_key)
            .bind(k.relation_type.as_str())
            .bind(k.target.entity_type.as_str())
            .bind(&k.target.canonical_key)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                None => {
                    sqlx::query(
                        r"
                        INSERT INTO relations
                            (source_type, source_key, relation_type, target_type, target_key,
                             confidence, created_at, updated_at)
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                        ",
                    )
                    .bind(k.source.entity_type.as_str())
                    .bind(&k.source.canonical_key)
                    .bind(k.relation_type.as_str())
                    .bind(k.target.entity_type.as_str())
                    .bind(&k.target.canonical_key)
                    .bind(relation.confidence)
                    .bind(&now)
                    .bind(&now)
                    .execute(&mut *tx)
                    .await?;
                    outcome.relations_created += 1;
                }
                Some((confidence,)) if relation.confidence > confidence => {
                    sqlx::query(
                        r"
                        UPDATE relations SET confidence = ?, updated_at = ?
                        WHERE source_type = ? AND source_key = ? AND relation_type = ?
                          AND target_type = ? AND target_key = ?
                        ",
                    )
                    .bind(relation.confidence)
                    .bind(&now)
                    .bind(k.source.entity_type.as_str())
                    .bind(&k.source.canonical_key)
                    .bind(k.relation_type.as_str())
                    .bind(k.target.entity_type.as_str())
                    .bind(&k.target.canonical_key)
                    .execute(&mut *tx)
                    .await?;
                    outcome.relations_updated += 1;
                }
                Some(_) => {}
            }
        }

        // 4. one mention per contributed entity
        for entity in &batch.entities {
            let result = sqlx::query(
                r"
                INSERT INTO mentions (chunk_id, entity_type, canonical_key, run_id, created_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id, entity_type, canonical_key) DO NOTHING
                ",
            )
            .bind(&chunk.id)
            .bind(entity.key.entity_type.as_str())
            .bind(&entity.key.canonical_key)
            .bind(&run_id)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
            outcome.mentions_created += usize::try_from(result.rows_affected()).unwrap_or(0);
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn chunk(&self, id: &str) -> Result<Option<Chunk>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT data FROM chunks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(data,)| serde_json::from_str(&data).map_err(StoreError::from))
            .transpose()
    }

    async fn entity(&self, key: &EntityKey) -> Result<Option<StoredEntity>, StoreError> {
        let row: Option<EntityRow> = sqlx::query_as(
            r"
            SELECT entity_type, canonical_key, display_name, confidence, attributes, created_at, updated_at
            FROM entities WHERE entity_type = ? AND canonical_key = ?
            ",
        )
        .bind(key.entity_type.as_str())
        .bind(&key.canonical_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(parse_entity_row).transpose()
    }

    async fn entities_of_type(&self, entity_type: EntityType) -> Result<Vec<StoredEntity>, StoreError> {
        let rows: Vec<EntityRow> = sqlx::query_as(
            r"
            SELECT entity_type, canonical_key, display_name, confidence, attributes, created_at, updated_at
            FROM entities WHERE entity_type = ? ORDER BY canonical_key
            ",
        )
        .bind(entity_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_entity_row).collect()
    }

    async fn mentions_of(&self, key: &EntityKey) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT chunk_id FROM mentions WHERE entity_type = ? AND canonical_key = ? ORDER BY chunk_id",
        )
        .bind(key.entity_type.as_str())
        .bind(&key.canonical_key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn traverse(
        &self,
        start: &EntityKey,
        relation_types: &[RelationType],
        direction: Direction,
        depth: u32,
    ) -> Result<Vec<TraversalHit>, StoreError> {
        let types = if relation_types.is_empty() {
            String::new()
        } else {
            let names: Vec<&str> = relation_types.iter().map(RelationType::as_str).collect();
            format!(",{},", names.join(","))
        };
        let direction = match direction {
            Direction::Outgoing => "outgoing",
            Direction::Incoming => "incoming",
            Direction::Both => "both",
        };

        let rows: Vec<(String, String, i64)> = sqlx::query_as(TRAVERSE_SQL)
            .bind(start.entity_type.as_str())
            .bind(&start.canonical_key)
            .bind(i64::from(depth))
            .bind(direction)
            .bind(types)
            .fetch_all(&self.pool)
            .await?;

        let mut hits = rows
            .into_iter()
            .map(|(t, k, d)| {
                Ok(TraversalHit {
                    key: parse_key(&t, k)?,
                    depth: u32::try_from(d).unwrap_or(u32::MAX),
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        hits.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.key.cmp(&b.key)));
        Ok(hits)
    }

    async fn snapshot(&self) -> Result<GraphState, StoreError> {
        let mut state = GraphState::default();

        let chunks: Vec<(String, String)> = sqlx::query_as("SELECT id, data FROM chunks")
            .fetch_all(&self.pool)
            .await?;
        for (id, data) in chunks {
            state.chunks.insert(id, serde_json::from_str(&data)?);
        }

        let entities: Vec<(String, String, String, f64, String)> = sqlx::query_as(
            "SELECT entity_type, canonical_key, display_name, confidence, attributes FROM entities",
        )
        .fetch_all(&self.pool)
        .await?;
        for (t, k, display_name, confidence, attributes) in entities {
            state.entities.insert(
                parse_key(&t, k)?,
                EntityState {
                    display_name,
                    confidence,
                    attributes: serde_json::from_str(&attributes)?,
                },
            );
        }

        let relations: Vec<(String, String, String, String, String, f64)> = sqlx::query_as(
            r"
            SELECT source_type, source_key, relation_type, target_type, target_key, confidence
            FROM relations
            ",
        )
        .fetch_all(&self.pool)
        .await?;
        for (st, sk, rt, tt, tk, confidence) in relations {
            let key = RelationKey {
                source: parse_key(&st, sk)?,
                relation_type: rt
                    .parse()
                    .map_err(|e: crate::SchemaError| StoreError::Permanent(e.to_string()))?,
                target: parse_key(&tt, tk)?,
            };
            state.relations.insert(key, confidence);
        }

        let mentions: Vec<(String, String, String)> =
            sqlx::query_as("SELECT chunk_id, entity_type, canonical_key FROM mentions")
                .fetch_all(&self.pool)
                .await?;
        for (chunk_id, t, k) in mentions {
            state.mentions.insert(Mention {
                chunk_id,
                entity: parse_key(&t, k)?,
            });
        }

        Ok(state)
    }

    async fn stats(&self) -> Result<GraphStats, StoreError> {
        let by_type: Vec<(String, i64)> =
            sqlx::query_as("SELECT entity_type, COUNT(*) FROM entities GROUP BY entity_type")
                .fetch_all(&self.pool)
                .await?;
        let mut entities_by_type = BTreeMap::new();
        for (t, n) in by_type {
            let t: EntityType = t
                .parse()
                .map_err(|e: crate::SchemaError| StoreError::Permanent(e.to_string()))?;
            entities_by_type.insert(t, u64::try_from(n).unwrap_or(0));
        }

        Ok(GraphStats {
            chunks: count_rows(&self.pool, "chunks").await?,
            entities: count_rows(&self.pool, "entities").await?,
            relations: count_rows(&self.pool, "relations").await?,
            mentions: count_rows(&self.pool, "mentions").await?,
            entities_by_type,
        })
    }
}

async fn count_rows(pool: &Pool<Sqlite>, table: &'static str) -> Result<u64, StoreError> {
    let sql = format!("SELECT COUNT(*) FROM {table}");
    let (n,): (i64,) = sqlx::query_as(&sql).fetch_one(pool).await?;
    Ok(u64::try_from(n).unwrap_or(0))
}

fn parse_key(entity_type: &str, canonical_key: String) -> Result<EntityKey, StoreError> {
    let entity_type: EntityType = entity_type
        .parse()
        .map_err(|e: crate::SchemaError| StoreError::Permanent(e.to_string()))?;
    Ok(EntityKey::new(entity_type, canonical_key))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Permanent(format!("bad timestamp {raw:?}: {e}")))
}

fn parse_entity_row(row: EntityRow) -> Result<StoredEntity, StoreError> {
    let (entity_type, canonical_key, display_name, confidence, attributes, created_at, updated_at) = row;

    Ok(StoredEntity {
        key: parse_key(&entity_type, canonical_key)?,
        display_name,
        confidence,
        attributes: serde_json::from_str(&attributes)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]

pub mod chunk;
pub mod config;
pub mod entity;
pub mod error;
pub mod extract;
pub mod graph;
pub mod normalize;
pub mod pipeline;
pub mod rank;
pub mod relation;
pub mod schema;

pub use chunk::{Chunk, TenderRecord};
pub use config::{PipelineConfig, RetryConfig};
pub use entity::{Attributes, Entity, EntityKey, EntityType};
pub use error::{Error, InvalidInputError, MergeError, Result, SchemaError, StoreError};
pub use extract::{DropReason, Dropped, Extraction, Extractor, Recognizer, RuleRecognizer};
pub use graph::{
    Direction, GraphMerger, GraphSnapshot, GraphState, GraphStore, MergeBatch, MergeReport,
    RetryPolicy, SqliteGraphStore,
};
pub use normalize::{suggest_aliases, AliasSuggestion, NormalizationStrategy, Normalized, Normalizer};
pub use pipeline::{check_schema_version, prepare_store, BatchReport, BatchRunner};
pub use rank::{CandidatePool, RankWeights, SimilarTender, SimilarityRanker};
pub use relation::{Mention, Relation, RelationKey, RelationType};
pub use schema::SchemaRegistry;

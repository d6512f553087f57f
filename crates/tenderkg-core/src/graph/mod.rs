mod merger;
mod snapshot;
mod sqlite;
mod store;

pub use merger::{GraphMerger, MergeReport, RetryPolicy};
pub use snapshot::{EntityState, GraphSnapshot, GraphState, Node};
pub use sqlite::SqliteGraphStore;
pub use store::{
    bounded, Direction, GraphStats, GraphStore, MergeBatch, MergeOutcome, StoredEntity,
    TraversalHit, DEFAULT_STORE_TIMEOUT,
};

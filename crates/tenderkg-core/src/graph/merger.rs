use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::store::{bounded, GraphStore, MergeBatch, MergeOutcome, DEFAULT_STORE_TIMEOUT};
use crate::config::{PipelineConfig, RetryConfig};
use crate::error::{MergeError, StoreError};

/// Exponential backoff with jitter for transient store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            config.initial_backoff_ms,
            config.max_backoff_ms,
        )
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_retries: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::from_millis(initial_backoff_ms),
            max_backoff: Duration::from_millis(max_backoff_ms),
        }
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based): doubles each time, plus up
    /// to 50% random jitter, never above `max_backoff`.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(20);
        let base = self
            .initial_backoff
            .saturating_mul(1 << exp)
            .min(self.max_backoff);
        let jitter_ms = u64::try_from(base.as_millis() / 2).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        (base + jitter).min(self.max_backoff)
    }

    /// Runs `f` until it succeeds, fails permanently, or the budget runs out.
    /// Returns the last result together with the number of attempts made.
    pub async fn retry<F, Fut, T>(&self, chunk_id: &str, mut f: F) -> (Result<T, StoreError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(chunk_id, attempts = attempt, "Merge succeeded after retries");
                    }
                    return (Ok(value), attempt);
                }
                Err(e) if e.is_transient() && attempt <= self.max_retries => {
                    let backoff = self.backoff(attempt);
                    warn!(
                        chunk_id,
                        attempt,
                        max_retries = self.max_retries,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Merge failed, retrying"
                    );
                    sleep(backoff).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!(chunk_id, attempts = attempt, error = %e, "Merge failed after max retries");
                    }
                    return (Err(e), attempt);
                }
            }
        }
    }
}

/// Per-chunk result of a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub chunk_id: String,
    pub chunk_created: bool,
    pub entities_created: usize,
    pub entities_updated: usize,
    pub relations_created: usize,
    pub relations_updated: usize,
    pub mentions_created: usize,
    /// Extraction candidates dropped before the merge.
    pub dropped: usize,
    /// Whether extraction found anything in the chunk at all.
    pub has_entities: bool,
    pub has_relations: bool,
    pub attempts: u32,
    pub errors: Vec<MergeError>,
}

impl MergeReport {
    #[must_use]
    pub fn new(chunk_id: impl Into<String>) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    fn record(&mut self, outcome: MergeOutcome) {
        self.chunk_created = outcome.chunk_created;
        self.entities_created = outcome.entities_created;
        self.entities_updated = outcome.entities_updated;
        self.relations_created = outcome.relations_created;
        self.relations_updated = outcome.relations_updated;
        self.mentions_created = outcome.mentions_created;
    }
}

/// Applies one chunk's extraction to the store as an atomic, retried unit.
#[derive(Clone)]
pub struct GraphMerger {
    store: Arc<dyn GraphStore>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl GraphMerger {
    #[must_use]
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            store,
            policy: RetryPolicy::default(),
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn from_config(store: Arc<dyn GraphStore>, config: &PipelineConfig) -> Self {
        Self::new(store)
            .with_policy(RetryPolicy::from(&config.retry))
            .with_timeout(config.store_timeout())
    }

    #[must_use]
    pub const fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Never fails: every problem ends up in `MergeReport::errors`.
    pub async fn merge(&self, batch: &MergeBatch) -> MergeReport {
        let mut report = MergeReport::new(batch.chunk.id.clone());

        if let Err(e) = batch.validate() {
            warn!(chunk_id = %batch.chunk.id, error = %e, "Rejected merge batch");
            report.errors.push(e);
            return report;
        }

        let store = &self.store;
        let timeout = self.timeout;
        let (result, attempts) = self
            .policy
            .retry(&batch.chunk.id, move || bounded(timeout, store.apply(batch)))
            .await;
        report.attempts = attempts;

        match result {
            Ok(outcome) => {
                debug!(
                    chunk_id = %batch.chunk.id,
                    entities_created = outcome.entities_created,
                    relations_created = outcome.relations_created,
                    "Merged chunk"
                );
                report.record(outcome);
            }
            Err(e) => {
                let error = match e {
                    StoreError::ChunkConflict { chunk_id, fields } => {
                        MergeError::ChunkConflict { chunk_id, fields }
                    }
                    e if e.is_transient() => MergeError::RetriesExhausted {
                        attempts,
                        last_error: e.to_string(),
                    },
                    e => MergeError::Store {
                        message: e.to_string(),
                    },
                };
                warn!(chunk_id = %batch.chunk.id, error = %error, "Chunk merge failed");
                report.errors.push(error);
            }
        }
        report
    }
}

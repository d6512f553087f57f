use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::chunk::Chunk;
use crate::config::PipelineConfig;
use crate::error::{MergeError, Result, SchemaError};
use crate::extract::Extractor;
use crate::graph::{bounded, GraphMerger, GraphStore, MergeBatch, MergeReport};
use crate::schema::SchemaRegistry;

/// Outcome of one batch run. Never an error: per-chunk failures live in
/// the individual reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    /// One report per scheduled chunk, in input order.
    pub reports: Vec<MergeReport>,
    /// Chunks never scheduled because the run was cancelled.
    pub skipped: Vec<String>,
}

impl BatchReport {
    #[must_use]
    pub const fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            reports: Vec::new(),
            skipped: Vec::new(),
        }
    }

    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.reports.iter().filter(|r| r.is_success()).count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.reports.len() - self.succeeded()
    }

    #[must_use]
    pub fn failures(&self) -> impl Iterator<Item = &MergeReport> {
        self.reports.iter().filter(|r| !r.is_success())
    }

    #[must_use]
    pub fn was_cancelled(&self) -> bool {
        !self.skipped.is_empty()
    }
}

/// Checks the store is reachable and was built with the loaded schema.
/// An empty store is stamped with the schema version.
///
/// These are the only failures that abort a whole run.
pub async fn prepare_store(
    store: &dyn GraphStore,
    registry: &SchemaRegistry,
    timeout: Duration,
) -> Result<()> {
    if check_schema_version(store, registry, timeout).await?.is_none() {
        bounded(timeout, store.set_schema_version(registry.version())).await?;
        info!(version = registry.version(), "Stamped new graph with schema version");
    }
    Ok(())
}

/// Read-only counterpart of [`prepare_store`]: fails on a version mismatch
/// but never stamps. Returns the stored version, if any.
pub async fn check_schema_version(
    store: &dyn GraphStore,
    registry: &SchemaRegistry,
    timeout: Duration,
) -> Result<Option<String>> {
    bounded(timeout, store.ping()).await?;
    match bounded(timeout, store.schema_version()).await? {
        Some(stored) if stored != registry.version() => Err(SchemaError::VersionMismatch {
            stored,
            loaded: registry.version().to_string(),
        }
        .into()),
        stored => Ok(stored),
    }
}

/// Extracts and merges chunks on a bounded pool of tasks.
pub struct BatchRunner {
    extractor: Arc<Extractor>,
    merger: GraphMerger,
    concurrency: usize,
    cancel: Option<watch::Receiver<bool>>,
}

impl BatchRunner {
    #[must_use]
    pub const fn new(extractor: Arc<Extractor>, merger: GraphMerger) -> Self {
        Self {
            extractor,
            merger,
            concurrency: 4,
            cancel: None,
        }
    }

    #[must_use]
    pub fn from_config(
        registry: Arc<SchemaRegistry>,
        store: Arc<dyn GraphStore>,
        config: &PipelineConfig,
    ) -> Self {
        Self::new(
            Arc::new(Extractor::new(registry)),
            GraphMerger::from_config(store, config),
        )
        .with_concurrency(config.concurrency)
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Once the receiver observes `true`, no new chunk is scheduled.
    /// Merges already in flight run to completion.
    #[must_use]
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub async fn run(&self, chunks: Vec<Chunk>) -> BatchReport {
        let run_id = Uuid::now_v7();
        let total = chunks.len();
        info!(%run_id, chunks = total, concurrency = self.concurrency, "Starting batch");

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut cancel = self.cancel.clone();
        let mut tasks = JoinSet::new();
        let mut scheduled = Vec::new();
        let mut slots: Vec<Option<MergeReport>> = vec![None; total];
        let mut report = BatchReport::new(run_id);

        let mut chunks = chunks.into_iter().enumerate();
        while let Some((index, chunk)) = chunks.next() {
            let permit = tokio::select! {
                biased;
                () = cancelled(&mut cancel) => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                report.skipped.push(chunk.id);
                report.skipped.extend(chunks.by_ref().map(|(_, c)| c.id));
                warn!(%run_id, skipped = report.skipped.len(), "Batch cancelled, not scheduling remaining chunks");
                break;
            };

            scheduled.push(chunk.id.clone());
            let extractor = Arc::clone(&self.extractor);
            let merger = self.merger.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let extraction = extractor.extract(&chunk);
                let dropped = extraction.dropped.len();
                let (has_entities, has_relations) =
                    (extraction.has_entities(), extraction.has_relations());
                if !has_entities {
                    warn!(chunk_id = %chunk.id, "No entities extracted");
                }
                let batch = MergeBatch::new(run_id, chunk, extraction);
                let mut report = merger.merge(&batch).await;
                report.dropped = dropped;
                report.has_entities = has_entities;
                report.has_relations = has_relations;
                (index, report)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, merge_report)) => slots[index] = Some(merge_report),
                Err(e) => error!(%run_id, error = %e, "Merge task failed"),
            }
        }

        // A slot is only empty when its task panicked.
        report.reports = scheduled
            .into_iter()
            .zip(slots)
            .map(|(chunk_id, slot)| {
                slot.unwrap_or_else(|| {
                    let mut failed = MergeReport::new(chunk_id);
                    failed.errors.push(MergeError::Store {
                        message: "merge task panicked".into(),
                    });
                    failed
                })
            })
            .collect();
        info!(
            %run_id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            skipped = report.skipped.len(),
            "Batch finished"
        );
        report
    }
}

/// Resolves once cancellation is requested; never resolves without a receiver
/// or after the sender is gone.
async fn cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = cancel {
        if rx.wait_for(|&c| c).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await;
}

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use tenderkg_core::chunk::read_jsonl;
use tenderkg_core::{prepare_store, BatchReport, BatchRunner, Chunk, GraphStore, PipelineConfig};
use tokio::sync::watch;
use tracing::warn;

use super::{load_registry, open_store};

pub async fn run(config: &PipelineConfig, chunks: &Path, json: bool) -> Result<()> {
    let registry = load_registry(config)?;
    let store = open_store(config).await?;
    prepare_store(store.as_ref(), &registry, config.store_timeout()).await?;

    let file = File::open(chunks).with_context(|| format!("Cannot read {}", chunks.display()))?;
    let chunks: Vec<Chunk> = read_jsonl(BufReader::new(file))?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight chunks");
            cancel_tx.send_replace(true);
        }
    });

    let graph: std::sync::Arc<dyn GraphStore> = store.clone();
    let runner = BatchRunner::from_config(registry, graph, config).with_cancel(cancel_rx);
    let report = runner.run(chunks).await;
    ctrl_c.abort();
    store.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }
    Ok(())
}

fn print_summary(report: &BatchReport) {
    let created: usize = report.reports.iter().map(|r| r.entities_created).sum();
    let updated: usize = report.reports.iter().map(|r| r.entities_updated).sum();
    let relations: usize = report.reports.iter().map(|r| r.relations_created).sum();
    let dropped: usize = report.reports.iter().map(|r| r.dropped).sum();

    println!("Run {}", report.run_id);
    println!(
        "  Chunks: {} merged, {} failed, {} skipped",
        report.succeeded(),
        report.failed(),
        report.skipped.len()
    );
    println!("  Entities: {created} created, {updated} updated");
    println!("  Relations: {relations} created");
    println!("  Dropped candidates: {dropped}");
    let empty = report.reports.iter().filter(|r| !r.has_entities).count();
    if empty > 0 {
        println!("  Chunks without entities: {empty}");
    }

    for failure in report.failures() {
        for error in &failure.errors {
            println!("  ! {}: {error}", failure.chunk_id);
        }
    }
}

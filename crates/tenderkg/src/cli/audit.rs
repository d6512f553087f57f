use anyhow::Result;
use serde::Serialize;
use tenderkg_core::graph::{GraphStats, GraphStore};
use tenderkg_core::graph::bounded;
use tenderkg_core::{
    check_schema_version, suggest_aliases, AliasSuggestion, EntityKey, EntityType, GraphSnapshot,
    PipelineConfig,
};

use super::{load_registry, open_store};

#[derive(Serialize)]
struct AuditReport {
    stats: GraphStats,
    orphans: Vec<EntityKey>,
    alias_suggestions: Vec<AliasSuggestion>,
}

pub async fn run(config: &PipelineConfig, alias_threshold: f64, json: bool) -> Result<()> {
    let registry = load_registry(config)?;
    let store = open_store(config).await?;
    let limit = config.store_timeout();
    check_schema_version(store.as_ref(), &registry, limit).await?;

    let stats = bounded(limit, store.stats()).await?;
    let orphans = GraphSnapshot::from_state(&bounded(limit, store.snapshot()).await?).orphans();

    let mut alias_suggestions = Vec::new();
    for entity_type in [EntityType::Agency, EntityType::Supplier, EntityType::Category] {
        let keys: Vec<String> = bounded(limit, store.entities_of_type(entity_type))
            .await?
            .into_iter()
            .map(|e| e.key.canonical_key)
            .collect();
        alias_suggestions.extend(suggest_aliases(entity_type, &keys, alias_threshold));
    }
    store.close().await;

    let report = AuditReport {
        stats,
        orphans,
        alias_suggestions,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &AuditReport) {
    let stats = &report.stats;
    println!("Chunks: {}", stats.chunks);
    println!("Entities: {}", stats.entities);
    for (entity_type, count) in &stats.entities_by_type {
        println!("  {entity_type}: {count}");
    }
    println!("Relations: {}", stats.relations);
    println!("Mentions: {}", stats.mentions);

    if report.orphans.is_empty() {
        println!("Every entity is mentioned by at least one chunk");
    } else {
        println!("Orphaned entities: {}", report.orphans.len());
        for key in &report.orphans {
            println!("  {key}");
        }
    }

    if !report.alias_suggestions.is_empty() {
        println!("Possible aliases:");
        for s in &report.alias_suggestions {
            println!(
                "  {} {:?} ~ {:?} ({:.3})",
                s.entity_type, s.key, s.candidate, s.similarity
            );
        }
    }
}

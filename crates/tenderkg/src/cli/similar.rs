use anyhow::{Context, Result};
use tenderkg_core::graph::GraphStore;
use tenderkg_core::{
    check_schema_version, CandidatePool, EntityType, Normalizer, PipelineConfig, RankWeights,
    SimilarityRanker,
};

use super::{load_registry, open_store};

pub async fn run(
    config: &PipelineConfig,
    tender: &str,
    limit: usize,
    category_bonus: Option<f64>,
    json: bool,
) -> Result<()> {
    let registry = load_registry(config)?;
    let key = Normalizer::new(&registry)
        .normalize(EntityType::Tender, tender)
        .context("Invalid tender number")?
        .key;

    let store = open_store(config).await?;
    check_schema_version(store.as_ref(), &registry, config.store_timeout()).await?;
    let graph: std::sync::Arc<dyn GraphStore> = store.clone();
    let weights = RankWeights {
        category_bonus,
        ..RankWeights::default()
    };
    let ranked = SimilarityRanker::new(graph)
        .with_weights(weights)
        .with_limit(limit)
        .with_timeout(config.store_timeout())
        .rank(&key.canonical_key, &CandidatePool::Graph)
        .await?;
    store.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&ranked)?);
        return Ok(());
    }

    if ranked.is_empty() {
        println!("No tenders share keywords or requirements with {}", key.canonical_key);
        return Ok(());
    }
    for (i, hit) in ranked.iter().enumerate() {
        let dims: Vec<&str> = hit
            .matched_dimensions
            .iter()
            .map(|d| d.as_str())
            .collect();
        let date = hit
            .award_date
            .map_or_else(|| "-".to_string(), |d| d.to_string());
        println!(
            "{:>3}. {}  score={:.3}  overlap={}  awarded={}  [{}]",
            i + 1,
            hit.tender_id,
            hit.score,
            hit.overlap_count,
            date,
            dims.join(", ")
        );
    }
    Ok(())
}

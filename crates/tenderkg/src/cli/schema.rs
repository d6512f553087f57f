use anyhow::Result;
use tenderkg_core::PipelineConfig;

use super::load_registry;

pub fn run(config: &PipelineConfig) -> Result<()> {
    let registry = load_registry(config)?;
    let origin = config
        .schema
        .as_ref()
        .map_or_else(|| "built-in".to_string(), |p| p.display().to_string());

    println!("Schema {} ({origin})", registry.version());
    println!("Confidence threshold: {}", registry.confidence_threshold());

    println!("Entities:");
    for spec in registry.entities() {
        let mut line = format!(
            "  {} [{}] fields: {}",
            spec.entity_type,
            spec.strategy.as_str(),
            spec.fields.join(", ")
        );
        if !spec.aliases.is_empty() {
            line.push_str(&format!(", {} alias keys", spec.aliases.len()));
        }
        if !spec.groups.is_empty() {
            let mut names: Vec<&str> = spec.groups.values().map(String::as_str).collect();
            names.sort_unstable();
            names.dedup();
            line.push_str(&format!(", {} groups", names.len()));
        }
        if let Some(max) = spec.max_per_chunk {
            line.push_str(&format!(", max {max} per chunk"));
        }
        println!("{line}");
    }

    println!("Rules: {}", registry.rules().len());

    println!("Relations:");
    for rel in registry.relations() {
        println!("  ({})-[{}]->({})", rel.source, rel.relation_type, rel.target);
    }
    Ok(())
}

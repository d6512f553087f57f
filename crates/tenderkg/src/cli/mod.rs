pub mod audit;
pub mod chunk;
pub mod import;
pub mod schema;
pub mod similar;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tenderkg_core::{PipelineConfig, SchemaRegistry, SqliteGraphStore};

#[derive(Parser)]
#[command(
    name = "tkg",
    about = "Procurement award records as a queryable knowledge graph",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Overrides for `TENDERKG_*` environment settings.
#[derive(Args, Clone, Default)]
pub struct GlobalArgs {
    /// Graph database file
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,
    /// Extraction schema document (JSON); built-in tender schema when omitted
    #[arg(long, global = true)]
    pub schema: Option<PathBuf>,
    /// Chunks merged concurrently
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Turn award records into tender-card chunks
    Chunk {
        /// Award records, one JSON object per line
        #[arg(long)]
        records: PathBuf,
        /// Where to write the chunks
        #[arg(long)]
        output: PathBuf,
        /// Source label stored on every chunk
        #[arg(long, default_value = "records")]
        source: String,
    },
    /// Extract and merge chunks into the graph
    Import {
        /// Chunks, one JSON object per line
        #[arg(long)]
        chunks: PathBuf,
        /// Print the full batch report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Rank tenders by shared keywords and requirements
    Similar {
        /// Reference tender number
        #[arg(long)]
        tender: String,
        /// Maximum number of results
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Count a shared category towards the score
        #[arg(long)]
        include_category: bool,
        /// Score added for a shared category
        #[arg(long, default_value_t = 0.5)]
        category_bonus: f64,
        #[arg(long)]
        json: bool,
    },
    /// Graph statistics, orphaned entities and alias suggestions
    Audit {
        /// Jaro-Winkler similarity at which two keys are reported
        #[arg(long, default_value_t = 0.92)]
        alias_threshold: f64,
        #[arg(long)]
        json: bool,
    },
    /// Validate a schema document and summarise it
    Schema,
}

impl GlobalArgs {
    /// Environment settings with command-line flags applied on top.
    pub fn config(&self) -> Result<PipelineConfig> {
        let mut config = PipelineConfig::from_env().context("Invalid TENDERKG_* settings")?;
        if let Some(db) = &self.db {
            config.database.clone_from(db);
        }
        if let Some(schema) = &self.schema {
            config.schema = Some(schema.clone());
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        config.validate()?;
        Ok(config)
    }
}

pub fn load_registry(config: &PipelineConfig) -> Result<Arc<SchemaRegistry>> {
    let registry = match &config.schema {
        Some(path) => SchemaRegistry::from_path(path)
            .with_context(|| format!("Failed to load schema {}", path.display()))?,
        None => SchemaRegistry::tender_default().context("Built-in schema is invalid")?,
    };
    Ok(Arc::new(registry))
}

pub async fn open_store(config: &PipelineConfig) -> Result<Arc<SqliteGraphStore>> {
    ensure_parent(&config.database)?;
    let store = SqliteGraphStore::open(&config.database, config.store_timeout())
        .await
        .with_context(|| format!("Cannot open graph at {}", config.database.display()))?;
    Ok(Arc::new(store))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Cannot create {}", parent.display()))?;
    }
    Ok(())
}

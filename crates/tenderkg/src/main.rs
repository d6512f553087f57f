use anyhow::Result;
use clap::Parser;

use tenderkg::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let global = cli.global;

    match cli.command {
        Commands::Chunk {
            records,
            output,
            source,
        } => tenderkg::cli::chunk::run(&records, &output, &source),
        Commands::Import { chunks, json } => {
            tenderkg::cli::import::run(&global.config()?, &chunks, json).await
        }
        Commands::Similar {
            tender,
            limit,
            include_category,
            category_bonus,
            json,
        } => {
            let bonus = include_category.then_some(category_bonus);
            tenderkg::cli::similar::run(&global.config()?, &tender, limit, bonus, json).await
        }
        Commands::Audit {
            alias_threshold,
            json,
        } => tenderkg::cli::audit::run(&global.config()?, alias_threshold, json).await,
        Commands::Schema => tenderkg::cli::schema::run(&global.config()?),
    }
}

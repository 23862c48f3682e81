//! docpilot ingest
//!
//! Scans a documentation tree, chunks it, embeds changed chunks, and
//! writes them to the vector index. Safe to re-run: unchanged content
//! is skipped, removed content is garbage-collected.

use clap::Parser;
use docpilot_common::{cache::RedisCache, config::AppConfig, db::DbPool, VERSION};
use docpilot_ingestion::IngestPipeline;
use docpilot_retrieval::{create_embedder, create_index, CachedEmbedder, Embedder};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Index a documentation source tree for retrieval
#[derive(Parser, Debug)]
#[command(name = "ingest", version, about)]
struct Cli {
    /// Root directory of the documentation sources
    source_root: PathBuf,

    /// Re-embed every chunk even when its content hash is unchanged
    #[arg(long)]
    force: bool,

    /// Print the run report as JSON instead of a summary line
    #[arg(long)]
    json: bool,

    /// Config file to load instead of the environment-based lookup
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::load()?,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));
    if config.observability.json_logging {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }

    info!("Starting docpilot ingest v{}", VERSION);

    let embedder = create_embedder(&config.embedding)?;
    let embedder = wrap_with_cache(embedder, &config).await;

    let pool = if config.index.backend == "pgvector" {
        Some(DbPool::new(&config.database).await?)
    } else {
        None
    };
    let index = create_index(&config, pool).await?;

    let pipeline = IngestPipeline::new(embedder, index, config.ingestion.clone());
    let report = pipeline.run(&cli.source_root, cli.force).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{} files scanned, {} chunks ({} written, {} skipped, {} deleted) in {} ms",
            report.files_scanned,
            report.chunks_total,
            report.chunks_written,
            report.chunks_skipped,
            report.chunks_deleted,
            report.duration_ms
        );
    }
    Ok(())
}

/// Reuse cached embeddings across runs when Redis is reachable; fall
/// back to the bare embedder otherwise.
async fn wrap_with_cache(embedder: Arc<dyn Embedder>, config: &AppConfig) -> Arc<dyn Embedder> {
    if !config.redis.enabled {
        return embedder;
    }
    match RedisCache::connect(&config.redis.url).await {
        Ok(cache) => Arc::new(CachedEmbedder::new(
            embedder,
            Arc::new(cache),
            Duration::from_secs(config.redis.embedding_ttl_secs),
        )),
        Err(e) => {
            warn!(error = %e, "Redis unavailable, running without the embedding cache");
            embedder
        }
    }
}

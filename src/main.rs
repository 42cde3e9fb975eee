//! Doctier cache node
//!
//! Runs one cache coordinator until interrupted: tier 2 sync and periodic
//! statistics run in the background, and the Prometheus text is logged on
//! each report interval.
//!
//! ```text
//! doctier --config cache.yaml [--redis-url redis://127.0.0.1/] [--bulk-dir /var/lib/doctier]
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use doctier::cache::{
    BulkStore, CacheConfig, CacheCoordinator, DistributedBackend, FileBulkStore,
    InMemoryBackend, InMemoryBulkStore,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Doctier - tiered document cache node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "DOCTIER_CONFIG")]
    config: Option<PathBuf>,

    /// Redis URL for the distributed tier (in-memory when unset)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Override the tier 2 key prefix
    #[arg(long, env = "DOCTIER_KEY_PREFIX")]
    key_prefix: Option<String>,

    /// Directory for the persistent bank (in-memory when unset)
    #[arg(long, env = "DOCTIER_BULK_DIR")]
    bulk_dir: Option<PathBuf>,

    /// Seconds between stats reports
    #[arg(long, env = "DOCTIER_REPORT_SECONDS", default_value = "60")]
    report_seconds: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => CacheConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CacheConfig::default(),
    };
    if let Some(prefix) = &args.key_prefix {
        config.distributed.key_prefix = prefix.clone();
    }

    info!("Starting doctier");
    info!("  Partitions: {:?}", config.tier1.partitions);
    info!("  Tier 1 capacity: {} bytes", config.tier1.capacity);
    info!("  Key prefix: {}", config.distributed.key_prefix);

    let backend = connect_backend(&args).await?;
    let bulk: Arc<dyn BulkStore> = match &args.bulk_dir {
        Some(dir) => {
            info!("  Bulk store: {}", dir.display());
            Arc::new(FileBulkStore::new(dir))
        }
        None => Arc::new(InMemoryBulkStore::new()),
    };

    let cache = CacheCoordinator::new(config, backend, bulk).context("building coordinator")?;
    cache.initialize().await?;

    let mut report = tokio::time::interval(Duration::from_secs(args.report_seconds.max(1)));
    report.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
            _ = report.tick() => {
                let stats = cache.stats().await;
                info!(
                    documents = stats.total_documents,
                    hit_ratio = stats.hit_ratio,
                    avg_response_ms = stats.avg_response_time_ms,
                    tier2_failures = stats.tier2_failures,
                    sync_conflicts = stats.sync_conflicts,
                    "Cache report"
                );
            }
        }
    }

    info!("Shutting down");
    cache.destroy().await?;
    info!("Shutdown complete");
    Ok(())
}

#[cfg(feature = "redis")]
async fn connect_backend(args: &Args) -> anyhow::Result<Arc<dyn DistributedBackend>> {
    match &args.redis_url {
        Some(url) => {
            let backend = doctier::cache::redis::RedisBackend::connect(url)
                .await
                .with_context(|| format!("connecting to {}", url))?;
            info!("  Distributed tier: redis");
            Ok(Arc::new(backend))
        }
        None => Ok(Arc::new(InMemoryBackend::new())),
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_backend(args: &Args) -> anyhow::Result<Arc<dyn DistributedBackend>> {
    if args.redis_url.is_some() {
        anyhow::bail!("built without the `redis` feature");
    }
    warn!("Distributed tier is in-memory; instances will not share state");
    Ok(Arc::new(InMemoryBackend::new()))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "redis=warn".parse() {
        filter = filter.add_directive(directive);
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

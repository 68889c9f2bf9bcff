//! Pipeline Runtime
//!
//! Orchestrates the ping pipeline:
//! - Initializes SQLite database with schema
//! - Builds the cache, sink, publisher and geography lookup
//! - Spawns the ingestion worker, the JSONL ping source, and the trip
//!   aggregator scheduler
//! - Shuts everything down on CTRL+C
//!
//! Usage:
//!   cargo run --release --bin pipeline_runtime
//!
//! Environment variables: see `PipelineConfig::from_env`.

use dotenv::dotenv;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tripflow::pipeline::{
    config::PipelineConfig,
    geography::{GeographyLookup, NoGeography, PolygonGeography},
    ingestion::{start_ping_ingestion, Delivery},
    reader::{forward_pings, PingTailReader, StartPosition},
    scheduler::start_trip_aggregator,
    CacheStore, EventIngestor, InMemoryCache, LogPublisher, NotificationPublisher,
    PersistenceSink, SqliteSink, TripAggregator,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::init();

    info!("🚀 Trip Pipeline Runtime");
    info!("   └─ Version: {}", env!("CARGO_PKG_VERSION"));

    let config = PipelineConfig::from_env();

    info!("✅ Configuration loaded");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Schema dir: {}", config.schema_dir);
    info!("   ├─ Channel buffer: {} pings", config.channel_buffer);
    info!("   ├─ Aggregate interval: {}ms", config.aggregate_interval_ms);
    info!("   ├─ Quiescence window: {}ms", config.quiescence_window_ms);
    info!("   ├─ Max ping distance: {}m", config.max_ping_distance_m);
    info!("   ├─ Side-effect timeout: {}ms", config.side_effect_timeout_ms);
    info!(
        "   ├─ Geography: {}",
        config.geography_path.as_deref().unwrap_or("(none)")
    );
    info!(
        "   └─ Ping source: {}",
        config.ping_source_path.as_deref().unwrap_or("(none)")
    );

    info!("🔧 Initializing database...");
    let sink: Arc<dyn PersistenceSink> =
        Arc::new(SqliteSink::open_with_schema(&config.db_path, &config.schema_dir)?);
    info!("✅ Database initialized");

    let cache = Arc::new(InMemoryCache::new());
    cache.initialize().await?;
    let cache: Arc<dyn CacheStore> = cache;
    info!("✅ Cache initialized");

    let geography: Arc<dyn GeographyLookup> = match &config.geography_path {
        Some(path) => {
            let geography = PolygonGeography::from_file(path)?;
            info!("✅ Loaded {} geographies from {}", geography.len(), path);
            Arc::new(geography)
        }
        None => {
            warn!("⚠️  No GEOGRAPHY_PATH set, pings will not be annotated");
            Arc::new(NoGeography)
        }
    };
    let publisher: Arc<dyn NotificationPublisher> = Arc::new(LogPublisher);

    let ingestor = Arc::new(EventIngestor::new(
        cache.clone(),
        sink.clone(),
        publisher.clone(),
        geography,
        config.side_effect_timeout(),
    ));
    let aggregator = Arc::new(TripAggregator::new(
        cache.clone(),
        sink,
        publisher,
        config.aggregator_settings(),
    ));

    let (tx, rx) = mpsc::channel::<Delivery>(config.channel_buffer);
    info!("✅ Ping channel created (buffer: {})", config.channel_buffer);

    info!("🚀 Spawning background tasks...");

    let ingestion_task = tokio::spawn(start_ping_ingestion(rx, ingestor));
    info!("   ├─ ✅ Ingestion worker spawned");

    let (source_shutdown_tx, source_shutdown_rx) = watch::channel(false);
    let source_task = match &config.ping_source_path {
        Some(path) => {
            let reader = PingTailReader::new(PathBuf::from(path), StartPosition::End);
            let task = tokio::spawn(forward_pings(reader, tx.clone(), source_shutdown_rx));
            info!("   ├─ ✅ Ping source tailing {}", path);
            Some(task)
        }
        None => {
            info!("   ├─ No ping source configured");
            None
        }
    };

    let (scheduler, scheduler_task) =
        start_trip_aggregator(aggregator, config.aggregate_interval_ms);
    info!("   └─ ✅ Trip aggregator spawned");

    info!("");
    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    // The worker drains only once every sender is gone, the source's included
    let _ = source_shutdown_tx.send(true);
    if let Some(task) = source_task {
        match task.await {
            Ok(lines) => info!("   ├─ Ping source forwarded {} lines", lines),
            Err(e) => error!("❌ Ping source task failed: {}", e),
        }
    }
    drop(tx);
    scheduler.shutdown();

    match ingestion_task.await {
        Ok(stats) => info!("   ├─ Ingestion processed {} pings", stats.received),
        Err(e) => error!("❌ Ingestion task failed: {}", e),
    }
    match scheduler_task.await {
        Ok(passes) => info!("   ├─ Aggregator ran {} passes", passes),
        Err(e) => error!("❌ Aggregator task failed: {}", e),
    }

    cache.shutdown().await?;
    info!("✅ Pipeline runtime stopped");
    Ok(())
}

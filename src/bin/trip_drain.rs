//! Trip Drain
//!
//! One-shot replay: ingests every ping of a JSONL file, then runs a single
//! aggregation pass and reports what was finalized.
//!
//! Usage:
//!   cargo run --release --bin trip_drain -- pings.jsonl
//!
//! The file may also come from PING_SOURCE_PATH. DRAIN_NOW_MS overrides the
//! pass's notion of "now" (epoch ms), which lets a replay of old pings clear
//! the quiescence window.

use dotenv::dotenv;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tripflow::pipeline::{
    config::PipelineConfig,
    geography::{GeographyLookup, NoGeography, PolygonGeography},
    reader::read_ping_file,
    CacheStore, Disposition, EventIngestor, InMemoryCache, LogPublisher, NotificationPublisher,
    PersistenceSink, PipelineError, SqliteSink, TripAggregator,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::init();

    let config = PipelineConfig::from_env();

    let path = std::env::args()
        .nth(1)
        .or_else(|| config.ping_source_path.clone())
        .map(PathBuf::from)
        .ok_or("usage: trip_drain <pings.jsonl> (or set PING_SOURCE_PATH)")?;

    let now_override = std::env::var("DRAIN_NOW_MS")
        .ok()
        .and_then(|s| s.parse::<i64>().ok());

    info!("🚀 Trip Drain");
    info!("   ├─ Pings: {}", path.display());
    info!("   ├─ Database: {}", config.db_path);
    info!(
        "   └─ Now: {}",
        now_override.map_or_else(|| "wall clock".to_string(), |ms| ms.to_string())
    );

    let sink: Arc<dyn PersistenceSink> =
        Arc::new(SqliteSink::open_with_schema(&config.db_path, &config.schema_dir)?);
    let cache = Arc::new(InMemoryCache::new());
    cache.initialize().await?;
    let cache: Arc<dyn CacheStore> = cache;

    let geography: Arc<dyn GeographyLookup> = match &config.geography_path {
        Some(path) => Arc::new(PolygonGeography::from_file(path)?),
        None => Arc::new(NoGeography),
    };
    let publisher: Arc<dyn NotificationPublisher> = Arc::new(LogPublisher);

    let ingestor = EventIngestor::new(
        cache.clone(),
        sink.clone(),
        publisher.clone(),
        geography,
        config.side_effect_timeout(),
    );

    let lines = read_ping_file(&path).await?;
    let (mut applied, mut skipped, mut rejected) = (0u64, 0u64, 0u64);
    for line in &lines {
        match ingestor.ingest_json(line).await {
            Ok(outcome) => match outcome.disposition {
                Disposition::Applied | Disposition::Decommissioned => applied += 1,
                Disposition::Stale | Disposition::Duplicate => skipped += 1,
            },
            Err(PipelineError::Validation(msg)) => {
                warn!("⚠️  Skipping invalid ping: {}", msg);
                rejected += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!("✅ Ingested {} pings", lines.len());
    info!("   ├─ Applied: {}", applied);
    info!("   ├─ Stale/duplicate: {}", skipped);
    info!("   └─ Rejected: {}", rejected);

    let aggregator =
        TripAggregator::new(cache.clone(), sink, publisher, config.aggregator_settings());
    let report = match now_override {
        Some(now) => aggregator.run_pass_at(now).await,
        None => aggregator.run_pass().await,
    };

    info!("✅ Drain complete");
    info!("   ├─ Devices scanned: {}", report.devices_scanned);
    info!("   ├─ Trips aggregated: {}", report.trips_aggregated);
    info!("   ├─ Still quiescing: {}", report.trips_quiescing);
    info!("   ├─ Incomplete: {}", report.trips_incomplete);
    info!("   ├─ Retained: {}", report.trips_retained);
    info!("   └─ Failed: {}", report.trips_failed);

    cache.shutdown().await?;
    Ok(())
}

//! Ingestion worker - async channel processor for inbound pings
//!
//! The transport side pushes [`Delivery`] messages into a bounded mpsc
//! channel. Each delivery is ingested and answered on its oneshot with
//! [`Reply::Ack`] or [`Reply::Nack`]; redelivery policy belongs to the
//! transport.

use super::error::PipelineError;
use super::ingestor::{Disposition, EventIngestor};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Duration, MissedTickBehavior};

const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Answer to the transport for one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack,
    /// `retryable: false` means the ping can never succeed and should be dropped
    Nack { retryable: bool },
}

/// One inbound message plus the channel its reply goes to
#[derive(Debug)]
pub struct Delivery {
    pub payload: String,
    pub reply: Option<oneshot::Sender<Reply>>,
}

impl Delivery {
    /// Delivery whose reply the caller awaits
    pub fn new(payload: impl Into<String>) -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                payload: payload.into(),
                reply: Some(tx),
            },
            rx,
        )
    }

    /// Delivery from a source that does not track acknowledgements
    pub fn unacknowledged(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            reply: None,
        }
    }
}

/// Counters for the lifetime of one worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestionStats {
    pub received: u64,
    pub applied: u64,
    pub stale: u64,
    pub duplicates: u64,
    pub decommissioned: u64,
    /// Dropped as invalid
    pub rejected: u64,
    /// Failed with a retryable error
    pub failed: u64,
}

impl IngestionStats {
    fn record(&mut self, result: &Result<Disposition, PipelineError>) {
        self.received += 1;
        match result {
            Ok(Disposition::Applied) => self.applied += 1,
            Ok(Disposition::Stale) => self.stale += 1,
            Ok(Disposition::Duplicate) => self.duplicates += 1,
            Ok(Disposition::Decommissioned) => self.decommissioned += 1,
            Err(e) if e.is_retryable() => self.failed += 1,
            Err(_) => self.rejected += 1,
        }
    }
}

fn reply_for(result: &Result<Disposition, PipelineError>) -> Reply {
    match result {
        Ok(_) => Reply::Ack,
        Err(e) => Reply::Nack {
            retryable: e.is_retryable(),
        },
    }
}

/// Start ping ingestion from the delivery channel
///
/// Runs until the channel is closed and every queued delivery is processed.
///
/// Arguments:
/// - `rx`: Receiver end of the delivery channel
/// - `ingestor`: Shared ingestor
pub async fn start_ping_ingestion(
    mut rx: mpsc::Receiver<Delivery>,
    ingestor: Arc<EventIngestor>,
) -> IngestionStats {
    log::info!("🚀 Starting ping ingestion");
    log::info!("   └─ Waiting for pings...");

    let mut stats = IngestionStats::default();
    let mut stats_timer = interval(STATS_INTERVAL);
    stats_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut window_count = 0u64;
    let mut window_start = std::time::Instant::now();

    loop {
        tokio::select! {
            delivery = rx.recv() => {
                let Some(delivery) = delivery else {
                    log::warn!("⚠️  Ping channel closed, stopping ingestion");
                    break;
                };

                let result = ingestor
                    .ingest_json(&delivery.payload)
                    .await
                    .map(|outcome| outcome.disposition);

                match &result {
                    Err(PipelineError::Validation(msg)) => {
                        log::warn!("⚠️  Dropping invalid ping: {}", msg);
                    }
                    Err(e) if e.is_retryable() => {
                        log::error!("❌ Ping ingestion failed (retryable): {}", e);
                    }
                    Err(e) => {
                        log::warn!("⚠️  Ping ingestion failed: {}", e);
                    }
                    Ok(_) => {}
                }

                stats.record(&result);
                window_count += 1;

                if let Some(reply) = delivery.reply {
                    // Receiver gone means the transport stopped waiting
                    let _ = reply.send(reply_for(&result));
                }
            }

            _ = stats_timer.tick() => {
                let elapsed = window_start.elapsed().as_secs_f64();
                if window_count > 0 && elapsed > 0.0 {
                    log::info!(
                        "📊 Ingestion rate: {:.1} pings/sec (total: {}) | queued: {}",
                        window_count as f64 / elapsed,
                        stats.received,
                        rx.len()
                    );
                }
                window_start = std::time::Instant::now();
                window_count = 0;
            }
        }
    }

    log::info!(
        "✅ Ping ingestion stopped: {} received, {} applied, {} stale, {} duplicate, {} rejected, {} failed",
        stats.received,
        stats.applied,
        stats.stale,
        stats.duplicates,
        stats.rejected,
        stats.failed
    );

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::cache::{CacheStore, InMemoryCache};
    use crate::pipeline::db::{PersistenceSink, SinkRecord};
    use crate::pipeline::error::Result;
    use crate::pipeline::geography::NoGeography;
    use crate::pipeline::notify::LogPublisher;
    use async_trait::async_trait;

    struct NullSink;

    #[async_trait]
    impl PersistenceSink for NullSink {
        async fn insert(&self, _record: SinkRecord) -> Result<()> {
            Ok(())
        }
    }

    async fn ingestor(cache: Arc<InMemoryCache>) -> Arc<EventIngestor> {
        Arc::new(EventIngestor::new(
            cache,
            Arc::new(NullSink),
            Arc::new(LogPublisher),
            Arc::new(NoGeography),
            Duration::from_millis(100),
        ))
    }

    fn telemetry_json(ts: i64) -> String {
        serde_json::json!({
            "type": "mds.telemetry",
            "data": {
                "device_id": "dev-1",
                "provider_id": "prov-1",
                "timestamp": ts,
                "gps": { "lat": 34.0, "lng": -118.0 }
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_worker_acks_and_nacks() {
        let cache = Arc::new(InMemoryCache::new());
        cache.initialize().await.unwrap();
        let (tx, rx) = mpsc::channel(16);
        let worker = tokio::spawn(start_ping_ingestion(rx, ingestor(cache).await));

        let (ok, ok_reply) = Delivery::new(telemetry_json(1000));
        let (dup, dup_reply) = Delivery::new(telemetry_json(1000));
        let (bad, bad_reply) = Delivery::new("{\"type\":\"telemetry\"}");
        tx.send(ok).await.unwrap();
        tx.send(dup).await.unwrap();
        tx.send(bad).await.unwrap();
        tx.send(Delivery::unacknowledged(telemetry_json(2000))).await.unwrap();

        assert_eq!(ok_reply.await.unwrap(), Reply::Ack);
        assert_eq!(dup_reply.await.unwrap(), Reply::Ack);
        assert_eq!(bad_reply.await.unwrap(), Reply::Nack { retryable: false });

        drop(tx);
        let stats = worker.await.unwrap();
        assert_eq!(stats.received, 4);
        assert_eq!(stats.applied, 2);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.rejected, 1);
    }

    #[tokio::test]
    async fn test_store_outage_nacks_retryable() {
        let cache = Arc::new(InMemoryCache::new());
        cache.initialize().await.unwrap();
        let ingestor = ingestor(cache.clone()).await;
        cache.shutdown().await.unwrap();

        let (tx, rx) = mpsc::channel(4);
        let worker = tokio::spawn(start_ping_ingestion(rx, ingestor));

        let (delivery, reply) = Delivery::new(telemetry_json(1000));
        tx.send(delivery).await.unwrap();
        assert_eq!(reply.await.unwrap(), Reply::Nack { retryable: true });

        drop(tx);
        assert_eq!(worker.await.unwrap().failed, 1);
    }
}

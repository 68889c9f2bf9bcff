//! Trip aggregator scheduler
//!
//! Runs an aggregation pass on a fixed interval and on demand. A drain
//! request carries a oneshot that receives that pass's report. Passes never
//! overlap: the loop runs them one at a time.

use super::aggregator::{AggregationReport, TripAggregator};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Request for an immediate aggregation pass
#[derive(Debug)]
pub struct DrainRequest {
    pub reply: oneshot::Sender<AggregationReport>,
}

/// Handle for talking to a running scheduler
#[derive(Clone)]
pub struct SchedulerHandle {
    drain_tx: mpsc::Sender<DrainRequest>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl SchedulerHandle {
    /// Run a pass now and wait for its report. `None` if the scheduler stopped.
    pub async fn drain(&self) -> Option<AggregationReport> {
        let (reply, rx) = oneshot::channel();
        self.drain_tx.send(DrainRequest { reply }).await.ok()?;
        rx.await.ok()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Spawn the aggregator loop. Returns a handle and the task's join handle,
/// which resolves to the number of passes run.
pub fn start_trip_aggregator(
    aggregator: Arc<TripAggregator>,
    interval_ms: u64,
) -> (SchedulerHandle, tokio::task::JoinHandle<u64>) {
    let (drain_tx, drain_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(scheduler_task(aggregator, interval_ms, drain_rx, shutdown_rx));

    (
        SchedulerHandle {
            drain_tx,
            shutdown_tx: Arc::new(shutdown_tx),
        },
        task,
    )
}

/// Aggregator loop
///
/// Arguments:
/// - `aggregator`: Shared TripAggregator
/// - `interval_ms`: Pass interval in milliseconds
/// - `drain_rx`: On-demand pass requests
/// - `shutdown_rx`: Flips to `true` to stop the loop
///
/// Runs until shutdown is signalled or every handle is dropped.
pub async fn scheduler_task(
    aggregator: Arc<TripAggregator>,
    interval_ms: u64,
    mut drain_rx: mpsc::Receiver<DrainRequest>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> u64 {
    log::info!("⏰ Starting trip aggregator (interval: {}ms)", interval_ms);

    let mut timer = interval(Duration::from_millis(interval_ms.max(1)));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so startup does not race ingestion
    timer.tick().await;

    let mut passes = 0u64;

    loop {
        tokio::select! {
            _ = timer.tick() => {
                aggregator.run_pass().await;
                passes += 1;
            }

            request = drain_rx.recv() => {
                let Some(request) = request else {
                    log::info!("All scheduler handles dropped");
                    break;
                };
                log::info!("🔄 Drain requested");
                let report = aggregator.run_pass().await;
                passes += 1;
                let _ = request.reply.send(report);
            }

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    log::info!("✅ Trip aggregator stopped after {} passes", passes);
    passes
}

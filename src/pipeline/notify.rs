//! Processed-notification publishing
//!
//! Notifications are fire-and-forget from the pipeline's point of view: the
//! caller bounds each publish with a timeout and only logs the outcome.

use super::error::Result;
use async_trait::async_trait;

pub const DEVICE_PROCESSED: &str = "device.processed";
pub const TRIP_PROCESSED: &str = "trip.processed";

#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    async fn publish(&self, event_type: &str, payload: serde_json::Value) -> Result<()>;
}

/// Publisher that writes notifications to the log
#[derive(Debug, Default, Clone)]
pub struct LogPublisher;

#[async_trait]
impl NotificationPublisher for LogPublisher {
    async fn publish(&self, event_type: &str, payload: serde_json::Value) -> Result<()> {
        log::debug!("📣 {} {}", event_type, payload);
        Ok(())
    }
}

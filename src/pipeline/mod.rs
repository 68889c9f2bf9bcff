//! # Ping ingestion and trip aggregation pipeline
//!
//! Vehicle event and telemetry pings from many providers flow through one
//! pipeline:
//!
//! ```text
//! transport ─▶ ingestion worker ─▶ EventIngestor ─┬─▶ device state store
//!                                                 ├─▶ trip event log
//!                                                 └─▶ trip telemetry buffer
//!                                                          │ (interval / drain)
//!                                                          ▼
//!                                   TripAggregator ─▶ persistence sink
//! ```
//!
//! ## Guarantees
//!
//! - Delivery is at-least-once; exact redeliveries are no-ops.
//! - A device's cached state never moves backwards in time.
//! - A trip is finalized only after its last boundary event is older than the
//!   quiescence window (24h by default), so late telemetry still lands.
//! - Finalizing a trip is all-or-nothing: persist, then evict. A failure
//!   leaves the trip in the cache for the next pass.
//!
//! All state is partitioned by (provider, device); there is no cross-device
//! locking. Concurrent writers are reconciled with compare-and-set on the
//! cache.
//!
//! ## Module Organization
//!
//! - `types` - Pings, device state, trip records
//! - `state` - Vehicle state machine and ordering rules
//! - `cache` - Cache trait and in-memory implementation
//! - `device_state` - Device State Store
//! - `trip_log` - Trip Event Log and Telemetry Buffer
//! - `ingestor` - Per-ping Event Ingestor
//! - `ingestion` - Channel worker feeding the ingestor
//! - `binning` - Segment binning and trip metrics
//! - `aggregator` - Trip Aggregator pass
//! - `scheduler` - Interval / drain loop for the aggregator
//! - `db` - SQLite persistence sink
//! - `geography` - Geofence annotation
//! - `notify` - Processed notifications
//! - `reader` - JSONL ping source
//! - `config` - Environment configuration

pub mod aggregator;
pub mod binning;
pub mod cache;
pub mod config;
pub mod db;
pub mod device_state;
pub mod error;
pub mod geo_utils;
pub mod geography;
pub mod ingestion;
pub mod ingestor;
pub mod notify;
pub mod reader;
pub mod scheduler;
pub mod state;
pub mod trip_log;
pub mod types;

// Re-export commonly used types
pub use aggregator::{AggregationReport, AggregatorSettings, TripAggregator};
pub use cache::{CacheStore, InMemoryCache};
pub use config::PipelineConfig;
pub use db::{PersistenceSink, SinkRecord, SqliteSink};
pub use device_state::{DeviceStateStore, PutOutcome};
pub use error::{PipelineError, Result};
pub use geography::{GeographyLookup, NoGeography, PolygonGeography};
pub use ingestion::{start_ping_ingestion, Delivery, Reply};
pub use ingestor::{Disposition, EventIngestor, IngestOutcome, SideEffectReport};
pub use notify::{LogPublisher, NotificationPublisher};
pub use scheduler::{start_trip_aggregator, SchedulerHandle};
pub use trip_log::{DeviceKey, TelemetryBuffer, TripEventLog};
pub use types::{CompletedTrip, DeviceState, Ping, TripBoundaryEvent};

//! tripflow: micromobility ping ingestion and trip aggregation.
//!
//! Vehicle event and telemetry pings from many providers flow through the
//! [`pipeline::ingestor::EventIngestor`], which keeps per-device state and
//! per-trip logs in a hash-of-hashes cache. The
//! [`pipeline::aggregator::TripAggregator`] periodically finalizes trips whose
//! last boundary event has aged past the quiescence window and writes them to
//! the persistence sink.

pub mod pipeline;

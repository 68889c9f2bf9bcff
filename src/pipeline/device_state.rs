//! Device State Store
//!
//! Keeps one live [`DeviceState`] per device in the `device:state` hash, a
//! `device:updated` sorted set (device id scored by timestamp) for
//! "changed since" queries, and a `device:locations` geo set.
//!
//! Writes are compare-and-set against the cached JSON, so two pings for the
//! same device racing through different workers cannot regress the state.
//! Store failures are returned to the caller untouched.

use super::cache::CacheStore;
use super::error::{PipelineError, Result};
use super::state::supersedes;
use super::types::{DeviceState, Timestamp};
use std::sync::Arc;

pub const DEVICE_STATE_KEY: &str = "device:state";
pub const DEVICE_UPDATED_KEY: &str = "device:updated";
pub const DEVICE_LOCATIONS_KEY: &str = "device:locations";

/// Attempts before a contended compare-and-set gives up
const MAX_CAS_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// State written and indexes updated
    Accepted,
    /// Cached state is newer (or wins the tie); nothing written
    Stale,
}

#[derive(Clone)]
pub struct DeviceStateStore {
    cache: Arc<dyn CacheStore>,
}

impl DeviceStateStore {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    pub async fn get(&self, device_id: &str) -> Result<Option<DeviceState>> {
        match self.cache.hget(DEVICE_STATE_KEY, device_id).await? {
            Some(json) => Ok(Some(decode(device_id, &json)?)),
            None => Ok(None),
        }
    }

    /// Write `state` if it supersedes the cached one.
    pub async fn put(&self, state: &DeviceState) -> Result<PutOutcome> {
        let encoded = serde_json::to_string(state)
            .map_err(|e| PipelineError::Validation(e.to_string()))?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current_json = self.cache.hget(DEVICE_STATE_KEY, &state.device_id).await?;

            if let Some(json) = &current_json {
                let current = decode(&state.device_id, json)?;
                if !supersedes(state, &current) {
                    return Ok(PutOutcome::Stale);
                }
            }

            let written = self
                .cache
                .hset_if(
                    DEVICE_STATE_KEY,
                    &state.device_id,
                    current_json.as_deref(),
                    &encoded,
                )
                .await?;

            if written {
                self.reindex(&state.device_id).await?;
                return Ok(PutOutcome::Accepted);
            }

            log::debug!(
                "Device {} state changed concurrently, retrying write",
                state.device_id
            );
        }

        Err(PipelineError::TransientStore(format!(
            "device {} state write contended after {} attempts",
            state.device_id, MAX_CAS_ATTEMPTS
        )))
    }

    /// Remove a decommissioned device from the store and both indexes.
    pub async fn delete(&self, device_id: &str) -> Result<bool> {
        let existed = self.cache.hdel(DEVICE_STATE_KEY, &[device_id]).await? > 0;
        self.cache.zrem(DEVICE_UPDATED_KEY, device_id).await?;
        self.cache.geo_remove(DEVICE_LOCATIONS_KEY, device_id).await?;
        Ok(existed)
    }

    pub async fn geo_add(&self, device_id: &str, lat: f64, lng: f64) -> Result<()> {
        self.cache
            .geo_add(DEVICE_LOCATIONS_KEY, device_id, lat, lng)
            .await
    }

    /// Devices whose latest accepted ping is at or after `since`
    pub async fn changed_since(&self, since: Timestamp) -> Result<Vec<DeviceState>> {
        let ids = self
            .cache
            .zrange_by_score(DEVICE_UPDATED_KEY, since as f64, f64::INFINITY)
            .await?;

        let mut states = Vec::with_capacity(ids.len());
        for id in ids {
            // Index entries can outlive a concurrently deleted state
            if let Some(state) = self.get(&id).await? {
                states.push(state);
            }
        }
        Ok(states)
    }

    /// Device ids last seen within `radius_m` meters, nearest first
    pub async fn near(&self, lat: f64, lng: f64, radius_m: f64) -> Result<Vec<String>> {
        self.cache
            .geo_radius(DEVICE_LOCATIONS_KEY, lat, lng, radius_m)
            .await
    }

    /// Point both indexes at whatever state is cached now.
    ///
    /// Runs after every accepted write. A writer re-reads after indexing and
    /// repeats if the state moved underneath it, so when puts finish out of
    /// order the last one to finish still leaves the newest state indexed.
    async fn reindex(&self, device_id: &str) -> Result<()> {
        let mut cached = self.cache.hget(DEVICE_STATE_KEY, device_id).await?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            // Deleted concurrently; the decommission cleared the indexes
            let Some(json) = cached else {
                return Ok(());
            };
            let state = decode(device_id, &json)?;

            self.cache
                .zadd(DEVICE_UPDATED_KEY, device_id, state.timestamp as f64)
                .await?;
            if let Some(gps) = &state.gps {
                self.geo_add(device_id, gps.lat, gps.lng).await?;
            }

            let latest = self.cache.hget(DEVICE_STATE_KEY, device_id).await?;
            if latest.as_deref() == Some(json.as_str()) {
                return Ok(());
            }
            cached = latest;
        }

        log::warn!(
            "⚠️  Device {} state kept changing while indexing, leaving it to the next writer",
            device_id
        );
        Ok(())
    }
}

fn decode(device_id: &str, json: &str) -> Result<DeviceState> {
    serde_json::from_str(json).map_err(|e| {
        PipelineError::TransientStore(format!("corrupt state for device {}: {}", device_id, e))
    })
}

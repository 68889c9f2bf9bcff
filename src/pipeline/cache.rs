//! Cache storage abstraction
//!
//! Hash-of-hashes semantics (`hget`/`hset`/`hdel`/`hgetall`) plus a sorted
//! set and a geo set, modeled on a Redis-style key-value store. Each call is
//! atomic on its key. The conditional writes (`hset_if`, `hdel_if`) compare
//! the field's current value so read-modify-write cycles never overwrite a
//! concurrent change.
//!
//! One store is constructed at process start, initialized explicitly, and
//! handed to the ingestor and aggregator as `Arc<dyn CacheStore>`.

use super::error::{PipelineError, Result};
use super::geo_utils::haversine_m;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Open connections / mark the store ready. Must be called before use.
    async fn initialize(&self) -> Result<()>;

    /// Release resources. Later calls fail with `TransientStore`.
    async fn shutdown(&self) -> Result<()>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Set `field` only if its current value equals `expected`
    /// (`None` = field must be absent). Returns whether the write happened.
    async fn hset_if(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool>;

    /// Delete fields, returning how many existed. An emptied hash is removed.
    async fn hdel(&self, key: &str, fields: &[&str]) -> Result<usize>;

    /// Delete `field` only if its current value equals `expected`.
    async fn hdel_if(&self, key: &str, field: &str, expected: &str) -> Result<bool>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn hlen(&self, key: &str) -> Result<usize>;

    /// Delete a whole key of any type
    async fn del(&self, key: &str) -> Result<bool>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;

    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    /// Members with `min <= score <= max`, ascending by score
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>>;

    async fn geo_add(&self, key: &str, member: &str, lat: f64, lng: f64) -> Result<()>;

    async fn geo_remove(&self, key: &str, member: &str) -> Result<bool>;

    /// Members within `radius_m` meters of the point, nearest first
    async fn geo_radius(&self, key: &str, lat: f64, lng: f64, radius_m: f64) -> Result<Vec<String>>;
}

#[derive(Debug, Default)]
struct CacheData {
    hashes: HashMap<String, HashMap<String, String>>,
    sorted: HashMap<String, HashMap<String, f64>>,
    geo: HashMap<String, HashMap<String, (f64, f64)>>,
}

/// In-process [`CacheStore`]
///
/// A single mutex guards all keys; every trait call is one critical section,
/// which gives the same per-call atomicity a networked store provides.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    data: Mutex<CacheData>,
    ready: AtomicBool,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_data<T>(&self, f: impl FnOnce(&mut CacheData) -> T) -> Result<T> {
        if !self.ready.load(Ordering::Acquire) {
            return Err(PipelineError::TransientStore(
                "cache is not initialized".to_string(),
            ));
        }
        let mut data = self
            .data
            .lock()
            .map_err(|_| PipelineError::TransientStore("cache lock poisoned".to_string()))?;
        Ok(f(&mut *data))
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn initialize(&self) -> Result<()> {
        self.ready.store(true, Ordering::Release);
        log::debug!("In-memory cache initialized");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.ready.store(false, Ordering::Release);
        log::debug!("In-memory cache shut down");
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.with_data(|d| d.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.with_data(|d| {
            d.hashes
                .entry(key.to_string())
                .or_default()
                .insert(field.to_string(), value.to_string());
        })
    }

    async fn hset_if(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool> {
        self.with_data(|d| {
            let current = d.hashes.get(key).and_then(|h| h.get(field)).map(String::as_str);
            if current != expected {
                return false;
            }
            d.hashes
                .entry(key.to_string())
                .or_default()
                .insert(field.to_string(), value.to_string());
            true
        })
    }

    async fn hdel(&self, key: &str, fields: &[&str]) -> Result<usize> {
        self.with_data(|d| {
            let Some(hash) = d.hashes.get_mut(key) else {
                return 0;
            };
            let removed = fields.iter().filter(|f| hash.remove(**f).is_some()).count();
            if hash.is_empty() {
                d.hashes.remove(key);
            }
            removed
        })
    }

    async fn hdel_if(&self, key: &str, field: &str, expected: &str) -> Result<bool> {
        self.with_data(|d| {
            let Some(hash) = d.hashes.get_mut(key) else {
                return false;
            };
            if hash.get(field).map(String::as_str) != Some(expected) {
                return false;
            }
            hash.remove(field);
            if hash.is_empty() {
                d.hashes.remove(key);
            }
            true
        })
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.with_data(|d| d.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hlen(&self, key: &str) -> Result<usize> {
        self.with_data(|d| d.hashes.get(key).map_or(0, HashMap::len))
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.with_data(|d| {
            let hash = d.hashes.remove(key).is_some();
            let sorted = d.sorted.remove(key).is_some();
            let geo = d.geo.remove(key).is_some();
            hash || sorted || geo
        })
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.with_data(|d| {
            d.sorted
                .entry(key.to_string())
                .or_default()
                .insert(member.to_string(), score);
        })
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        self.with_data(|d| {
            let Some(set) = d.sorted.get_mut(key) else {
                return false;
            };
            let removed = set.remove(member).is_some();
            if set.is_empty() {
                d.sorted.remove(key);
            }
            removed
        })
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        self.with_data(|d| {
            let Some(set) = d.sorted.get(key) else {
                return Vec::new();
            };
            let mut members: Vec<(&String, f64)> = set
                .iter()
                .filter(|(_, score)| **score >= min && **score <= max)
                .map(|(m, s)| (m, *s))
                .collect();
            members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
            members.into_iter().map(|(m, _)| m.clone()).collect()
        })
    }

    async fn geo_add(&self, key: &str, member: &str, lat: f64, lng: f64) -> Result<()> {
        self.with_data(|d| {
            d.geo
                .entry(key.to_string())
                .or_default()
                .insert(member.to_string(), (lat, lng));
        })
    }

    async fn geo_remove(&self, key: &str, member: &str) -> Result<bool> {
        self.with_data(|d| {
            let Some(set) = d.geo.get_mut(key) else {
                return false;
            };
            let removed = set.remove(member).is_some();
            if set.is_empty() {
                d.geo.remove(key);
            }
            removed
        })
    }

    async fn geo_radius(
        &self,
        key: &str,
        lat: f64,
        lng: f64,
        radius_m: f64,
    ) -> Result<Vec<String>> {
        self.with_data(|d| {
            let Some(set) = d.geo.get(key) else {
                return Vec::new();
            };
            let mut hits: Vec<(&String, f64)> = set
                .iter()
                .map(|(m, (mlat, mlng))| (m, haversine_m(lat, lng, *mlat, *mlng)))
                .filter(|(_, dist)| *dist <= radius_m)
                .collect();
            hits.sort_by(|a, b| a.1.total_cmp(&b.1));
            hits.into_iter().map(|(m, _)| m.clone()).collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ready_cache() -> InMemoryCache {
        let cache = InMemoryCache::new();
        cache.initialize().await.unwrap();
        cache
    }

    #[tokio::test]
    async fn test_uninitialized_cache_is_unavailable() {
        let cache = InMemoryCache::new();
        let err = cache.hget("k", "f").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_shutdown_makes_cache_unavailable() {
        let cache = ready_cache().await;
        cache.hset("k", "f", "v").await.unwrap();
        cache.shutdown().await.unwrap();
        assert!(matches!(
            cache.hset("k", "f", "v2").await,
            Err(PipelineError::TransientStore(_))
        ));
    }

    #[tokio::test]
    async fn test_hash_roundtrip_and_empty_hash_removed() {
        let cache = ready_cache().await;
        cache.hset("device:p:d:trips", "t1", "[]").await.unwrap();
        cache.hset("device:p:d:trips", "t2", "[1]").await.unwrap();

        assert_eq!(cache.hlen("device:p:d:trips").await.unwrap(), 2);
        assert_eq!(
            cache.hget("device:p:d:trips", "t2").await.unwrap().as_deref(),
            Some("[1]")
        );

        assert_eq!(cache.hdel("device:p:d:trips", &["t1", "missing"]).await.unwrap(), 1);
        assert_eq!(cache.hdel("device:p:d:trips", &["t2"]).await.unwrap(), 1);
        assert!(cache.hgetall("device:p:d:trips").await.unwrap().is_empty());
        assert!(!cache.del("device:p:d:trips").await.unwrap());
    }

    #[tokio::test]
    async fn test_conditional_set_and_delete() {
        let cache = ready_cache().await;

        assert!(cache.hset_if("k", "f", None, "v1").await.unwrap());
        assert!(!cache.hset_if("k", "f", None, "v2").await.unwrap());
        assert!(!cache.hset_if("k", "f", Some("stale"), "v2").await.unwrap());
        assert!(cache.hset_if("k", "f", Some("v1"), "v2").await.unwrap());

        assert!(!cache.hdel_if("k", "f", "v1").await.unwrap());
        assert_eq!(cache.hget("k", "f").await.unwrap().as_deref(), Some("v2"));
        assert!(cache.hdel_if("k", "f", "v2").await.unwrap());
        assert_eq!(cache.hget("k", "f").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sorted_range_is_inclusive_and_ordered() {
        let cache = ready_cache().await;
        cache.zadd("device:updated", "c", 300.0).await.unwrap();
        cache.zadd("device:updated", "a", 100.0).await.unwrap();
        cache.zadd("device:updated", "b", 200.0).await.unwrap();

        let hits = cache
            .zrange_by_score("device:updated", 200.0, f64::INFINITY)
            .await
            .unwrap();
        assert_eq!(hits, vec!["b".to_string(), "c".to_string()]);

        assert!(cache.zrem("device:updated", "b").await.unwrap());
        let all = cache
            .zrange_by_score("device:updated", f64::NEG_INFINITY, f64::INFINITY)
            .await
            .unwrap();
        assert_eq!(all, vec!["a".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_geo_radius_nearest_first() {
        let cache = ready_cache().await;
        cache.geo_add("device:locations", "far", 34.10, -118.24).await.unwrap();
        cache.geo_add("device:locations", "near", 34.0501, -118.2401).await.unwrap();
        cache.geo_add("device:locations", "mid", 34.052, -118.242).await.unwrap();

        let hits = cache
            .geo_radius("device:locations", 34.05, -118.24, 1_000.0)
            .await
            .unwrap();
        assert_eq!(hits, vec!["near".to_string(), "mid".to_string()]);

        assert!(cache.geo_remove("device:locations", "near").await.unwrap());
        assert!(!cache.geo_remove("device:locations", "near").await.unwrap());
    }
}

// db/cache.rs
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Cache TTL constants (in seconds)
pub const PROPOSAL_LIST_TTL: u64 = 300; // 5 minutes

pub fn proposal_list_key(tenant_id: Uuid, client_id: Uuid) -> String {
    format!("proposals:{}:{}", tenant_id, client_id)
}

pub fn proposal_tag(proposal_id: Uuid) -> String {
    format!("proposal:{}", proposal_id)
}

pub fn client_tag(client_id: Uuid) -> String {
    format!("client:{}", client_id)
}

pub fn tenant_tag(tenant_id: Uuid) -> String {
    format!("tenant:{}", tenant_id)
}

/// Tags every proposal mutation invalidates.
pub fn proposal_tags(tenant_id: Uuid, client_id: Uuid, proposal_id: Uuid) -> Vec<String> {
    vec![
        proposal_tag(proposal_id),
        client_tag(client_id),
        tenant_tag(tenant_id),
    ]
}

/// Query-result cache. Failures never reach callers: a broken cache is a
/// miss on read and a no-op on write.
#[async_trait]
pub trait CachePort: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String, tags: &[String], ttl_seconds: u64);
    async fn invalidate_by_tags(&self, tags: &[String]);
    fn status(&self) -> &'static str;
}

pub async fn get_json<T: DeserializeOwned>(cache: &dyn CachePort, key: &str) -> Option<T> {
    let raw = cache.get(key).await?;
    match serde_json::from_str::<T>(&raw) {
        Ok(value) => {
            tracing::debug!("Cache HIT: {}", key);
            Some(value)
        }
        Err(e) => {
            tracing::warn!("Cache deserialization failed for {}: {}", key, e);
            None
        }
    }
}

pub async fn set_json<T: Serialize>(
    cache: &dyn CachePort,
    key: &str,
    value: &T,
    tags: &[String],
    ttl_seconds: u64,
) {
    match serde_json::to_string(value) {
        Ok(json) => cache.set(key, json, tags, ttl_seconds).await,
        Err(e) => tracing::warn!("Cache serialization failed for {}: {}", key, e),
    }
}

/// Redis-backed cache. Each tag is a Redis set holding the keys written
/// under it.
pub struct RedisCache {
    conn: Arc<ConnectionManager>,
}

impl RedisCache {
    pub async fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Redis connection established successfully");
        Ok(Self { conn: Arc::new(conn) })
    }

    fn tag_key(tag: &str) -> String {
        format!("tag:{}", tag)
    }

    async fn try_set(
        &self,
        key: &str,
        value: String,
        tags: &[String],
        ttl_seconds: u64,
    ) -> Result<(), redis::RedisError> {
        let mut conn = ConnectionManager::clone(&self.conn);
        let _: () = conn.set_ex(key, value, ttl_seconds as usize).await?;
        for tag in tags {
            let tag_key = Self::tag_key(tag);
            let _: () = conn.sadd(&tag_key, key).await?;
            let _: () = conn.expire(&tag_key, (ttl_seconds * 2) as usize).await?;
        }
        tracing::debug!("Cache SET: {} (TTL: {}s)", key, ttl_seconds);
        Ok(())
    }

    async fn try_invalidate(&self, tags: &[String]) -> Result<usize, redis::RedisError> {
        let mut conn = ConnectionManager::clone(&self.conn);
        let mut deleted = 0;
        for tag in tags {
            let tag_key = Self::tag_key(tag);
            let keys: Vec<String> = conn.smembers(&tag_key).await?;
            if !keys.is_empty() {
                deleted += keys.len();
                let _: () = conn.del(&keys).await?;
            }
            let _: () = conn.del(&tag_key).await?;
        }
        Ok(deleted)
    }
}

#[async_trait]
impl CachePort for RedisCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = ConnectionManager::clone(&self.conn);
        let cached: Result<Option<String>, redis::RedisError> = conn.get(key).await;
        match cached {
            Ok(value) => {
                if value.is_none() {
                    tracing::debug!("Cache MISS: {}", key);
                }
                value
            }
            Err(e) => {
                tracing::warn!("Cache read failed for {}: {}", key, e);
                None
            }
        }
    }

    async fn set(&self, key: &str, value: String, tags: &[String], ttl_seconds: u64) {
        if let Err(e) = self.try_set(key, value, tags, ttl_seconds).await {
            tracing::warn!("Cache write failed for {}: {}", key, e);
        }
    }

    async fn invalidate_by_tags(&self, tags: &[String]) {
        match self.try_invalidate(tags).await {
            Ok(count) => tracing::debug!("Cache invalidated {} keys for tags {:?}", count, tags),
            Err(e) => tracing::warn!("Cache invalidation failed for {:?}: {}", tags, e),
        }
    }

    fn status(&self) -> &'static str {
        "redis"
    }
}

#[derive(Default)]
struct MemoryCacheState {
    entries: HashMap<String, (String, Instant)>,
    tags: HashMap<String, HashSet<String>>,
}

/// Process-local cache with the same tag semantics as `RedisCache`.
#[derive(Default)]
pub struct MemoryCache {
    state: RwLock<MemoryCacheState>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CachePort for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        let state = self.state.read().await;
        match state.entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Some(value.clone()),
            _ => None,
        }
    }

    async fn set(&self, key: &str, value: String, tags: &[String], ttl_seconds: u64) {
        let mut state = self.state.write().await;
        let expires = Instant::now() + Duration::from_secs(ttl_seconds);
        state.entries.insert(key.to_string(), (value, expires));
        for tag in tags {
            state
                .tags
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
    }

    async fn invalidate_by_tags(&self, tags: &[String]) {
        let mut state = self.state.write().await;
        for tag in tags {
            if let Some(keys) = state.tags.remove(tag) {
                for key in keys {
                    state.entries.remove(&key);
                }
            }
        }
    }

    fn status(&self) -> &'static str {
        "memory"
    }
}

/// Used when caching is switched off.
pub struct NoCache;

#[async_trait]
impl CachePort for NoCache {
    async fn get(&self, _key: &str) -> Option<String> {
        None
    }

    async fn set(&self, _key: &str, _value: String, _tags: &[String], _ttl_seconds: u64) {}

    async fn invalidate_by_tags(&self, _tags: &[String]) {}

    fn status(&self) -> &'static str {
        "disabled"
    }
}

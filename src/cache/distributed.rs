/// the warm tier: a cache shared across processes (redis or similar)
///
use anyhow::Result;
use async_std::sync::RwLock;
use async_trait::async_trait;
use hashbrown::HashMap;
use std::time::{Duration, Instant};

#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, bytes: Vec<u8>, ttl: Duration) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;

    /// batched read; one slot per key
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// batched write
    async fn set_many(&self, items: Vec<(String, Vec<u8>)>, ttl: Duration) -> Result<()> {
        for (key, bytes) in items {
            self.set(&key, bytes, ttl).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Stored {
    bytes: Vec<u8>,
    expires_at: Instant,
}

/// in-process stand-in for the distributed tier; honours ttl on read and purges on write
fn purge_expired(store: &mut HashMap<String, Stored>, now: Instant) {
    store.retain(|_, s| s.expires_at > now);
}

#[derive(Debug, Default)]
pub struct MemoryDistributedCache {
    store: RwLock<HashMap<String, Stored>>,
}

impl MemoryDistributedCache {
    pub fn new() -> MemoryDistributedCache {
        MemoryDistributedCache::default()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.store
            .read()
            .await
            .values()
            .filter(|s| s.expires_at > now)
            .count()
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.store.write().await.remove(key).is_some()
    }
}

#[async_trait]
impl DistributedCache for MemoryDistributedCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let value = self
            .store
            .read()
            .await
            .get(key)
            .filter(|s| s.expires_at > now)
            .map(|s| s.bytes.clone());
        Ok(value)
    }

    async fn set(&self, key: &str, bytes: Vec<u8>, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let stored = Stored {
            bytes,
            expires_at: now + ttl,
        };
        let mut store = self.store.write().await;
        purge_expired(&mut store, now);
        store.insert(key.to_string(), stored);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn set_many(&self, items: Vec<(String, Vec<u8>)>, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let expires_at = now + ttl;
        let mut store = self.store.write().await;
        purge_expired(&mut store, now);
        for (key, bytes) in items {
            store.insert(key, Stored { bytes, expires_at });
        }
        Ok(())
    }
}

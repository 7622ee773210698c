/// memory tier over distributed tier over the entry collection.
///
/// Reads never fail: a miss in every layer, or a value that does not fit the requested type,
/// logs and returns the type's default. Evictions from the memory tier come back on a channel and
/// are turned into reload tasks on the queue instead of re-entering the cache inline.
///
use async_channel::Receiver;
use async_std::task::JoinHandle;
use hashbrown::HashMap;
use log::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::distributed::DistributedCache;
use crate::cache::worker::{Eviction, MemoryTier};
use crate::collection::EntryCollection;
use crate::config::CacheConfig;
use crate::entry::Entry;
use crate::error::{Result, StaticDataError};
use crate::queue::{ReloadTask, ReloadTaskQueue};
use crate::registry::SettingRegistry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// `None` applies the ttl policy for the key
    pub ttl: Option<Duration>,
}

impl CacheOptions {
    pub fn ttl(ttl: Duration) -> CacheOptions {
        CacheOptions { ttl: Some(ttl) }
    }
}

/// short ttl per setting, a longer one for the aggregate bundle
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    default_ttl: Duration,
    bundle_key: String,
    bundle_ttl: Duration,
    per_setting: HashMap<String, Duration>,
}

impl TtlPolicy {
    pub fn new(config: &CacheConfig, registry: &SettingRegistry) -> TtlPolicy {
        let per_setting = registry
            .iter()
            .filter_map(|d| d.reload_interval().map(|ttl| (d.name.clone(), ttl)))
            .collect();

        TtlPolicy {
            default_ttl: Duration::from_secs(config.default_ttl_secs),
            bundle_key: config.bundle_key.clone(),
            bundle_ttl: Duration::from_secs(config.bundle_ttl_secs),
            per_setting,
        }
    }

    pub fn ttl_for(&self, key: &str) -> Duration {
        if key == self.bundle_key {
            return self.bundle_ttl;
        }

        self.per_setting.get(key).copied().unwrap_or(self.default_ttl)
    }
}

#[derive(Debug, Default)]
struct Counters {
    memory_hits: AtomicU64,
    distributed_hits: AtomicU64,
    loads: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub distributed_hits: u64,
    pub loads: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct TieredCache {
    memory: MemoryTier,
    distributed: Arc<dyn DistributedCache>,
    collection: Arc<EntryCollection>,
    policy: TtlPolicy,
    namespace: String,
    counters: Counters,
}

impl TieredCache {
    pub fn new(
        memory: MemoryTier,
        distributed: Arc<dyn DistributedCache>,
        collection: Arc<EntryCollection>,
        config: &CacheConfig,
    ) -> TieredCache {
        let policy = TtlPolicy::new(config, collection.registry());

        TieredCache {
            memory,
            distributed,
            collection,
            policy,
            namespace: config.namespace.clone(),
            counters: Counters::default(),
        }
    }

    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    pub fn collection(&self) -> &Arc<EntryCollection> {
        &self.collection
    }

    pub fn policy(&self) -> &TtlPolicy {
        &self.policy
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            distributed_hits: self.counters.distributed_hits.load(Ordering::Relaxed),
            loads: self.counters.loads.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    fn distributed_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    /// blocking read; call `get_async` from inside a task
    pub fn get<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        async_std::task::block_on(self.get_async(key))
    }

    pub async fn get_async<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        let value = match self.get_value(key).await {
            Some(value) => value,
            None => return T::default(),
        };

        match serde_json::from_value(value) {
            Ok(v) => v,
            Err(e) => {
                error!("cached value for {} does not fit the requested type: {}", key, e);
                T::default()
            }
        }
    }

    /// the read-through path: memory, then distributed, then the collection
    pub async fn get_value(&self, key: &str) -> Option<Value> {
        match self.memory.get(key).await {
            Ok(Some(value)) => {
                self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
                return Some(value);
            }
            Ok(None) => (),
            Err(e) => warn!("memory tier read of {} failed: {}", key, e),
        }

        if let Some(value) = self.read_distributed(key).await {
            self.counters.distributed_hits.fetch_add(1, Ordering::Relaxed);
            self.set_memory(key, value.clone(), self.policy.ttl_for(key)).await;
            return Some(value);
        }

        let entry = self.collection.get_by_name_async(key).await;
        match entry {
            Some(entry) if entry.has_value() => {
                self.counters.loads.fetch_add(1, Ordering::Relaxed);
                let value = entry.value.to_json();
                self.prime(&entry).await;
                Some(value)
            }
            Some(entry) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                error!("no value for {}: {}", key, entry.message);
                None
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                error!("no setting or cached value for {}", key);
                None
            }
        }
    }

    async fn read_distributed(&self, key: &str) -> Option<Value> {
        let bytes = match self.distributed.get(&self.distributed_key(key)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!("distributed tier read of {} failed: {:#}", key, e);
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("distributed tier holds an unreadable value for {}: {}", key, e);
                None
            }
        }
    }

    async fn set_memory(&self, key: &str, value: Value, ttl: Duration) -> bool {
        match self.memory.set(key, value, ttl).await {
            Ok(_) => true,
            Err(e) => {
                warn!("memory tier write of {} failed: {}", key, e);
                false
            }
        }
    }

    async fn set_distributed(&self, key: &str, value: &Value, ttl: Duration) -> bool {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("cannot encode {} for the distributed tier: {}", key, e);
                return false;
            }
        };

        match self.distributed.set(&self.distributed_key(key), bytes, ttl).await {
            Ok(()) => true,
            Err(e) => {
                warn!("distributed tier write of {} failed: {:#}", key, e);
                false
            }
        }
    }

    /// write a value into both tiers
    pub async fn set<V: Serialize>(&self, key: &str, value: &V, options: CacheOptions) -> Result<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| StaticDataError::Cache(format!("cannot encode {}: {}", key, e)))?;
        let ttl = options.ttl.unwrap_or_else(|| self.policy.ttl_for(key));

        self.set_distributed(key, &value, ttl).await;
        self.memory
            .set(key, value, ttl)
            .await
            .map_err(|e| StaticDataError::Cache(format!("memory tier write of {}: {}", key, e)))?;

        Ok(())
    }

    /// write a resolved entry into both tiers
    pub async fn prime(&self, entry: &Entry) -> bool {
        if !entry.has_value() {
            return false;
        }

        let ttl = self.policy.ttl_for(&entry.name);
        let value = entry.value.to_json();
        self.set_distributed(&entry.name, &value, ttl).await;
        self.set_memory(&entry.name, value, ttl).await
    }

    /// write a resolved entry into the memory tier only
    pub async fn prime_memory(&self, entry: &Entry) -> bool {
        if !entry.has_value() {
            return false;
        }

        self.set_memory(&entry.name, entry.value.to_json(), self.policy.ttl_for(&entry.name))
            .await
    }

    /// push every resolved entry to the distributed tier, one batched write per ttl
    pub async fn publish(&self, entries: &[Entry]) -> usize {
        let mut by_ttl: HashMap<Duration, Vec<(String, Vec<u8>)>> = HashMap::new();

        for entry in entries.iter().filter(|e| e.has_value()) {
            match serde_json::to_vec(&entry.value.to_json()) {
                Ok(bytes) => by_ttl
                    .entry(self.policy.ttl_for(&entry.name))
                    .or_default()
                    .push((self.distributed_key(&entry.name), bytes)),
                Err(e) => warn!("cannot encode {} for the distributed tier: {}", entry.name, e),
            }
        }

        let mut published = 0;
        for (ttl, items) in by_ttl {
            let count = items.len();
            match self.distributed.set_many(items, ttl).await {
                Ok(()) => published += count,
                Err(e) => warn!("distributed tier batch write failed: {:#}", e),
            }
        }

        debug!("published {} entries to the distributed tier", published);
        published
    }

    /// explicit removal from the hot tier; the eviction it publishes schedules a reload
    pub async fn remove(&self, key: &str) -> Option<Value> {
        match self.memory.remove(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!("memory tier remove of {} failed: {}", key, e);
                None
            }
        }
    }

    /// re-resolve one setting through the collection and re-prime both tiers
    pub async fn reload_key(&self, key: &str) -> Result<Entry> {
        let entry = self.collection.refresh(key).await?;
        if entry.has_value() {
            self.prime(&entry).await;
            info!("reloaded {} into the cache", key);
        } else {
            warn!("reload of {} produced no value: {}", key, entry.message);
        }

        Ok(entry)
    }

    /// turn evictions of registered settings into reload tasks until the channel closes
    pub fn listen_for_evictions(
        self: &Arc<Self>,
        evictions: Receiver<Eviction>,
        queue: Arc<ReloadTaskQueue>,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);

        async_std::task::spawn(async move {
            while let Ok(eviction) = evictions.recv().await {
                cache.counters.evictions.fetch_add(1, Ordering::Relaxed);
                cache.schedule_reload(&eviction, &queue);
            }
            debug!("eviction listener stopped");
        })
    }

    fn schedule_reload(self: &Arc<Self>, eviction: &Eviction, queue: &ReloadTaskQueue) {
        let key = eviction.key.clone();
        if !self.collection.registry().contains(&key) {
            debug!("evicted {} has no registered setting", key);
            return;
        }

        let cache = Arc::clone(self);
        let task = ReloadTask::new(&eviction.key, move || async move {
            if let Err(e) = cache.reload_key(&key).await {
                error!("reload task for {} failed: {}", key, e);
            }
        });

        match queue.enqueue_unique(task) {
            Ok(true) => debug!("{:?} eviction of {} queued a reload", eviction.reason, eviction.key),
            Ok(false) => (),
            Err(e) => warn!("cannot queue reload of {}: {}", eviction.key, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::distributed::MemoryDistributedCache;
    use crate::cancel::CancelToken;
    use crate::config::FetchConfig;
    use crate::orchestrator::Orchestrator;
    use crate::provider::upstream::{MemoryUpstream, UpstreamAdapter};
    use crate::provider::ProviderSet;
    use crate::registry::{ProviderKind, ResourceType, SettingDescriptor};
    use serde_json::json;

    struct Fixture {
        cache: Arc<TieredCache>,
        distributed: Arc<MemoryDistributedCache>,
        client: Arc<MemoryUpstream>,
        evictions: Receiver<Eviction>,
    }

    async fn fixture() -> Fixture {
        let client = Arc::new(MemoryUpstream::new());
        client.route("/hotels", b"[1,2,3]").await;

        let rows = vec![
            SettingDescriptor::new("Hotels", ProviderKind::Pms, "/hotels")
                .with_resource_type(ResourceType::IdList)
                .with_reload_interval(120),
            SettingDescriptor::new("Missing", ProviderKind::Pms, "/missing"),
        ];
        let registry = Arc::new(SettingRegistry::new(rows).expect("registry"));
        let providers = ProviderSet::new().with(Arc::new(UpstreamAdapter::new(ProviderKind::Pms, client.clone())));
        let orchestrator = Arc::new(Orchestrator::new(registry, providers, "v1", &FetchConfig::default()));
        let collection = Arc::new(EntryCollection::new(orchestrator));

        let (memory, evictions) = MemoryTier::start(Duration::from_secs(60));
        let distributed = Arc::new(MemoryDistributedCache::new());
        let cache = Arc::new(TieredCache::new(
            memory,
            distributed.clone(),
            collection,
            &CacheConfig::default(),
        ));

        Fixture {
            cache,
            distributed,
            client,
            evictions,
        }
    }

    #[test]
    fn ttl_policy() {
        async_std::task::block_on(async move {
            let fx = fixture().await;
            let policy = fx.cache.policy();
            assert_eq!(policy.ttl_for("Hotels"), Duration::from_secs(120));
            assert_eq!(policy.ttl_for("Missing"), Duration::from_secs(300));
            assert_eq!(policy.ttl_for("Settings"), Duration::from_secs(3_600));
        });
    }

    #[test]
    fn read_through_populates_both_tiers() {
        async_std::task::block_on(async move {
            let fx = fixture().await;

            let hotels: Vec<i64> = fx.cache.get_async("Hotels").await;
            assert_eq!(hotels, vec![1, 2, 3]);
            assert_eq!(fx.client.round_trips(), 1);

            let stored = fx.distributed.get("static-data:Hotels").await.expect("get");
            assert_eq!(stored, Some(b"[1,2,3]".to_vec()));

            // served from memory now
            let again: Vec<i64> = fx.cache.get_async("Hotels").await;
            assert_eq!(again, hotels);
            assert_eq!(fx.client.round_trips(), 1);

            let stats = fx.cache.stats();
            assert_eq!(stats.loads, 1);
            assert_eq!(stats.memory_hits, 1);
        });
    }

    #[test]
    fn distributed_hit_fills_memory() {
        async_std::task::block_on(async move {
            let fx = fixture().await;
            fx.distributed
                .set("static-data:Hotels", b"[9]".to_vec(), Duration::from_secs(60))
                .await
                .expect("set");

            let hotels: Vec<i64> = fx.cache.get_async("Hotels").await;
            assert_eq!(hotels, vec![9]);
            assert_eq!(fx.client.round_trips(), 0);
            assert_eq!(fx.cache.memory().get("Hotels").await.expect("get"), Some(json!([9])));
        });
    }

    #[test]
    fn failures_return_the_default() {
        async_std::task::block_on(async move {
            let fx = fixture().await;

            let missing: Vec<String> = fx.cache.get_async("Missing").await;
            assert!(missing.is_empty());

            let unknown: Option<String> = fx.cache.get_async("NotRegistered").await;
            assert_eq!(unknown, None);

            // wrong shape for the stored value
            let wrong: HashMap<String, String> = fx.cache.get_async("Hotels").await;
            assert!(wrong.is_empty());
            assert_eq!(fx.cache.stats().misses, 2);
        });
    }

    #[test]
    fn set_with_options() {
        async_std::task::block_on(async move {
            let fx = fixture().await;
            fx.cache
                .set("Adhoc", &vec!["a", "b"], CacheOptions::ttl(Duration::from_secs(5)))
                .await
                .expect("set");

            let value: Vec<String> = fx.cache.get_async("Adhoc").await;
            assert_eq!(value, vec!["a", "b"]);
            assert!(fx.distributed.exists("static-data:Adhoc").await.expect("exists"));
        });
    }

    #[test]
    fn eviction_queues_one_reload() {
        async_std::task::block_on(async move {
            let fx = fixture().await;
            let queue = Arc::new(ReloadTaskQueue::new(8));
            let listener = fx.cache.listen_for_evictions(fx.evictions.clone(), queue.clone());

            let _: Vec<i64> = fx.cache.get_async("Hotels").await;
            assert!(fx.cache.remove("Hotels").await.is_some());
            fx.cache.set("Adhoc", &1, CacheOptions::default()).await.expect("set");
            fx.cache.remove("Adhoc").await;

            async_std::task::sleep(Duration::from_millis(50)).await;
            assert_eq!(queue.pending(), vec!["Hotels"]);

            let task = queue.dequeue(&CancelToken::new()).await.expect("task");
            task.run().await;
            assert_eq!(fx.client.round_trips(), 2);
            assert_eq!(fx.cache.memory().get("Hotels").await.expect("get"), Some(json!([1, 2, 3])));

            fx.cache.memory().shutdown().await.expect("shutdown");
            drop(fx);
            listener.cancel().await;
        });
    }

    #[test]
    fn publish_batches_resolved_entries() {
        async_std::task::block_on(async move {
            let fx = fixture().await;
            fx.cache.collection().reload(&CancelToken::new()).await.expect("reload");

            let snapshot = fx.cache.collection().snapshot();
            assert_eq!(fx.cache.publish(&snapshot).await, 1);
            assert_eq!(fx.distributed.len().await, 1);
        });
    }
}

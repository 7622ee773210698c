/// the static data engine: one long-lived instance wiring registry, orchestrator, collection,
/// both cache tiers, the reload queue and the scheduler.
///
use async_std::task::JoinHandle;
use log::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::cache::distributed::{DistributedCache, MemoryDistributedCache};
use crate::cache::tiered::{CacheOptions, CacheStats, TieredCache};
use crate::cache::worker::MemoryTier;
use crate::cancel::CancelToken;
use crate::collection::{EntryCollection, ReloadOutcome};
use crate::config::EngineConfig;
use crate::entry::Entry;
use crate::error::{Result, StaticDataError};
use crate::orchestrator::Orchestrator;
use crate::provider::object_store::{ObjectStore, ObjectStoreAdapter};
use crate::provider::upstream::{UpstreamAdapter, UpstreamClient};
use crate::provider::{ProviderAdapter, ProviderSet};
use crate::queue::{ReloadTask, ReloadTaskQueue};
use crate::registry::{ProviderKind, SettingRegistry};
use crate::scheduler::{ReloadScheduler, SchedulerStats};
use crate::worker::WorkerStatus;

/// a point-in-time view of the engine for health endpoints and logs
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub version: String,
    pub entries: usize,
    pub undefined: Vec<String>,
    pub reloads: usize,
    pub pending_tasks: usize,
    pub cache: CacheStats,
    pub scheduler: WorkerStatus,
    pub memory_tier: Option<WorkerStatus>,
}

pub struct EngineBuilder {
    config: EngineConfig,
    providers: ProviderSet,
    distributed: Option<Arc<dyn DistributedCache>>,
}

impl EngineBuilder {
    pub fn with_adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.providers.insert(adapter);
        self
    }

    pub fn with_object_store(self, store: Arc<dyn ObjectStore>) -> Self {
        self.with_adapter(Arc::new(ObjectStoreAdapter::new(store)))
    }

    pub fn with_upstream(self, kind: ProviderKind, client: Arc<dyn UpstreamClient>) -> Self {
        self.with_adapter(Arc::new(UpstreamAdapter::new(kind, client)))
    }

    pub fn with_distributed(mut self, cache: Arc<dyn DistributedCache>) -> Self {
        self.distributed = Some(cache);
        self
    }

    /// validate the registry and start the memory tier and its eviction listener
    pub fn build(self) -> Result<StaticDataEngine> {
        let registry = Arc::new(self.config.registry()?);
        for descriptor in registry.iter() {
            if self.providers.get(descriptor.provider).is_none() {
                warn!(
                    "no {} adapter registered, {} will resolve as unsupported",
                    descriptor.provider, descriptor.name
                );
            }
        }

        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            self.providers,
            &self.config.version,
            &self.config.fetch,
        ));
        let collection = Arc::new(EntryCollection::new(orchestrator));

        let distributed = self
            .distributed
            .unwrap_or_else(|| Arc::new(MemoryDistributedCache::new()));
        let sweep = Duration::from_millis(self.config.cache.sweep_interval_ms.max(1));
        let (memory, evictions) = MemoryTier::start(sweep);
        let cache = Arc::new(TieredCache::new(
            memory,
            distributed,
            collection.clone(),
            &self.config.cache,
        ));

        let queue = Arc::new(ReloadTaskQueue::new(self.config.queue.capacity));
        let listener = cache.listen_for_evictions(evictions, queue.clone());
        let scheduler = ReloadScheduler::new(
            self.config.scheduler.clone(),
            collection.clone(),
            cache.clone(),
            queue.clone(),
        );

        info!(
            "static data engine built: version {}, {} settings",
            self.config.version,
            registry.len()
        );

        Ok(StaticDataEngine {
            config: self.config,
            registry,
            collection,
            cache,
            queue,
            scheduler,
            listener: Mutex::new(Some(listener)),
        })
    }
}

pub struct StaticDataEngine {
    config: EngineConfig,
    registry: Arc<SettingRegistry>,
    collection: Arc<EntryCollection>,
    cache: Arc<TieredCache>,
    queue: Arc<ReloadTaskQueue>,
    scheduler: ReloadScheduler,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl StaticDataEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            providers: ProviderSet::new(),
            distributed: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SettingRegistry> {
        &self.registry
    }

    pub fn collection(&self) -> &Arc<EntryCollection> {
        &self.collection
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<ReloadTaskQueue> {
        &self.queue
    }

    pub fn scheduler(&self) -> &ReloadScheduler {
        &self.scheduler
    }

    /// resolve everything once and prime both tiers; row failures stay on their entries
    pub async fn warm_up(&self) -> Result<ReloadOutcome> {
        let outcome = self.collection.reload(&CancelToken::new()).await?;

        let snapshot = self.collection.snapshot();
        let published = self.cache.publish(&snapshot).await;
        let primed = self.collection.set_memory_cache(&self.cache, None).await;
        info!("warm up {:?}: {} published, {} primed", outcome, published, primed);

        let undefined = self.collection.undefined_static_data();
        if !undefined.is_empty() {
            warn!("static data still undefined after warm up: {}", undefined.join(", "));
        }

        Ok(outcome)
    }

    pub fn start(&self) {
        self.scheduler.start();
    }

    /// stop the scheduler, then the memory tier and its eviction listener
    pub async fn stop(&self) {
        self.scheduler.stop().await;

        if let Err(e) = self.cache.memory().shutdown().await {
            warn!("memory tier shutdown: {}", e);
        }
        self.queue.close();

        let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(listener) = listener {
            listener.await;
        }
        info!("static data engine stopped");
    }

    /// typed read through both tiers; never fails, returns the default instead
    pub fn get<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        self.cache.get(key)
    }

    pub async fn get_async<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        self.cache.get_async(key).await
    }

    pub async fn set<V: Serialize>(&self, key: &str, value: &V, options: CacheOptions) -> Result<()> {
        self.cache.set(key, value, options).await
    }

    /// a copy of the entry, resolving it first when needed
    pub async fn entry(&self, name: &str) -> Option<Entry> {
        self.collection.get_by_name_async(name).await
    }

    /// queue an arbitrary task; duplicates for a key are accepted
    pub fn enqueue_task<F, Fut>(&self, key: &str, action: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.queue.enqueue(key, action)
    }

    /// queue a targeted refresh of one setting unless one is already pending
    pub fn refresh(&self, key: &str) -> Result<bool> {
        if !self.registry.contains(key) {
            return Err(StaticDataError::UnknownSetting(key.to_string()));
        }

        let cache = self.cache.clone();
        let name = key.to_string();
        let task = ReloadTask::new(key, move || async move {
            if let Err(e) = cache.reload_key(&name).await {
                error!("refresh of {} failed: {}", name, e);
            }
        });

        self.queue.enqueue_unique(task)
    }

    pub fn undefined_static_data(&self) -> Vec<String> {
        self.collection.undefined_static_data()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub async fn status(&self) -> EngineStatus {
        let memory_tier = match self.cache.memory().status().await {
            Ok(status) => Some(status),
            Err(e) => {
                debug!("memory tier status unavailable: {}", e);
                None
            }
        };

        EngineStatus {
            version: self.config.version.clone(),
            entries: self.collection.len(),
            undefined: self.collection.undefined_static_data(),
            reloads: self.collection.reload_count(),
            pending_tasks: self.queue.len(),
            cache: self.cache.stats(),
            scheduler: self.scheduler.status(),
            memory_tier,
        }
    }
}

/// the entry collection: one entry per registry row, kept warm in process memory.
///
/// The backing list sits behind an `ArcSwap`. Single entries are resolved lazily on first read
/// and written back with a read-copy-update. A reload resolves its rows off to the side and then
/// merges them into the live list in one atomic swap, so readers never see a half-built list.
///
use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use futures::stream::{self, Stream, StreamExt};
use futures::FutureExt;
use log::*;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cache::tiered::TieredCache;
use crate::cancel::CancelToken;
use crate::entry::{Entry, StaticValue};
use crate::error::{Result, StaticDataError};
use crate::orchestrator::Orchestrator;
use crate::provider::inline::parse_literal;
use crate::registry::{ProviderFilter, ProviderKind, SettingDescriptor, SettingRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Reloaded { resolved: usize, failed: usize },
    /// another full reload was already running
    Skipped,
}

// clears the in-flight flag however the reload ends
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct EntryCollection {
    registry: Arc<SettingRegistry>,
    orchestrator: Arc<Orchestrator>,
    entries: ArcSwap<Vec<Entry>>,
    reloading: AtomicBool,
    reload_count: AtomicUsize,
}

impl EntryCollection {
    /// one unresolved entry per descriptor, in registry order
    pub fn new(orchestrator: Arc<Orchestrator>) -> EntryCollection {
        let registry = orchestrator.registry().clone();
        let entries: Vec<Entry> = registry.iter().map(Entry::new).collect();

        EntryCollection {
            registry,
            orchestrator,
            entries: ArcSwap::from_pointee(entries),
            reloading: AtomicBool::new(false),
            reload_count: AtomicUsize::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<SettingRegistry> {
        &self.registry
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    /// the current list; never partially rebuilt
    pub fn snapshot(&self) -> Arc<Vec<Entry>> {
        self.entries.load_full()
    }

    /// synchronous iteration over a snapshot; does not resolve anything
    pub fn iter(&self) -> std::vec::IntoIter<Entry> {
        self.snapshot().as_ref().clone().into_iter()
    }

    /// number of full reloads that have completed
    pub fn reload_count(&self) -> usize {
        self.reload_count.load(Ordering::SeqCst)
    }

    pub fn is_reloading(&self) -> bool {
        self.reloading.load(Ordering::Acquire)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.entries.load().iter().position(|e| e.name == name)
    }

    fn find(&self, name: &str) -> Option<Entry> {
        self.entries.load().iter().find(|e| e.name == name).cloned()
    }

    fn descriptor(&self, name: &str) -> Result<&SettingDescriptor> {
        self.registry
            .get(name)
            .ok_or_else(|| StaticDataError::UnknownSetting(name.to_string()))
    }

    /// add an entry for a registry row that has none
    pub fn add(&self, entry: Entry) -> Result<()> {
        self.descriptor(&entry.name)?;
        if self.position(&entry.name).is_some() {
            return Err(StaticDataError::DuplicateEntry(entry.name));
        }

        self.entries.rcu(|current| {
            let mut next = current.as_ref().clone();
            if !next.iter().any(|e| e.name == entry.name) {
                next.push(entry.clone());
            }
            next
        });
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Option<Entry> {
        let removed = self.find(name)?;
        self.entries.rcu(|current| {
            current
                .iter()
                .filter(|e| e.name != name)
                .cloned()
                .collect::<Vec<Entry>>()
        });
        Some(removed)
    }

    /// write one entry back in place; entries removed meanwhile are not re-added
    fn store(&self, entry: &Entry) {
        self.entries.rcu(|current| {
            let mut next = current.as_ref().clone();
            if let Some(slot) = next.iter_mut().find(|e| e.name == entry.name) {
                *slot = entry.clone();
            }
            next
        });
    }

    /// the entry at `index`, resolving it first when it has never been resolved.
    ///
    /// Inline entries are parsed on the spot; anything else blocks on the provider, so this
    /// must not be called from inside an async task. Use `get_async` there.
    pub fn get(&self, index: usize) -> Option<Entry> {
        let entry = self.entries.load().get(index).cloned()?;
        if entry.is_resolved() {
            return Some(entry);
        }

        if entry.provider == ProviderKind::Inline {
            let descriptor = self.registry.get(&entry.name)?;
            let resolved = resolve_inline(descriptor, entry);
            self.store(&resolved);
            return Some(resolved);
        }

        async_std::task::block_on(self.get_async(index))
    }

    pub async fn get_async(&self, index: usize) -> Option<Entry> {
        let name = self.entries.load().get(index).map(|e| e.name.clone())?;
        self.get_by_name_async(&name).await
    }

    pub fn get_by_name(&self, name: &str) -> Option<Entry> {
        let index = self.position(name)?;
        self.get(index)
    }

    pub async fn get_by_name_async(&self, name: &str) -> Option<Entry> {
        let entry = self.find(name)?;
        if entry.is_resolved() {
            return Some(entry);
        }

        match self.resolve(name).await {
            Ok(entry) => Some(entry),
            Err(e) => {
                error!("lazy resolve of {} failed: {}", name, e);
                Some(entry)
            }
        }
    }

    /// re-resolve one setting regardless of its current state
    pub async fn refresh(&self, name: &str) -> Result<Entry> {
        self.resolve(name).await
    }

    // resolves the dependency target first when it has never been resolved
    fn resolve<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Entry>> {
        async move {
            let descriptor = self.descriptor(name)?;
            let prior = self
                .find(name)
                .ok_or_else(|| StaticDataError::UnknownSetting(name.to_string()))?;

            if descriptor.provider == ProviderKind::Inline {
                let resolved = resolve_inline(descriptor, prior);
                self.store(&resolved);
                return Ok(resolved);
            }

            let dependency = match descriptor.depends_on.as_deref() {
                Some(target) => match self.find(target) {
                    Some(t) if t.is_resolved() => Some(t),
                    Some(_) => self.resolve(target).await.ok(),
                    None => None,
                },
                None => None,
            };

            let entry = self
                .orchestrator
                .resolve_one(descriptor, Some(&prior), dependency.as_ref())
                .await;
            self.store(&entry);
            Ok(entry)
        }
        .boxed()
    }

    /// full bulk refresh of every entry
    pub async fn reload(&self, cancel: &CancelToken) -> Result<ReloadOutcome> {
        self.reload_filtered(ProviderFilter::All, None, cancel).await
    }

    /// refresh the rows matched by filter and keys; at most one runs at a time.
    ///
    /// On error the previous list stays in place untouched.
    pub async fn reload_filtered(
        &self,
        filter: ProviderFilter,
        keys: Option<&[String]>,
        cancel: &CancelToken,
    ) -> Result<ReloadOutcome> {
        if self
            .reloading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("reload already in flight, skipping this trigger");
            return Ok(ReloadOutcome::Skipped);
        }
        let _in_flight = InFlight(&self.reloading);

        let current = self.entries.load_full();
        if current.is_empty() && !self.registry.is_empty() {
            return Err(StaticDataError::ReloadFailed(String::from(
                "the collection holds no entries",
            )));
        }

        let rows = self.registry.scope(filter, keys);
        let mut scope = self.registry.dependency_targets(&rows);
        scope.extend(rows.iter().map(|d| d.name.clone()));

        let pass = self.orchestrator.resolve_all(filter, keys, &current, cancel);
        let next = match AssertUnwindSafe(pass).catch_unwind().await {
            Ok(Ok(next)) => next,
            Ok(Err(e)) => {
                error!("reload failed, keeping {} previous entries: {}", current.len(), e);
                return Err(e);
            }
            Err(_) => {
                error!("reload panicked, keeping {} previous entries", current.len());
                return Err(StaticDataError::ReloadFailed(String::from("resolution panicked")));
            }
        };

        let touched: Vec<&Entry> = next.iter().filter(|e| scope.contains(&e.name)).collect();
        let resolved = touched.iter().filter(|e| e.has_value()).count();
        let failed = touched.iter().filter(|e| e.error).count();

        // merge by name into the live list; adds and removes made meanwhile survive
        self.entries.rcu(|live| {
            live.iter()
                .map(|e| match touched.iter().find(|t| t.name == e.name) {
                    Some(t) => (*t).clone(),
                    None => e.clone(),
                })
                .collect::<Vec<Entry>>()
        });
        self.reload_count.fetch_add(1, Ordering::SeqCst);
        info!(
            "reloaded {} entries: {} resolved, {} failed",
            touched.len(),
            resolved,
            failed
        );

        Ok(ReloadOutcome::Reloaded { resolved, failed })
    }

    /// lazy async iteration: unresolved entries are resolved as they are yielded
    pub fn stream(&self) -> impl Stream<Item = Entry> + '_ {
        let names: Vec<String> = self.entries.load().iter().map(|e| e.name.clone()).collect();
        stream::iter(names).filter_map(move |name| async move { self.get_by_name_async(&name).await })
    }

    /// names of entries still holding no value after every resolution attempt
    pub fn undefined_static_data(&self) -> Vec<String> {
        self.entries
            .load()
            .iter()
            .filter(|e| e.value.is_empty())
            .map(|e| e.name.clone())
            .collect()
    }

    /// re-prime the hot tier from already-resolved entries; returns how many were written
    pub async fn set_memory_cache(&self, cache: &TieredCache, keys: Option<&[String]>) -> usize {
        let snapshot = self.snapshot();
        let mut primed = 0;

        for entry in snapshot.iter() {
            if let Some(keys) = keys {
                if !keys.iter().any(|k| k == &entry.name) {
                    continue;
                }
            }
            if entry.has_value() && cache.prime_memory(entry).await {
                primed += 1;
            }
        }

        debug!("primed {} entries into the memory tier", primed);
        primed
    }
}

/// parse an inline literal into the entry without any i/o
fn resolve_inline(descriptor: &SettingDescriptor, mut entry: Entry) -> Entry {
    let key = descriptor.path.clone();
    let outcome = match parse_literal(&descriptor.path, descriptor.resource_type) {
        Ok(Some(payload)) => match StaticValue::decode(descriptor.resource_type, &payload) {
            Ok(value) if !value.is_empty() => Ok((payload, value)),
            Ok(_) => Err(StaticDataError::EmptyResult {
                setting: descriptor.name.clone(),
            }
            .to_string()),
            Err(source) => Err(StaticDataError::Deserialization {
                setting: descriptor.name.clone(),
                resource_type: descriptor.resource_type,
                source,
            }
            .to_string()),
        },
        Ok(None) => Err(StaticDataError::EmptyResult {
            setting: descriptor.name.clone(),
        }
        .to_string()),
        Err(e) => Err(format!("{:#}", e)),
    };

    match outcome {
        Ok((payload, value)) => entry.succeed(key, payload, value),
        Err(message) => {
            warn!("inline setting {} not resolved: {}", descriptor.name, message);
            entry.fail(key, message)
        }
    }

    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchConfig;
    use crate::provider::upstream::{MemoryUpstream, UpstreamAdapter};
    use crate::provider::ProviderSet;
    use crate::registry::ResourceType;
    use std::time::Duration;

    async fn collection() -> (EntryCollection, Arc<MemoryUpstream>) {
        collection_with(MemoryUpstream::new()).await
    }

    async fn collection_with(client: MemoryUpstream) -> (EntryCollection, Arc<MemoryUpstream>) {
        let client = Arc::new(client);
        client.route("/hotels", b"[1,2]").await;
        client.route("/plans?hotels=1,2", br#"[{"id":10},{"id":11}]"#).await;

        let rows = vec![
            SettingDescriptor::new("Colors", ProviderKind::Inline, "red,green")
                .with_resource_type(ResourceType::StringList),
            SettingDescriptor::new("Hotels", ProviderKind::Pms, "/hotels")
                .with_resource_type(ResourceType::IdList),
            SettingDescriptor::new("Plans", ProviderKind::Pms, "/plans?hotels={ids}")
                .with_resource_type(ResourceType::Records)
                .with_depends_on("Hotels"),
        ];
        let registry = Arc::new(SettingRegistry::new(rows).expect("registry"));
        let providers = ProviderSet::new().with(Arc::new(UpstreamAdapter::new(ProviderKind::Pms, client.clone())));
        let orchestrator = Arc::new(Orchestrator::new(registry, providers, "v1", &FetchConfig::default()));

        (EntryCollection::new(orchestrator), client)
    }

    #[test]
    fn new_has_one_entry_per_row() {
        async_std::task::block_on(async move {
            let (collection, _) = collection().await;
            assert_eq!(collection.len(), 3);
            assert_eq!(collection.undefined_static_data().len(), 3);
            assert!(collection.iter().all(|e| !e.is_resolved()));
        });
    }

    #[test]
    fn sync_get_parses_inline_entries() {
        let (collection, client) = async_std::task::block_on(collection());
        let colors = collection.get(0).expect("colors");
        assert_eq!(colors.value, StaticValue::Strings(vec!["red".into(), "green".into()]));
        assert_eq!(client.round_trips(), 0);
        assert!(collection.get(7).is_none());
    }

    #[test]
    fn lazy_get_resolves_the_dependency_first() {
        async_std::task::block_on(async move {
            let (collection, client) = collection().await;

            let plans = collection.get_by_name_async("Plans").await.expect("plans");
            assert!(!plans.error, "{}", plans.message);
            assert_eq!(plans.value.len(), 2);
            assert_eq!(client.requested().await, vec!["/hotels", "/plans?hotels=1,2"]);

            // a second read is served from the entry
            let again = collection.get_async(2).await.expect("plans");
            assert_eq!(again.value, plans.value);
            assert_eq!(client.round_trips(), 2);
        });
    }

    #[test]
    fn reload_swaps_the_whole_list() {
        async_std::task::block_on(async move {
            let (collection, _) = collection().await;
            let before = collection.snapshot();

            let outcome = collection.reload(&CancelToken::new()).await.expect("reload");
            assert_eq!(outcome, ReloadOutcome::Reloaded { resolved: 3, failed: 0 });
            assert_eq!(collection.reload_count(), 1);
            assert!(collection.undefined_static_data().is_empty());

            // the old snapshot is untouched
            assert!(before.iter().all(|e| !e.is_resolved()));
            assert!(!collection.is_reloading());
        });
    }

    #[test]
    fn cancelled_reload_keeps_the_old_list() {
        async_std::task::block_on(async move {
            let (collection, _) = collection().await;
            collection.reload(&CancelToken::new()).await.expect("reload");

            let cancel = CancelToken::new();
            cancel.cancel();
            let result = collection.reload(&cancel).await;
            assert!(matches!(result, Err(StaticDataError::Cancelled)));
            assert_eq!(collection.len(), 3);
            assert!(collection.undefined_static_data().is_empty());
            assert!(!collection.is_reloading());
        });
    }

    #[test]
    fn add_and_remove() {
        async_std::task::block_on(async move {
            let (collection, _) = collection().await;

            let removed = collection.remove("Colors").expect("removed");
            assert_eq!(collection.len(), 2);
            assert!(collection.remove("Colors").is_none());

            assert!(matches!(
                collection.add(Entry::new(
                    &SettingDescriptor::new("Unknown", ProviderKind::Inline, "x")
                )),
                Err(StaticDataError::UnknownSetting(_))
            ));

            collection.add(removed.clone()).expect("re-add");
            assert!(matches!(collection.add(removed), Err(StaticDataError::DuplicateEntry(_))));
            assert_eq!(collection.position("Colors"), Some(2));
        });
    }

    #[test]
    fn stream_resolves_lazily() {
        async_std::task::block_on(async move {
            let (collection, _) = collection().await;
            let entries: Vec<Entry> = collection.stream().collect().await;
            assert_eq!(entries.len(), 3);
            assert!(entries.iter().all(|e| e.has_value()));
        });
    }

    #[test]
    fn keyed_reload_fetches_the_target_then_the_key_only() {
        async_std::task::block_on(async move {
            let (collection, client) = collection().await;
            collection.reload(&CancelToken::new()).await.expect("reload");
            let colors = collection.get_by_name_async("Colors").await.expect("colors");

            client
                .route("/plans?hotels=1,2", br#"[{"id":10},{"id":11},{"id":12}]"#)
                .await;
            let keys = vec!["Plans".to_string()];
            let outcome = collection
                .reload_filtered(ProviderFilter::All, Some(&keys), &CancelToken::new())
                .await
                .expect("keyed reload");
            assert_eq!(outcome, ReloadOutcome::Reloaded { resolved: 2, failed: 0 });

            let requested = client.requested().await;
            assert_eq!(&requested[2..], &["/hotels", "/plans?hotels=1,2"]);

            let plans = collection.get_by_name_async("Plans").await.expect("plans");
            assert_eq!(plans.value.len(), 3);

            // out of scope rows keep their entry as it was
            let after = collection.get_by_name_async("Colors").await.expect("colors");
            assert_eq!(after, colors);
        });
    }

    #[test]
    fn remove_during_a_reload_sticks() {
        async_std::task::block_on(async move {
            let (collection, _) = collection_with(MemoryUpstream::new().with_delay(Duration::from_millis(150))).await;
            let collection = Arc::new(collection);

            let reloader = collection.clone();
            let pass = async_std::task::spawn(async move { reloader.reload(&CancelToken::new()).await });

            async_std::task::sleep(Duration::from_millis(50)).await;
            assert!(collection.is_reloading());
            collection.remove("Colors").expect("removed");
            assert_eq!(collection.len(), 2);

            let outcome = pass.await.expect("reload");
            assert!(matches!(outcome, ReloadOutcome::Reloaded { .. }));
            assert_eq!(collection.position("Colors"), None);
            assert_eq!(collection.len(), 2);
            assert!(collection.snapshot().iter().all(|e| e.has_value()));
        });
    }

    #[test]
    fn add_during_a_reload_sticks() {
        async_std::task::block_on(async move {
            let (collection, _) = collection_with(MemoryUpstream::new().with_delay(Duration::from_millis(150))).await;
            let collection = Arc::new(collection);
            let colors = collection.remove("Colors").expect("removed");

            let reloader = collection.clone();
            let pass = async_std::task::spawn(async move { reloader.reload(&CancelToken::new()).await });

            async_std::task::sleep(Duration::from_millis(50)).await;
            collection.add(colors).expect("add");

            pass.await.expect("reload");
            assert_eq!(collection.len(), 3);
            assert_eq!(collection.position("Colors"), Some(2));
        });
    }
}

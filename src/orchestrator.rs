/// the orchestrator resolves entries against their providers, honouring `depends_on` ordering.
///
/// A pass runs in two stages. Dependency targets are fetched first, one distinct target at a
/// time, so their values can be substituted into dependent path templates. Every other row is
/// then fetched concurrently; rows served by the same batching upstream with the same
/// dependency keys share one round-trip. Row failures are recorded on the entry and never
/// cancel sibling rows.
///
use futures::future::join_all;
use futures::FutureExt;
use log::*;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::config::FetchConfig;
use crate::entry::{Entry, StaticValue};
use crate::error::{Result, StaticDataError};
use crate::provider::{FetchOutcome, FetchRequest, ProviderSet};
use crate::registry::{ProviderFilter, ProviderKind, SettingDescriptor, SettingRegistry};

/// the fetch plan of one row
#[derive(Debug, Clone)]
struct RowPlan<'a> {
    descriptor: &'a SettingDescriptor,
    requests: Vec<FetchRequest>,
    /// the dependency key list; rows with equal keys may share a batch
    keys: String,
    /// the target's name when it holds no usable value
    unresolved_dependency: Option<String>,
}

impl RowPlan<'_> {
    fn setting_key(&self) -> String {
        match self.requests.as_slice() {
            [single] => single.path.clone(),
            _ => self.descriptor.path.clone(),
        }
    }
}

/// the raw result of one row before decoding
#[derive(Debug)]
enum RowResult {
    Fetched(Vec<u8>),
    Failed(StaticDataError),
}

pub struct Orchestrator {
    registry: Arc<SettingRegistry>,
    providers: ProviderSet,
    version: String,
    fetch_timeout: Duration,
    batch_upstream: bool,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<SettingRegistry>,
        providers: ProviderSet,
        version: &str,
        config: &FetchConfig,
    ) -> Orchestrator {
        Orchestrator {
            registry,
            providers,
            version: version.to_string(),
            fetch_timeout: config.timeout(),
            batch_upstream: config.batch_upstream,
        }
    }

    pub fn registry(&self) -> &Arc<SettingRegistry> {
        &self.registry
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// resolve every row matched by the filter and keys; returns the updated copy of `current`.
    ///
    /// Entries outside the scope are returned untouched. Only cancellation is an error; it is
    /// checked before each dependency target and before the fan-out stage.
    pub async fn resolve_all(
        &self,
        filter: ProviderFilter,
        keys: Option<&[String]>,
        current: &[Entry],
        cancel: &CancelToken,
    ) -> Result<Vec<Entry>> {
        let mut entries = current.to_vec();
        let scope = self.registry.scope(filter, keys);
        let targets = self.registry.dependency_targets(&scope);

        debug!(
            "resolve pass: {} rows in scope, {} dependency targets",
            scope.len(),
            targets.len()
        );

        for name in targets.iter() {
            if cancel.is_cancelled() {
                return Err(StaticDataError::Cancelled);
            }

            let descriptor = match self.registry.get(name) {
                Some(d) => d,
                None => continue,
            };
            let idx = match position(&entries, name) {
                Some(idx) => idx,
                None => continue,
            };

            let dependency = dependency_of(&entries, descriptor);
            let updated = self
                .resolve_one(descriptor, Some(&entries[idx]), dependency.as_ref())
                .await;
            entries[idx] = updated;
        }

        if cancel.is_cancelled() {
            return Err(StaticDataError::Cancelled);
        }

        let plans: Vec<RowPlan> = scope
            .iter()
            .copied()
            .filter(|d| !targets.contains(&d.name))
            .filter(|d| position(&entries, &d.name).is_some())
            .map(|d| {
                let dependency = dependency_of(&entries, d);
                self.plan(d, dependency.as_ref())
            })
            .collect();

        let groups = self.group(plans);
        let results = join_all(groups.iter().map(|g| self.run_group(g))).await;

        for (plan, result) in groups.iter().flatten().zip(results.into_iter().flatten()) {
            if let Some(idx) = position(&entries, &plan.descriptor.name) {
                apply(&mut entries[idx], plan, result);
            }
        }

        Ok(entries)
    }

    /// resolve a single row given its prior entry and its dependency target's entry
    pub async fn resolve_one(
        &self,
        descriptor: &SettingDescriptor,
        prior: Option<&Entry>,
        dependency: Option<&Entry>,
    ) -> Entry {
        let mut entry = prior.cloned().unwrap_or_else(|| Entry::new(descriptor));
        let plan = self.plan(descriptor, dependency);
        let group = vec![plan];

        if let Some(result) = self.run_group(&group).await.into_iter().next() {
            apply(&mut entry, &group[0], result);
        }

        entry
    }

    fn plan<'a>(&self, descriptor: &'a SettingDescriptor, dependency: Option<&Entry>) -> RowPlan<'a> {
        let keys = dependency.map(|e| e.value.keys()).unwrap_or_default();
        let unresolved_dependency = descriptor
            .depends_on
            .clone()
            .filter(|_| dependency.map_or(true, |e| !e.has_value()));

        let requests = descriptor
            .render_paths(&self.version, &keys)
            .into_iter()
            .map(|path| FetchRequest::new(descriptor, path))
            .collect();

        RowPlan {
            descriptor,
            requests,
            keys: keys.join(","),
            unresolved_dependency,
        }
    }

    /// one group per row, except rows of a batching upstream that share dependency keys
    fn group<'a>(&self, plans: Vec<RowPlan<'a>>) -> Vec<Vec<RowPlan<'a>>> {
        let mut groups: Vec<Vec<RowPlan>> = vec![];

        for plan in plans {
            let kind = plan.descriptor.provider;
            if !self.batches(kind) {
                groups.push(vec![plan]);
                continue;
            }

            let shared = groups
                .iter()
                .position(|g| g[0].descriptor.provider == kind && g[0].keys == plan.keys);
            match shared {
                Some(idx) => groups[idx].push(plan),
                None => groups.push(vec![plan]),
            }
        }

        groups
    }

    fn batches(&self, kind: ProviderKind) -> bool {
        self.batch_upstream
            && kind.is_upstream()
            && self.providers.get(kind).map_or(false, |a| a.batches())
    }

    /// fetch every request of the group in as few calls as possible; one result per row
    async fn run_group(&self, group: &[RowPlan<'_>]) -> Vec<RowResult> {
        let kind = group[0].descriptor.provider;
        let names: Vec<&str> = group.iter().map(|p| p.descriptor.name.as_str()).collect();
        let requests: Vec<FetchRequest> = group.iter().flat_map(|p| p.requests.clone()).collect();

        let adapter = match self.providers.get(kind) {
            Some(adapter) => adapter,
            None => {
                warn!("no adapter registered for {}, rows: {:?}", kind, names);
                return group
                    .iter()
                    .map(|p| {
                        RowResult::Failed(StaticDataError::Unsupported {
                            setting: p.descriptor.name.clone(),
                            provider: kind,
                            message: String::from("no adapter registered"),
                        })
                    })
                    .collect();
            }
        };

        if requests.is_empty() {
            return group.iter().map(|p| RowResult::Failed(no_requests(p))).collect();
        }

        let call = async {
            if requests.len() == 1 {
                adapter.fetch(&requests[0]).await.map(|o| vec![o])
            } else {
                adapter.fetch_batch(&requests).await
            }
        };

        let outcomes = match async_std::future::timeout(
            self.fetch_timeout,
            AssertUnwindSafe(call).catch_unwind(),
        )
        .await
        {
            Ok(Ok(Ok(outcomes))) if outcomes.len() == requests.len() => Ok(outcomes),
            Ok(Ok(Ok(outcomes))) => Err(format!(
                "adapter returned {} outcomes for {} requests",
                outcomes.len(),
                requests.len()
            )),
            Ok(Ok(Err(e))) => Err(format!("{:#}", e)),
            Ok(Err(panic)) => Err(format!("adapter panicked: {}", panic_message(&*panic))),
            Err(_) => Err(format!("timed out after {:?}", self.fetch_timeout)),
        };

        let mut outcomes = match outcomes {
            Ok(outcomes) => outcomes.into_iter(),
            Err(message) => {
                error!("{} fetch failed for {:?}: {}", kind, names, message);
                return group
                    .iter()
                    .map(|p| {
                        RowResult::Failed(StaticDataError::ProviderUnavailable {
                            setting: p.descriptor.name.clone(),
                            provider: kind,
                            message: message.clone(),
                        })
                    })
                    .collect();
            }
        };

        group
            .iter()
            .map(|p| {
                let row: Vec<FetchOutcome> = outcomes.by_ref().take(p.requests.len()).collect();
                combine(p, row)
            })
            .collect()
    }
}

fn position(entries: &[Entry], name: &str) -> Option<usize> {
    entries.iter().position(|e| e.name == name)
}

fn dependency_of(entries: &[Entry], descriptor: &SettingDescriptor) -> Option<Entry> {
    descriptor
        .depends_on
        .as_deref()
        .and_then(|target| entries.iter().find(|e| e.name == target))
        .cloned()
}

fn no_requests(plan: &RowPlan) -> StaticDataError {
    match &plan.unresolved_dependency {
        Some(target) => StaticDataError::DependencyUnresolved {
            setting: plan.descriptor.name.clone(),
            target: target.clone(),
        },
        None => StaticDataError::EmptyResult {
            setting: plan.descriptor.name.clone(),
        },
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic")
    }
}

/// fold the outcomes of one row; fan-out rows concatenate their json arrays
fn combine(plan: &RowPlan, outcomes: Vec<FetchOutcome>) -> RowResult {
    if plan.requests.is_empty() {
        return RowResult::Failed(no_requests(plan));
    }

    let setting = plan.descriptor.name.clone();
    let provider = plan.descriptor.provider;

    let mut payloads: Vec<Vec<u8>> = vec![];
    for (request, outcome) in plan.requests.iter().zip(outcomes) {
        match outcome {
            FetchOutcome::Success { payload: Some(bytes) } => payloads.push(bytes),
            FetchOutcome::Success { payload: None } => {
                debug!("{} returned nothing for {}", request.path, setting)
            }
            FetchOutcome::Failure { message } => {
                return RowResult::Failed(StaticDataError::ProviderUnavailable {
                    setting,
                    provider,
                    message: format!("{}: {}", request.path, message),
                })
            }
            FetchOutcome::Unsupported { message } => {
                return RowResult::Failed(StaticDataError::Unsupported {
                    setting,
                    provider,
                    message,
                })
            }
        }
    }

    if !plan.descriptor.fans_out() {
        return match payloads.pop() {
            Some(bytes) => RowResult::Fetched(bytes),
            None => RowResult::Failed(StaticDataError::EmptyResult { setting }),
        };
    }

    let mut merged: Vec<Value> = vec![];
    for bytes in payloads {
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Array(items)) => merged.extend(items),
            Ok(Value::Null) => (),
            Ok(other) => merged.push(other),
            Err(source) => {
                return RowResult::Failed(StaticDataError::Deserialization {
                    setting,
                    resource_type: plan.descriptor.resource_type,
                    source,
                })
            }
        }
    }

    match serde_json::to_vec(&merged) {
        Ok(bytes) if !merged.is_empty() => RowResult::Fetched(bytes),
        _ => RowResult::Failed(StaticDataError::EmptyResult { setting }),
    }
}

/// decode and record a row result on its entry
fn apply(entry: &mut Entry, plan: &RowPlan, result: RowResult) {
    let name = plan.descriptor.name.clone();
    let setting_key = plan.setting_key();

    let outcome = match result {
        RowResult::Fetched(bytes) => match StaticValue::decode(plan.descriptor.resource_type, &bytes) {
            Ok(value) if value.is_empty() => Err(StaticDataError::EmptyResult { setting: name }),
            Ok(value) => Ok((bytes, value)),
            Err(source) => Err(StaticDataError::Deserialization {
                setting: name,
                resource_type: plan.descriptor.resource_type,
                source,
            }),
        },
        RowResult::Failed(err) => Err(err),
    };

    match outcome {
        Ok((bytes, value)) => {
            debug!("resolved {} ({} items)", entry.name, value.len());
            entry.succeed(setting_key, bytes, value);
        }
        Err(err) => {
            let message = match &plan.unresolved_dependency {
                Some(target) => format!(
                    "{}; {}",
                    StaticDataError::DependencyUnresolved {
                        setting: entry.name.clone(),
                        target: target.clone(),
                    },
                    err
                ),
                None => err.to_string(),
            };
            warn!("{} not resolved: {}", entry.name, message);
            entry.fail(setting_key, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::upstream::{MemoryUpstream, UpstreamAdapter};
    use crate::registry::ResourceType;

    fn orchestrator(rows: Vec<SettingDescriptor>, providers: ProviderSet) -> Orchestrator {
        let registry = Arc::new(SettingRegistry::new(rows).expect("registry"));
        Orchestrator::new(registry, providers, "v1", &FetchConfig::default())
    }

    fn fresh(o: &Orchestrator) -> Vec<Entry> {
        o.registry().iter().map(Entry::new).collect()
    }

    #[test]
    fn inline_rows_resolve_without_adapters() {
        async_std::task::block_on(async move {
            let rows = vec![
                SettingDescriptor::new("Colors", ProviderKind::Inline, "red,green")
                    .with_resource_type(ResourceType::StringList),
                SettingDescriptor::new("Blank", ProviderKind::Inline, ""),
            ];
            let o = orchestrator(rows, ProviderSet::new());
            let entries = o
                .resolve_all(ProviderFilter::All, None, &fresh(&o), &CancelToken::new())
                .await
                .expect("resolve");

            assert_eq!(entries[0].value, StaticValue::Strings(vec!["red".into(), "green".into()]));
            assert!(!entries[0].error);
            assert!(entries[1].error);
        });
    }

    #[test]
    fn missing_adapter_is_unsupported() {
        async_std::task::block_on(async move {
            let rows = vec![SettingDescriptor::new("Hotels", ProviderKind::Pms, "/hotels")];
            let o = orchestrator(rows, ProviderSet::new());
            let entry = o.resolve_one(&o.registry().iter().next().cloned().expect("row"), None, None).await;

            assert!(entry.error);
            assert!(entry.message.contains("does not support"));
        });
    }

    #[test]
    fn wrong_shape_is_a_deserialization_error() {
        async_std::task::block_on(async move {
            let client = Arc::new(MemoryUpstream::new());
            client.route("/hotels", br#"{"not":"a list"}"#).await;
            let providers = ProviderSet::new().with(Arc::new(UpstreamAdapter::new(ProviderKind::Pms, client)));

            let rows = vec![SettingDescriptor::new("Hotels", ProviderKind::Pms, "/hotels")
                .with_resource_type(ResourceType::IdList)];
            let o = orchestrator(rows, providers);
            let entries = o
                .resolve_all(ProviderFilter::All, None, &fresh(&o), &CancelToken::new())
                .await
                .expect("resolve");

            assert!(entries[0].error);
            assert_eq!(entries[0].value, StaticValue::Empty);
            assert!(entries[0].message.contains("not a valid id list"));
        });
    }

    #[test]
    fn filter_leaves_other_rows_untouched() {
        async_std::task::block_on(async move {
            let client = Arc::new(MemoryUpstream::new());
            client.route("/hotels", b"[1]").await;
            let providers = ProviderSet::new().with(Arc::new(UpstreamAdapter::new(ProviderKind::Pms, client)));

            let rows = vec![
                SettingDescriptor::new("Hotels", ProviderKind::Pms, "/hotels")
                    .with_resource_type(ResourceType::IdList),
                SettingDescriptor::new("Colors", ProviderKind::Inline, "red"),
            ];
            let o = orchestrator(rows, providers);
            let entries = o
                .resolve_all(
                    ProviderFilter::Only(ProviderKind::Inline),
                    None,
                    &fresh(&o),
                    &CancelToken::new(),
                )
                .await
                .expect("resolve");

            assert!(!entries[0].is_resolved());
            assert!(entries[1].is_resolved());
        });
    }

    #[test]
    fn cancelled_pass_is_an_error() {
        async_std::task::block_on(async move {
            let rows = vec![SettingDescriptor::new("Colors", ProviderKind::Inline, "red")];
            let o = orchestrator(rows, ProviderSet::new());
            let cancel = CancelToken::new();
            cancel.cancel();

            let result = o.resolve_all(ProviderFilter::All, None, &fresh(&o), &cancel).await;
            assert!(matches!(result, Err(StaticDataError::Cancelled)));
        });
    }
}

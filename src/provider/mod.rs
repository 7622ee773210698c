/// provider adapters: one per source kind, all answering the same fetch contract.
///
/// Adapters never decide what a payload means; they hand raw bytes back to the
/// orchestrator, which decodes them into the descriptor's resource type.
///
pub mod inline;
pub mod object_store;
pub mod upstream;

use anyhow::Result;
use async_trait::async_trait;
use hashbrown::HashMap;
use std::sync::Arc;

use crate::registry::{ProviderKind, ResourceType, SettingDescriptor};

/// one concrete fetch, derived from a descriptor and its rendered path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub setting: String,
    pub provider: ProviderKind,
    pub resource_type: ResourceType,
    pub path: String,
}

impl FetchRequest {
    pub fn new(descriptor: &SettingDescriptor, path: String) -> FetchRequest {
        FetchRequest {
            setting: descriptor.name.clone(),
            provider: descriptor.provider,
            resource_type: descriptor.resource_type,
            path,
        }
    }
}

/// the transient result of a provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// the call succeeded; `None` means the source had nothing to return
    Success { payload: Option<Vec<u8>> },
    Failure { message: String },
    /// the adapter cannot serve this kind of request
    Unsupported { message: String },
}

impl FetchOutcome {
    pub fn success(payload: Vec<u8>) -> FetchOutcome {
        FetchOutcome::Success {
            payload: Some(payload),
        }
    }

    pub fn empty() -> FetchOutcome {
        FetchOutcome::Success { payload: None }
    }

    pub fn failure(message: impl Into<String>) -> FetchOutcome {
        FetchOutcome::Failure {
            message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> FetchOutcome {
        FetchOutcome::Unsupported {
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success { .. })
    }
}

/// the uniform adapter contract; an `Err` is treated like a thrown provider failure
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn fetch(&self, request: &FetchRequest) -> Result<FetchOutcome>;

    /// fetch several requests; adapters that can batch override this with a single round-trip
    async fn fetch_batch(&self, requests: &[FetchRequest]) -> Result<Vec<FetchOutcome>> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            outcomes.push(self.fetch(request).await?);
        }
        Ok(outcomes)
    }

    /// true when `fetch_batch` is a single round-trip
    fn batches(&self) -> bool {
        false
    }
}

/// the adapters available to the orchestrator, keyed by provider kind
#[derive(Clone, Default)]
pub struct ProviderSet {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
}

impl ProviderSet {
    /// a set that already carries the inline-literal adapter
    pub fn new() -> ProviderSet {
        ProviderSet::default().with(Arc::new(inline::InlineAdapter::new()))
    }

    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.insert(adapter);
        self
    }

    pub fn insert(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        ProviderKind::ALL
            .iter()
            .filter(|k| self.adapters.contains_key(*k))
            .copied()
            .collect()
    }
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSet")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_carries_inline() {
        let set = ProviderSet::new();
        assert_eq!(set.kinds(), vec![ProviderKind::Inline]);
        assert!(set.get(ProviderKind::Pms).is_none());
    }

    #[test]
    fn default_batch_is_sequential() {
        async_std::task::block_on(async move {
            let adapter = inline::InlineAdapter::new();
            let d = SettingDescriptor::new("Colors", ProviderKind::Inline, "red,blue");
            let requests = vec![
                FetchRequest::new(&d, "red,blue".to_string()),
                FetchRequest::new(&d, "[1]".to_string()),
            ];

            let outcomes = adapter
                .fetch_batch(&requests)
                .await
                .expect("inline batch should not fail");
            assert_eq!(outcomes.len(), 2);
            assert!(outcomes.iter().all(|o| o.is_success()));
            assert!(!adapter.batches());
        });
    }
}

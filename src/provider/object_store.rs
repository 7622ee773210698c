/// object-store provider: opaque json documents keyed by `{version}/{setting}.json`
///
use anyhow::{Context, Result};
use async_std::path::PathBuf;
use async_std::sync::RwLock;
use async_trait::async_trait;
use hashbrown::HashMap;
use log::*;
use std::sync::Arc;

use super::{FetchOutcome, FetchRequest, ProviderAdapter};
use crate::registry::ProviderKind;

/// the narrow contract of a durable object store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
}

/// in-process object store; also the stand-in for tests and local runs
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> MemoryObjectStore {
        MemoryObjectStore::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.write().await.remove(key)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.objects.write().await.insert(key.to_string(), bytes);
        Ok(())
    }
}

/// object store rooted at a local directory; keys map to relative file paths
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> FsObjectStore {
        FsObjectStore { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path_for(key).is_file().await)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        if !path.is_file().await {
            return Ok(None);
        }

        let bytes = async_std::fs::read(&path)
            .await
            .with_context(|| format!("reading object {}", path.display()))?;
        Ok(Some(bytes))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            async_std::fs::create_dir_all(parent).await?;
        }
        async_std::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing object {}", path.display()))?;
        Ok(())
    }
}

pub struct ObjectStoreAdapter {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreAdapter {
    pub fn new(store: Arc<dyn ObjectStore>) -> ObjectStoreAdapter {
        ObjectStoreAdapter { store }
    }
}

#[async_trait]
impl ProviderAdapter for ObjectStoreAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ObjectStore
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<FetchOutcome> {
        if !self.store.exists(&request.path).await? {
            warn!("object {} for {} does not exist", request.path, request.setting);
            return Ok(FetchOutcome::failure(format!(
                "object {} does not exist",
                request.path
            )));
        }

        let outcome = match self.store.get(&request.path).await? {
            Some(bytes) if !bytes.is_empty() => FetchOutcome::success(bytes),
            _ => FetchOutcome::empty(),
        };

        Ok(outcome)
    }
}

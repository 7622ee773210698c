/// upstream REST providers: property management, content management and catalog back ends
///
use anyhow::{anyhow, Result};
use async_std::sync::RwLock;
use async_trait::async_trait;
use hashbrown::HashMap;
use log::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{FetchOutcome, FetchRequest, ProviderAdapter};
use crate::registry::ProviderKind;

/// the envelope every upstream client returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub success: bool,
    pub value: Option<Vec<u8>>,
    pub message: String,
}

impl ApiResponse {
    pub fn ok(value: Vec<u8>) -> ApiResponse {
        ApiResponse {
            success: true,
            value: Some(value),
            message: String::from("ok"),
        }
    }

    pub fn error(message: &str) -> ApiResponse {
        ApiResponse {
            success: false,
            value: None,
            message: message.to_string(),
        }
    }
}

impl From<ApiResponse> for FetchOutcome {
    fn from(resp: ApiResponse) -> Self {
        if resp.success {
            FetchOutcome::Success {
                payload: resp.value.filter(|v| !v.is_empty()),
            }
        } else {
            FetchOutcome::failure(resp.message)
        }
    }
}

/// the narrow contract of an upstream api client
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn get(&self, path: &str) -> Result<ApiResponse>;

    /// several paths; clients with a batch endpoint answer in one round-trip
    async fn get_batch(&self, paths: &[String]) -> Result<Vec<ApiResponse>> {
        let mut responses = Vec::with_capacity(paths.len());
        for path in paths {
            responses.push(self.get(path).await?);
        }
        Ok(responses)
    }

    fn supports_batch(&self) -> bool {
        false
    }
}

pub struct UpstreamAdapter {
    kind: ProviderKind,
    client: Arc<dyn UpstreamClient>,
}

impl UpstreamAdapter {
    pub fn new(kind: ProviderKind, client: Arc<dyn UpstreamClient>) -> UpstreamAdapter {
        UpstreamAdapter { kind, client }
    }
}

#[async_trait]
impl ProviderAdapter for UpstreamAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<FetchOutcome> {
        if !self.kind.is_upstream() {
            return Ok(FetchOutcome::unsupported(format!(
                "{} is not an upstream system",
                self.kind
            )));
        }

        let resp = self.client.get(&request.path).await?;
        if !resp.success {
            warn!("{} get {} failed: {}", self.kind, request.path, resp.message);
        }

        Ok(resp.into())
    }

    async fn fetch_batch(&self, requests: &[FetchRequest]) -> Result<Vec<FetchOutcome>> {
        let paths: Vec<String> = requests.iter().map(|r| r.path.clone()).collect();
        let responses = self.client.get_batch(&paths).await?;
        if responses.len() != paths.len() {
            return Err(anyhow!(
                "{} batch returned {} responses for {} paths",
                self.kind,
                responses.len(),
                paths.len()
            ));
        }

        Ok(responses.into_iter().map(FetchOutcome::from).collect())
    }

    fn batches(&self) -> bool {
        self.client.supports_batch()
    }
}

/// a scripted in-process client: answers from a route table and counts round-trips
#[derive(Debug, Default)]
pub struct MemoryUpstream {
    routes: RwLock<HashMap<String, ApiResponse>>,
    requested: RwLock<Vec<String>>,
    round_trips: AtomicUsize,
    batching: bool,
    delay: Option<Duration>,
}

impl MemoryUpstream {
    pub fn new() -> MemoryUpstream {
        MemoryUpstream::default()
    }

    /// answer batch calls in a single round-trip
    pub fn with_batching(mut self) -> Self {
        self.batching = true;
        self
    }

    /// simulate network latency on every round-trip
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn route(&self, path: &str, body: &[u8]) {
        self.routes
            .write()
            .await
            .insert(path.to_string(), ApiResponse::ok(body.to_vec()));
    }

    pub async fn fail(&self, path: &str, message: &str) {
        self.routes
            .write()
            .await
            .insert(path.to_string(), ApiResponse::error(message));
    }

    pub fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::SeqCst)
    }

    /// every path requested so far, in arrival order
    pub async fn requested(&self) -> Vec<String> {
        self.requested.read().await.clone()
    }

    async fn answer(&self, path: &str) -> ApiResponse {
        self.requested.write().await.push(path.to_string());
        match self.routes.read().await.get(path) {
            Some(resp) => resp.clone(),
            None => ApiResponse::error(&format!("404 not found: {}", path)),
        }
    }

    async fn wait(&self) {
        if let Some(delay) = self.delay {
            async_std::task::sleep(delay).await;
        }
    }
}

#[async_trait]
impl UpstreamClient for MemoryUpstream {
    async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        self.wait().await;
        Ok(self.answer(path).await)
    }

    async fn get_batch(&self, paths: &[String]) -> Result<Vec<ApiResponse>> {
        if !self.batching {
            let mut responses = Vec::with_capacity(paths.len());
            for path in paths {
                responses.push(self.get(path).await?);
            }
            return Ok(responses);
        }

        self.round_trips.fetch_add(1, Ordering::SeqCst);
        self.wait().await;
        let mut responses = Vec::with_capacity(paths.len());
        for path in paths {
            responses.push(self.answer(path).await);
        }
        Ok(responses)
    }

    fn supports_batch(&self) -> bool {
        self.batching
    }
}

use anyhow::{anyhow, Result};
use async_channel::{bounded, unbounded, Receiver, Sender};
use domain_keys::keys::RouteKey;
use hashbrown::HashMap;
use log::*;
use serde_json::Value;
use service_uptime::Uptime;
use std::time::{Duration, Instant};

use crate::worker::{JsonString, WorkerState, WorkerStatus, OK};

/// why a record left the hot tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Expired,
    Removed,
}

/// published on the eviction channel whenever a record expires or is removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub key: String,
    pub reason: EvictionReason,
}

#[derive(Debug, Clone)]
pub struct CacheRecord {
    pub value: Value,
    pub expires_at: Instant,
}

impl CacheRecord {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    Set(String, Value, Duration, Sender<Option<Value>>),
    Get(String, Sender<Option<Value>>),
    Remove(String, Sender<Option<Value>>),
    Keys(Sender<Vec<String>>),
    Len(Sender<usize>),
    Sweep(Option<Sender<usize>>), // drop expired records
    Status(Sender<JsonString>),   // request the worker's status
    Shutdown,
}

// the handler loop; owns the hot map
pub async fn handler(id: String, rx: Receiver<Command>, evictions: Sender<Eviction>) -> Result<()> {
    let uptime = Uptime::new();
    let mut state = WorkerState::Idle;
    let mut error_count = 0u16;

    let mut cache: HashMap<String, CacheRecord> = HashMap::new();

    while let Ok(cmd) = rx.recv().await {
        match cmd {
            Command::Set(key, value, ttl, tx) => {
                debug!("set key: {}, ttl: {:?}", key, ttl);
                let record = CacheRecord {
                    value,
                    expires_at: Instant::now() + ttl,
                };
                let previous = cache.insert(key, record).map(|r| r.value);
                error_count += send_optional_response(previous, tx).await;
            }
            Command::Get(key, tx) => {
                let now = Instant::now();
                let value = match cache.get(&key).map(|r| r.is_expired(now)) {
                    Some(true) => {
                        cache.remove(&key);
                        notify(&evictions, key, EvictionReason::Expired).await;
                        None
                    }
                    Some(false) => cache.get(&key).map(|r| r.value.clone()),
                    None => None,
                };
                error_count += send_optional_response(value, tx).await;
            }
            Command::Remove(key, tx) => {
                debug!("remove key: {}", key);
                let value = cache.remove(&key).map(|r| r.value);
                if value.is_some() {
                    notify(&evictions, key, EvictionReason::Removed).await;
                }
                error_count += send_optional_response(value, tx).await;
            }
            Command::Keys(tx) => {
                let list: Vec<String> = cache.keys().cloned().collect();
                if tx.send(list).await.is_err() {
                    error_count += 1;
                    error!("error returning keys");
                }
            }
            Command::Len(tx) => {
                let sz = cache.len();
                if tx.send(sz).await.is_err() {
                    error_count += 1;
                }
            }
            Command::Sweep(tx) => {
                state = WorkerState::Busy;
                let now = Instant::now();
                let expired: Vec<String> = cache
                    .iter()
                    .filter(|(_, r)| r.is_expired(now))
                    .map(|(k, _)| k.clone())
                    .collect();

                for key in expired.iter() {
                    cache.remove(key);
                    notify(&evictions, key.clone(), EvictionReason::Expired).await;
                }

                if !expired.is_empty() {
                    info!("worker {} swept {} expired records", id, expired.len());
                }
                if let Some(tx) = tx {
                    if tx.send(expired.len()).await.is_err() {
                        error_count += 1;
                    }
                }
                state = WorkerState::Idle;
            }
            Command::Status(tx) => {
                let status = WorkerStatus::new(
                    id.to_string(),
                    OK.to_string(),
                    state.clone(),
                    uptime.to_string(),
                    error_count,
                );

                let msg = status.to_json();
                debug!("status response: {}", msg);
                if tx.send(msg).await.is_err() {
                    error_count += 1;
                    error!("error returning status to channel: {:?}", tx);
                }
            }
            Command::Shutdown => {
                state = WorkerState::Shutdown;
                info!("worker id: {}, state: {:?}", id, state);
                break;
            }
        }
    }

    // helper functions
    async fn send_optional_response(msg: Option<Value>, tx: Sender<Option<Value>>) -> u16 {
        if let Err(e) = tx.send(msg).await {
            error!("error sending message: {:?}", e);
            1u16
        } else {
            0u16
        }
    }

    async fn notify(evictions: &Sender<Eviction>, key: String, reason: EvictionReason) {
        debug!("evicted key: {}, reason: {:?}", key, reason);
        if evictions.send(Eviction { key, reason }).await.is_err() {
            debug!("no eviction listener");
        }
    }

    rx.close();

    Ok(())
}

/// the hot tier: a handle to a background worker that owns the map.
///
/// Every clone talks to the same worker; all access is serialized through its command channel,
/// so callers need no locking of their own.
#[derive(Debug, Clone)]
pub struct MemoryTier {
    id: String,
    uptime: Uptime,
    request_tx: Sender<Command>,
}

impl MemoryTier {
    /// create and start a new worker plus its sweeper; returns the eviction receiver
    pub fn start(sweep_interval: Duration) -> (MemoryTier, Receiver<Eviction>) {
        let uptime = Uptime::new();
        let id = RouteKey::create();

        // this is for the tier struct
        let wid = id.clone();

        info!("starting up memory tier worker, id: {}", id);

        let (request_tx, request_receiver) = bounded(250);
        let (eviction_tx, eviction_rx) = unbounded();

        // run the handler loop as a background task
        async_std::task::spawn(async move {
            match handler(id.clone(), request_receiver, eviction_tx).await {
                Ok(()) => info!("worker handler exit for worker id: {}", id),
                Err(e) => error!("worker exit with error: {:?}", e),
            }
        });

        // the sweeper stops once the worker closes its channel
        let sweep_tx = request_tx.clone();
        async_std::task::spawn(async move {
            loop {
                async_std::task::sleep(sweep_interval).await;
                if sweep_tx.send(Command::Sweep(None)).await.is_err() {
                    break;
                }
            }
        });

        let tier = MemoryTier {
            id: wid,
            uptime,
            request_tx,
        };

        (tier, eviction_rx)
    }

    /// return the worker's id
    pub fn id(&self) -> String {
        self.id.to_string()
    }

    /// return the worker's uptime
    pub fn get_uptime(&self) -> String {
        self.uptime.to_string()
    }

    async fn request<T>(&self, make: impl FnOnce(Sender<T>) -> Command) -> Result<T> {
        let (responder, rx) = bounded(1);
        self.request_tx
            .send(make(responder))
            .await
            .map_err(|_| anyhow!("memory tier worker {} is shut down", self.id))?;
        rx.recv()
            .await
            .map_err(|_| anyhow!("memory tier worker {} dropped the request", self.id))
    }

    /// insert or replace; returns the previous value
    pub async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<Option<Value>> {
        self.request(|tx| Command::Set(key.to_string(), value, ttl, tx))
            .await
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.request(|tx| Command::Get(key.to_string(), tx)).await
    }

    /// remove and publish a `Removed` eviction when the key was present
    pub async fn remove(&self, key: &str) -> Result<Option<Value>> {
        self.request(|tx| Command::Remove(key.to_string(), tx)).await
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        self.request(Command::Keys).await
    }

    pub async fn len(&self) -> Result<usize> {
        self.request(Command::Len).await
    }

    /// expire records now; returns the number evicted
    pub async fn sweep(&self) -> Result<usize> {
        self.request(|tx| Command::Sweep(Some(tx))).await
    }

    pub async fn status(&self) -> Result<WorkerStatus> {
        let js = self.request(Command::Status).await?;
        Ok(serde_json::from_str(&js)?)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request_tx
            .send(Command::Shutdown)
            .await
            .map_err(|_| anyhow!("memory tier worker {} already shut down", self.id))
    }

    pub fn is_shutdown(&self) -> bool {
        self.request_tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn start() {
        async_std::task::block_on(async move {
            let (tier, _evictions) = MemoryTier::start(Duration::from_secs(60));
            assert_eq!(tier.id().len(), 16);

            let status = tier.status().await.expect("status should respond");
            assert_eq!(status.worker_id, tier.id());
            assert_eq!(status.status, OK);
            assert_eq!(status.state, WorkerState::Idle);
            assert_eq!(status.error_count, 0);

            assert!(tier.shutdown().await.is_ok());
        });
    }

    #[test]
    fn set_get_remove() {
        async_std::task::block_on(async move {
            let (tier, evictions) = MemoryTier::start(Duration::from_secs(60));
            let ttl = Duration::from_secs(60);

            assert_eq!(tier.len().await.expect("len"), 0);

            let key = "Hotels";
            let prev = tier.set(key, json!([1, 2, 3]), ttl).await.expect("set");
            assert_eq!(prev, None);
            assert_eq!(tier.len().await.expect("len"), 1);
            assert_eq!(tier.keys().await.expect("keys"), vec![key.to_string()]);

            let prev = tier.set(key, json!([4]), ttl).await.expect("set");
            assert_eq!(prev, Some(json!([1, 2, 3])));
            assert!(evictions.is_empty());

            let v = tier.get(key).await.expect("get");
            assert_eq!(v, Some(json!([4])));

            let v = tier.remove(key).await.expect("remove");
            assert_eq!(v, Some(json!([4])));
            assert_eq!(tier.len().await.expect("len"), 0);

            let evicted = evictions.recv().await.expect("eviction");
            assert_eq!(evicted.key, key);
            assert_eq!(evicted.reason, EvictionReason::Removed);

            // removing a missing key publishes nothing
            assert_eq!(tier.remove(key).await.expect("remove"), None);
            assert!(evictions.is_empty());

            assert!(tier.shutdown().await.is_ok());
        });
    }

    #[test]
    fn expired_records_are_evicted() {
        async_std::task::block_on(async move {
            let (tier, evictions) = MemoryTier::start(Duration::from_secs(60));

            tier.set("Short", json!("a"), Duration::from_millis(10)).await.expect("set");
            tier.set("Other", json!("b"), Duration::from_millis(10)).await.expect("set");
            tier.set("Long", json!("c"), Duration::from_secs(60)).await.expect("set");
            async_std::task::sleep(Duration::from_millis(30)).await;

            // lazily on read
            assert_eq!(tier.get("Short").await.expect("get"), None);
            let evicted = evictions.recv().await.expect("eviction");
            assert_eq!(evicted.key, "Short");
            assert_eq!(evicted.reason, EvictionReason::Expired);

            // and in bulk on sweep
            assert_eq!(tier.sweep().await.expect("sweep"), 1);
            assert_eq!(evictions.recv().await.expect("eviction").key, "Other");
            assert_eq!(tier.len().await.expect("len"), 1);

            assert!(tier.shutdown().await.is_ok());
        });
    }

    #[test]
    fn sweeper_runs_in_background() {
        async_std::task::block_on(async move {
            let (tier, evictions) = MemoryTier::start(Duration::from_millis(20));
            tier.set("Short", json!(1), Duration::from_millis(5)).await.expect("set");

            let evicted = async_std::future::timeout(Duration::from_secs(2), evictions.recv())
                .await
                .expect("sweeper should evict within the timeout")
                .expect("eviction");
            assert_eq!(evicted.key, "Short");

            assert!(tier.shutdown().await.is_ok());
        });
    }

    #[test]
    fn requests_fail_after_shutdown() {
        async_std::task::block_on(async move {
            let (tier, _evictions) = MemoryTier::start(Duration::from_secs(60));
            tier.shutdown().await.expect("shutdown");

            // the handler closes its receiver on the way out
            async_std::task::sleep(Duration::from_millis(20)).await;
            assert!(tier.is_shutdown());
            assert!(tier.get("x").await.is_err());
        });
    }
}

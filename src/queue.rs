/// bounded fifo of per-setting reload tasks, drained by a single worker.
///
/// Every enqueue releases one permit on a counting signal (an unbounded channel of `()`), and
/// a dequeue takes a permit before popping, so the consumer sleeps instead of polling and the
/// permit count never runs ahead of the queue.
///
use async_channel::{Receiver, Sender};
use futures::future::{self, BoxFuture, Either};
use futures::FutureExt;
use log::*;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::cancel::CancelToken;
use crate::error::{Result, StaticDataError};

pub type ReloadAction = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

pub struct ReloadTask {
    pub setting_key: String,
    pub enqueued_at: Instant,
    action: ReloadAction,
}

impl ReloadTask {
    pub fn new<F, Fut>(setting_key: &str, action: F) -> ReloadTask
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        ReloadTask {
            setting_key: setting_key.to_string(),
            enqueued_at: Instant::now(),
            action: Box::new(move || action().boxed()),
        }
    }

    /// consume the task and run its body
    pub async fn run(self) {
        (self.action)().await
    }
}

impl fmt::Debug for ReloadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadTask")
            .field("setting_key", &self.setting_key)
            .field("enqueued_at", &self.enqueued_at)
            .finish()
    }
}

#[derive(Debug)]
pub struct ReloadTaskQueue {
    tasks: Mutex<VecDeque<ReloadTask>>,
    permits_tx: Sender<()>,
    permits_rx: Receiver<()>,
    capacity: usize,
}

impl ReloadTaskQueue {
    pub fn new(capacity: usize) -> ReloadTaskQueue {
        let (permits_tx, permits_rx) = async_channel::unbounded();
        ReloadTaskQueue {
            tasks: Mutex::new(VecDeque::new()),
            permits_tx,
            permits_rx,
            capacity: capacity.max(1),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, VecDeque<ReloadTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self) {
        if self.permits_tx.try_send(()).is_err() {
            warn!("reload queue signal is closed");
        }
    }

    /// append a task; duplicates for the same key are accepted
    pub fn enqueue<F, Fut>(&self, setting_key: &str, action: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.enqueue_task(ReloadTask::new(setting_key, action))
    }

    pub fn enqueue_task(&self, task: ReloadTask) -> Result<()> {
        {
            let mut tasks = self.tasks();
            if tasks.len() >= self.capacity {
                warn!("reload queue full, dropping task for {}", task.setting_key);
                return Err(StaticDataError::QueueFull {
                    capacity: self.capacity,
                });
            }
            debug!("enqueue reload task for {}", task.setting_key);
            tasks.push_back(task);
        }

        self.release();
        Ok(())
    }

    /// append only when no task for the key is pending; the check and the push share one lock.
    /// Returns false when a task was already pending.
    pub fn enqueue_unique(&self, task: ReloadTask) -> Result<bool> {
        {
            let mut tasks = self.tasks();
            if tasks.iter().any(|t| t.setting_key == task.setting_key) {
                debug!("reload for {} already pending", task.setting_key);
                return Ok(false);
            }
            if tasks.len() >= self.capacity {
                return Err(StaticDataError::QueueFull {
                    capacity: self.capacity,
                });
            }
            tasks.push_back(task);
        }

        self.release();
        Ok(true)
    }

    /// wait for the next task; `None` once cancelled or closed
    pub async fn dequeue(&self, cancel: &CancelToken) -> Option<ReloadTask> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let permit = Box::pin(self.permits_rx.recv());
            let cancelled = Box::pin(cancel.cancelled());

            match future::select(permit, cancelled).await {
                Either::Left((Ok(()), _)) => {
                    let next = self.tasks().pop_front();
                    if next.is_some() {
                        return next;
                    }
                }
                Either::Left((Err(_), _)) => return None,
                Either::Right(_) => return None,
            }
        }
    }

    /// take the next task without waiting
    pub fn try_dequeue(&self) -> Option<ReloadTask> {
        match self.permits_rx.try_recv() {
            Ok(()) => self.tasks().pop_front(),
            Err(_) => None,
        }
    }

    pub fn contains(&self, setting_key: &str) -> bool {
        self.tasks().iter().any(|t| t.setting_key == setting_key)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks().is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// pending keys in arrival order
    pub fn pending(&self) -> Vec<String> {
        self.tasks().iter().map(|t| t.setting_key.clone()).collect()
    }

    /// stop accepting permits; a blocked dequeue returns `None`
    pub fn close(&self) {
        self.permits_tx.close();
    }
}

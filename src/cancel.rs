/// cooperative cancellation shared by the background loops.
///
/// The token is a channel nobody ever sends on; cancelling closes it, which wakes every
/// pending `recv` at once.
///
use async_channel::{Receiver, Sender};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}

impl CancelToken {
    pub fn new() -> CancelToken {
        let (tx, rx) = async_channel::bounded(1);
        CancelToken { tx, rx }
    }

    /// request cancellation; idempotent
    pub fn cancel(&self) {
        self.tx.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.is_closed()
    }

    /// resolves once the token is cancelled
    pub async fn cancelled(&self) {
        while self.rx.recv().await.is_ok() {}
    }

    /// sleep for the duration unless cancelled first; returns true when cancelled
    pub async fn sleep(&self, duration: Duration) -> bool {
        async_std::future::timeout(duration, self.cancelled())
            .await
            .is_ok()
    }
}

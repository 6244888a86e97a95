use std::sync::Arc;

use tokio::sync::watch;

/// Cooperative stop flag shared between an action and whoever cancels it.
///
/// Cheap to poll with `is_triggered()` once per cycle, and awaitable with
/// `triggered()` inside `select!`.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal is (or already was) triggered.
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close while we wait.
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

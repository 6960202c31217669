//! Cooperative cancellation for indexing tasks.
//!
//! A watch channel carries a single boolean; the handle flips it, tokens
//! observe it. Indexing checks the token between major stages (chunking,
//! embedding, writing), so cancellation lands at a stage boundary.

use tokio::sync::watch;

/// A token that can be used to signal cancellation across async tasks.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    receiver: watch::Receiver<bool>,
}

/// Handle to trigger cancellation.
#[derive(Debug)]
pub struct CancellationHandle {
    sender: watch::Sender<bool>,
}

impl CancellationToken {
    /// Create a new cancellation token and its handle.
    pub fn new() -> (Self, CancellationHandle) {
        let (tx, rx) = watch::channel(false);
        (Self { receiver: rx }, CancellationHandle { sender: tx })
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait asynchronously until cancellation is requested. Resolves
    /// immediately if the handle was dropped.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        while !*receiver.borrow() {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new().0
    }
}

impl CancellationHandle {
    /// Signal cancellation to all associated tokens.
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

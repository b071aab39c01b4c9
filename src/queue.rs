//! Work queue between admission and the worker pool.
//!
//! The payload is the execution id only, never the code — a worker always
//! re-reads current record state instead of trusting what was enqueued.
//! Delivery is at-least-once: redelivered or replayed ids are harmless
//! because workers skip records that are already terminal.

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Mutex};

/// Queue handle shared by the admission controller (enqueue side) and the
/// worker pool (dequeue side).
pub struct ExecutionQueue {
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Push an execution id onto the queue.
    pub fn enqueue(&self, execution_id: &str) -> Result<()> {
        self.tx
            .send(execution_id.to_string())
            .context("execution queue is closed")
    }

    /// Pull the next execution id. Returns `None` once the queue is closed
    /// and drained, which shuts the calling worker down.
    pub async fn dequeue(&self) -> Option<String> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }
}

impl Default for ExecutionQueue {
    fn default() -> Self {
        Self::new()
    }
}

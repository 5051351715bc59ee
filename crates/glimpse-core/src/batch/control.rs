//! Batch status shared between a handle and its running task.
//!
//! The status lives in a `watch` channel. Transitions use `send_if_modified`
//! so a request that doesn't apply (pause while paused, resume after stop)
//! changes nothing and wakes nobody. The task blocks on the channel while
//! paused instead of polling.

use std::sync::Arc;
use tokio::sync::watch;

use crate::types::BatchStatus;

#[derive(Debug, Clone)]
pub(crate) struct BatchControl {
    tx: Arc<watch::Sender<BatchStatus>>,
}

impl BatchControl {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(BatchStatus::Running);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn status(&self) -> BatchStatus {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<BatchStatus> {
        self.tx.subscribe()
    }

    fn transition(&self, from: &[BatchStatus], to: BatchStatus) -> bool {
        self.tx.send_if_modified(|status| {
            if from.contains(status) {
                *status = to;
                true
            } else {
                false
            }
        })
    }

    /// Running → Paused.
    pub(crate) fn pause(&self) -> bool {
        self.transition(&[BatchStatus::Running], BatchStatus::Paused)
    }

    /// Paused → Running.
    pub(crate) fn resume(&self) -> bool {
        self.transition(&[BatchStatus::Paused], BatchStatus::Running)
    }

    /// Running | Paused → Stopped. Wakes a paused task.
    pub(crate) fn stop(&self) -> bool {
        self.transition(
            &[BatchStatus::Running, BatchStatus::Paused],
            BatchStatus::Stopped,
        )
    }

    /// Queue exhausted. A batch paused at that moment still completes.
    pub(crate) fn complete(&self) -> bool {
        self.transition(
            &[BatchStatus::Running, BatchStatus::Paused],
            BatchStatus::Completed,
        )
    }

    /// Wait until the batch is no longer paused and return the new status.
    pub(crate) async fn wait_while_paused(&self) -> BatchStatus {
        let mut rx = self.tx.subscribe();
        // Bound so the `watch::Ref` is dropped before `rx`
        let status = match rx.wait_for(|status| *status != BatchStatus::Paused).await {
            Ok(status) => *status,
            // Unreachable while `self` holds the sender
            Err(_) => BatchStatus::Stopped,
        };
        status
    }
}

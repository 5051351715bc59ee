//! Caller-side handle to a running batch.

use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::control::BatchControl;
use super::events::{dispatch, BatchEvent, BatchObserver};
use crate::error::{GlimpseError, Result};
use crate::types::{BatchStatus, BatchSummary};
use crate::usage::UsageSnapshot;

/// Controls and observes one submitted batch.
///
/// Events are buffered from the moment the batch starts, so a subscriber
/// that attaches late still sees every event. The stream can be taken once,
/// either raw with [`BatchHandle::events`] or through an observer with
/// [`BatchHandle::subscribe`].
pub struct BatchHandle {
    control: BatchControl,
    events: Mutex<Option<mpsc::UnboundedReceiver<BatchEvent>>>,
    usage: watch::Receiver<UsageSnapshot>,
    task: JoinHandle<BatchSummary>,
    total: usize,
}

impl BatchHandle {
    pub(crate) fn new(
        control: BatchControl,
        events: mpsc::UnboundedReceiver<BatchEvent>,
        usage: watch::Receiver<UsageSnapshot>,
        task: JoinHandle<BatchSummary>,
        total: usize,
    ) -> Self {
        Self {
            control,
            events: Mutex::new(Some(events)),
            usage,
            task,
            total,
        }
    }

    /// Pause before the next job. Returns false when not running.
    pub fn pause(&self) -> bool {
        self.control.pause()
    }

    /// Resume a paused batch. Returns false when not paused.
    pub fn resume(&self) -> bool {
        self.control.resume()
    }

    /// Stop after the job in flight. Terminal; wakes a paused batch.
    pub fn stop(&self) -> bool {
        self.control.stop()
    }

    pub fn status(&self) -> BatchStatus {
        self.control.status()
    }

    /// Status updates as a `watch` stream.
    pub fn status_changes(&self) -> watch::Receiver<BatchStatus> {
        self.control.subscribe()
    }

    /// Number of jobs submitted.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Take the raw event stream.
    pub fn events(&self) -> Result<mpsc::UnboundedReceiver<BatchEvent>> {
        self.events
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or(GlimpseError::AlreadySubscribed)
    }

    /// Forward every event to `observer` on a background task. The task
    /// ends after the final event.
    pub fn subscribe(&self, observer: Arc<dyn BatchObserver>) -> Result<JoinHandle<()>> {
        let mut events = self.events()?;
        Ok(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                dispatch(observer.as_ref(), &event);
                if event.is_final() {
                    break;
                }
            }
        }))
    }

    /// Usage aggregated so far. Never blocks on the batch.
    pub fn usage_snapshot(&self) -> UsageSnapshot {
        self.usage.borrow().clone()
    }

    /// Wait for the batch to end and return its summary.
    pub async fn wait(self) -> Result<BatchSummary> {
        self.task
            .await
            .map_err(|e| GlimpseError::BatchAborted(e.to_string()))
    }
}

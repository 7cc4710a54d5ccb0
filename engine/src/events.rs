//! The reactive change bus and debounced watches.
//!
//! Every committed mutation publishes a [`ChangeEvent`]. A watch subscribes
//! to the bus, re-evaluates its query whenever an event targets one of its
//! dependent collections, and emits the fresh result after a short debounce
//! window so bursts of mutations collapse into one re-evaluation.

use crate::error::Result;
use crate::{CollectionName, EntityId};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Mutation kind carried by a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
}

/// A committed mutation, as seen on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub collection: CollectionName,
    pub operation: ChangeOp,
    pub id: EntityId,
}

/// Process-wide pub/sub for change events.
#[derive(Debug)]
pub(crate) struct ChangeBus {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: ChangeEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }
}

/// A live stream of re-evaluated results.
///
/// Dropping the watch (or calling [`Watch::cancel`]) aborts the underlying
/// task; no emission can arrive afterwards.
#[derive(Debug)]
pub struct Watch<T> {
    receiver: mpsc::UnboundedReceiver<T>,
    task: JoinHandle<()>,
}

impl<T> Watch<T> {
    /// Wait for the next emission. `None` after cancellation.
    pub async fn next(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Try to take an already-delivered emission without waiting.
    pub fn try_next(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Stop the watch. No further emissions occur.
    pub fn cancel(&mut self) {
        self.task.abort();
        self.receiver.close();
    }
}

impl<T> Drop for Watch<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl<T> futures::Stream for Watch<T> {
    type Item = T;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<T>> {
        self.receiver.poll_recv(cx)
    }
}

/// Spawn a watch task: emit the initial evaluation, then re-evaluate after
/// each debounce window containing at least one interesting event.
pub(crate) fn spawn_watch<T>(
    mut events: broadcast::Receiver<ChangeEvent>,
    debounce: Duration,
    interested: impl Fn(&ChangeEvent) -> bool + Send + 'static,
    evaluate: impl Fn() -> Result<T> + Send + 'static,
) -> Watch<T>
where
    T: Send + 'static,
{
    let (sender, receiver) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        match evaluate() {
            Ok(initial) => {
                if sender.send(initial).is_err() {
                    return;
                }
            }
            Err(e) => tracing::warn!(error = %e, "watch initial evaluation failed"),
        }

        loop {
            // Wait for an interesting event
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if interested(&event) {
                            break;
                        }
                    }
                    // Missed events may have been interesting
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }

            // Debounce: absorb further events until the window closes
            let window = tokio::time::sleep(debounce);
            tokio::pin!(window);
            loop {
                tokio::select! {
                    _ = &mut window => break,
                    received = events.recv() => match received {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }

            match evaluate() {
                Ok(result) => {
                    if sender.send(result).is_err() {
                        return;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "watch re-evaluation failed"),
            }
        }
    });

    Watch { receiver, task }
}

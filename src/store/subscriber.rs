// ABOUTME: Subscriber trait and the per-subscriber worker that delivers change summaries.
// ABOUTME: Each subscriber gets one coalescing mailbox, so on_change never runs concurrently.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::action::{Action, ChangeSummary};
use super::{Store, StoreError};

/// Something that reacts to EngineState changes.
#[async_trait]
pub trait Subscriber: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Called after one or more reductions. Never called while a previous
    /// call for the same subscriber is still running.
    async fn on_change(&self, store: &Store, summary: ChangeSummary) -> Result<(), StoreError>;

    /// Runs once, in registration order, before the first notification.
    async fn set_up(&self, _store: &Store) -> Result<(), StoreError> {
        Ok(())
    }

    /// Runs once on shutdown, in reverse registration order.
    async fn tear_down(&self, _store: &Store) {}
}

/// Retry delays after a failed `on_change`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(15),
        }
    }
}

impl Backoff {
    fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

/// Pending summary plus a capacity-one wake signal.
pub(super) struct Mailbox {
    pending: Mutex<Option<ChangeSummary>>,
    wake: mpsc::Sender<()>,
}

impl Mailbox {
    pub(super) fn new() -> (Arc<Self>, mpsc::Receiver<()>) {
        let (wake, rx) = mpsc::channel(1);
        let mailbox = Arc::new(Self {
            pending: Mutex::new(None),
            wake,
        });
        (mailbox, rx)
    }

    /// Merge into the pending summary and wake the worker. Never blocks.
    pub(super) fn post(&self, summary: ChangeSummary) {
        {
            let mut pending = self.pending.lock();
            match pending.as_mut() {
                Some(existing) => existing.merge(summary),
                None => *pending = Some(summary),
            }
        }
        // A full channel means the worker already has a wake-up queued.
        let _ = self.wake.try_send(());
    }

    fn take(&self) -> Option<ChangeSummary> {
        self.pending.lock().take()
    }

    /// Put a failed summary back in front of anything that arrived since.
    fn requeue(&self, mut summary: ChangeSummary) {
        let mut pending = self.pending.lock();
        if let Some(newer) = pending.take() {
            summary.merge(newer);
        }
        *pending = Some(summary);
    }
}

pub(super) async fn run_worker(
    subscriber: Arc<dyn Subscriber>,
    mailbox: Arc<Mailbox>,
    mut wake: mpsc::Receiver<()>,
    store: Store,
    backoff: Backoff,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = subscriber.name().to_string();
    let mut delay = backoff.initial;

    loop {
        let summary = match mailbox.take() {
            Some(summary) => summary,
            None => {
                tokio::select! {
                    _ = shutdown.wait_for(|stop| *stop) => break,
                    woke = wake.recv() => {
                        if woke.is_none() {
                            break;
                        }
                    }
                }
                continue;
            }
        };

        let outcome = AssertUnwindSafe(subscriber.on_change(&store, summary.clone()))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => delay = backoff.initial,
            Ok(Err(err)) => {
                warn!(subscriber = %name, error = %err, retry_in = ?delay, "on_change failed");
                mailbox.requeue(summary);
                tokio::select! {
                    _ = shutdown.wait_for(|stop| *stop) => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = backoff.next(delay);
            }
            Err(panic) => {
                let message = format!("subscriber {} panicked: {}", name, panic_message(&*panic));
                store.dispatch(Action::error(message));
            }
        }
    }

    debug!(subscriber = %name, "subscriber worker stopped");
}

/// Run `set_up`, turning a panic into an error action.
pub(super) async fn set_up(subscriber: &Arc<dyn Subscriber>, store: &Store) -> Result<(), StoreError> {
    match AssertUnwindSafe(subscriber.set_up(store)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = format!(
                "subscriber {} panicked during set up: {}",
                subscriber.name(),
                panic_message(&*panic)
            );
            store.dispatch(Action::error(message));
            Ok(())
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ABOUTME: The Store owns EngineState, serializes actions through one reducer task,
// ABOUTME: and fans change summaries out to subscribers without blocking on them.

pub mod action;
pub mod build_result;
pub mod engine_state;
pub mod reducers;
mod subscriber;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub use action::{
    Action, BuildCompleteAction, BuildEvent, BuildStartedAction, ChangeSummary,
};
pub use build_result::{
    BuildResult, BuildResultSet, BuildState, BuildStateSet, BuildType, ContainerInfo,
};
pub use engine_state::{
    BuildReason, BuildRecord, BuildStatus, EngineState, ManifestState, ManifestTarget,
    RuntimeState, RuntimeStatus,
};
pub use subscriber::{Backoff, Subscriber};

pub(crate) use subscriber::panic_message;

use subscriber::Mailbox;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is already running")]
    AlreadyRunning,

    #[error("subscriber {name} failed to set up: {message}")]
    SetUp { name: String, message: String },

    #[error("{0}")]
    Subscriber(String),
}

struct Inner {
    state: RwLock<EngineState>,
    actions_tx: mpsc::UnboundedSender<Action>,
    actions_rx: Mutex<Option<mpsc::UnboundedReceiver<Action>>>,
    subscribers: Mutex<Vec<Arc<dyn Subscriber>>>,
    mailboxes: RwLock<Vec<Arc<Mailbox>>>,
    backoff: Backoff,
}

/// Cloneable handle to the engine's single source of truth.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("subscribers", &self.inner.subscribers.lock().len())
            .finish()
    }
}

impl Store {
    pub fn new(state: EngineState) -> Self {
        Self::with_backoff(state, Backoff::default())
    }

    pub fn with_backoff(state: EngineState, backoff: Backoff) -> Self {
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(state),
                actions_tx,
                actions_rx: Mutex::new(Some(actions_rx)),
                subscribers: Mutex::new(Vec::new()),
                mailboxes: RwLock::new(Vec::new()),
                backoff,
            }),
        }
    }

    /// Enqueue an action for the reducer. Never blocks.
    pub fn dispatch(&self, action: Action) {
        if let Err(err) = self.inner.actions_tx.send(action) {
            debug!(action = err.0.name(), "store stopped, dropping action");
        }
    }

    /// Shared read access. Drop the guard before any `.await`.
    pub fn rlock_state(&self) -> RwLockReadGuard<'_, EngineState> {
        self.inner.state.read()
    }

    /// Exclusive write access, for setup and tests. Normal mutation goes through `dispatch`.
    pub fn lock_mutable_state(&self) -> RwLockWriteGuard<'_, EngineState> {
        self.inner.state.write()
    }

    /// Cloned snapshot of the current state.
    pub fn snapshot(&self) -> EngineState {
        self.inner.state.read().clone()
    }

    /// Register a subscriber. Must happen before `run`.
    pub fn add_subscriber(&self, subscriber: Arc<dyn Subscriber>) {
        self.inner.subscribers.lock().push(subscriber);
    }

    /// Reduce actions until `shutdown` flips to true, then tear subscribers down.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), StoreError> {
        let mut actions = self
            .inner
            .actions_rx
            .lock()
            .take()
            .ok_or(StoreError::AlreadyRunning)?;
        let subscribers: Vec<Arc<dyn Subscriber>> = self.inner.subscribers.lock().clone();

        for sub in &subscribers {
            subscriber::set_up(sub, self).await?;
        }

        let mut workers = Vec::with_capacity(subscribers.len());
        {
            let mut mailboxes = self.inner.mailboxes.write();
            for sub in &subscribers {
                let (mailbox, wake) = Mailbox::new();
                mailboxes.push(mailbox.clone());
                workers.push(tokio::spawn(subscriber::run_worker(
                    sub.clone(),
                    mailbox,
                    wake,
                    self.clone(),
                    self.inner.backoff,
                    shutdown.clone(),
                )));
            }
        }
        info!(subscribers = subscribers.len(), "store running");

        let mut stop = shutdown.clone();
        loop {
            tokio::select! {
                biased;
                _ = stop.wait_for(|s| *s) => break,
                action = actions.recv() => match action {
                    Some(action) => self.apply(action),
                    None => break,
                },
            }
        }

        for worker in workers {
            if let Err(err) = worker.await {
                warn!(error = %err, "subscriber worker ended abnormally");
            }
        }
        for sub in subscribers.iter().rev() {
            sub.tear_down(self).await;
        }
        self.inner.mailboxes.write().clear();
        info!("store stopped");
        Ok(())
    }

    fn apply(&self, action: Action) {
        let summary = {
            let mut state = self.inner.state.write();
            reducers::reduce(&mut state, action)
        };
        for mailbox in self.inner.mailboxes.read().iter() {
            mailbox.post(summary.clone());
        }
    }
}

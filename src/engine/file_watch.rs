// ABOUTME: Store subscriber that turns filesystem events into FileChange actions.
// ABOUTME: Edits to the config file reload the manifests instead of marking sources dirty.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::model::{Manifest, TargetId, TargetSpec};
use crate::store::{Action, ChangeSummary, EngineState, Store, StoreError, Subscriber};

/// Quiet period after the last event before a batch is dispatched.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

const IGNORED_DIRS: [&str; 1] = [".git"];
const IGNORED_SUFFIXES: [&str; 3] = ["~", ".swp", ".swx"];

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("file watch failed: {0}")]
    Notify(#[from] notify::Error),
}

/// Registers paths with an OS-level watcher.
pub trait PathWatcher: Send {
    fn watch(&mut self, path: &Path, recursive: bool) -> Result<(), WatchError>;
    fn unwatch(&mut self, path: &Path) -> Result<(), WatchError>;
}

/// Reloads manifests after a config file changed.
pub type ConfigLoader = Arc<dyn Fn() -> crate::error::Result<Vec<Manifest>> + Send + Sync>;

/// `notify`-backed watcher forwarding event paths to a channel.
pub struct NotifyWatcher {
    inner: notify::RecommendedWatcher,
}

impl NotifyWatcher {
    pub fn new(events: mpsc::UnboundedSender<Vec<PathBuf>>) -> Result<Self, WatchError> {
        let inner = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) if event.kind.is_access() => {}
                Ok(event) => {
                    let _ = events.send(event.paths);
                }
                Err(err) => warn!(error = %err, "file watch error"),
            }
        })?;
        Ok(Self { inner })
    }
}

impl PathWatcher for NotifyWatcher {
    fn watch(&mut self, path: &Path, recursive: bool) -> Result<(), WatchError> {
        use notify::Watcher;
        let mode = if recursive {
            notify::RecursiveMode::Recursive
        } else {
            notify::RecursiveMode::NonRecursive
        };
        self.inner.watch(path, mode)?;
        Ok(())
    }

    fn unwatch(&mut self, path: &Path) -> Result<(), WatchError> {
        use notify::Watcher;
        self.inner.unwatch(path)?;
        Ok(())
    }
}

pub fn is_ignored(path: &Path) -> bool {
    if path
        .components()
        .any(|c| IGNORED_DIRS.iter().any(|d| c.as_os_str() == *d))
    {
        return true;
    }
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| IGNORED_SUFFIXES.iter().any(|s| n.ends_with(s)))
}

/// Local roots each file-reading target depends on. Shared images appear once.
pub fn watched_targets(state: &EngineState) -> BTreeMap<TargetId, Vec<PathBuf>> {
    let mut targets = BTreeMap::new();
    for manifest in state.manifests() {
        for spec in manifest.target_specs() {
            let roots = match &spec {
                TargetSpec::Image(image) => vec![image.build.context.clone()],
                TargetSpec::Local(local) => local.deps.clone(),
                TargetSpec::K8s(_) | TargetSpec::DockerCompose(_) => continue,
            };
            targets.entry(spec.id().clone()).or_insert(roots);
        }
    }
    targets
}

/// Changed paths grouped by the targets whose roots contain them.
pub fn changes_by_target(
    state: &EngineState,
    paths: &BTreeSet<PathBuf>,
) -> BTreeMap<TargetId, Vec<PathBuf>> {
    let mut changes: BTreeMap<TargetId, Vec<PathBuf>> = BTreeMap::new();
    let watched = watched_targets(state);
    for path in paths.iter().filter(|p| !is_ignored(p)) {
        for (id, roots) in &watched {
            if roots.iter().any(|root| path.starts_with(root)) {
                changes.entry(id.clone()).or_default().push(path.clone());
            }
        }
    }
    changes
}

fn config_files(state: &EngineState, extra: Option<&PathBuf>) -> BTreeSet<PathBuf> {
    state
        .manifests()
        .into_iter()
        .flat_map(|m| m.config_files.iter().cloned())
        .chain(extra.cloned())
        .collect()
}

/// Debounces events and dispatches them; lives on its own task.
struct EventRouter {
    store: Store,
    config_path: Option<PathBuf>,
    loader: Option<ConfigLoader>,
    debounce: Duration,
}

impl EventRouter {
    async fn run(self, mut events: mpsc::UnboundedReceiver<Vec<PathBuf>>, mut stop: watch::Receiver<bool>) {
        loop {
            let mut batch: BTreeSet<PathBuf> = tokio::select! {
                _ = stop.wait_for(|s| *s) => return,
                first = events.recv() => match first {
                    Some(paths) => paths.into_iter().collect(),
                    None => return,
                },
            };

            let quiet = tokio::time::sleep(self.debounce);
            tokio::pin!(quiet);
            loop {
                tokio::select! {
                    _ = &mut quiet => break,
                    more = events.recv() => match more {
                        Some(paths) => batch.extend(paths),
                        None => break,
                    },
                }
            }

            self.flush(batch);
        }
    }

    fn flush(&self, batch: BTreeSet<PathBuf>) {
        let (configs, changes) = {
            let state = self.store.rlock_state();
            let configs: Vec<PathBuf> = config_files(&state, self.config_path.as_ref())
                .into_iter()
                .filter(|p| batch.contains(p))
                .collect();
            (configs, changes_by_target(&state, &batch))
        };

        if !configs.is_empty() {
            self.reload(configs);
        }
        for (target_id, paths) in changes {
            debug!(target = %target_id, files = paths.len(), "files changed");
            self.store.dispatch(Action::file_change(target_id, paths));
        }
    }

    fn reload(&self, changed_files: Vec<PathBuf>) {
        let Some(loader) = &self.loader else {
            return;
        };
        match loader() {
            Ok(manifests) => {
                info!(files = ?changed_files, "config changed, reloading");
                self.store.dispatch(Action::ConfigsReloaded {
                    manifests,
                    changed_files,
                });
            }
            Err(err) => {
                warn!(error = %err, "config reload failed");
                self.store
                    .dispatch(Action::error(format!("reloading config: {err}")));
            }
        }
    }
}

pub struct FileWatcher {
    backend: Mutex<Box<dyn PathWatcher>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<Vec<PathBuf>>>>,
    /// Registered paths and whether they are watched recursively.
    watched: Mutex<BTreeMap<PathBuf, bool>>,
    config_path: Option<PathBuf>,
    loader: Option<ConfigLoader>,
    debounce: Duration,
    stop: watch::Sender<bool>,
}

impl FileWatcher {
    /// A watcher fed by `events`, registering paths with `backend`.
    pub fn new(
        backend: Box<dyn PathWatcher>,
        events: mpsc::UnboundedReceiver<Vec<PathBuf>>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            backend: Mutex::new(backend),
            events: Mutex::new(Some(events)),
            watched: Mutex::new(BTreeMap::new()),
            config_path: None,
            loader: None,
            debounce: DEFAULT_DEBOUNCE,
            stop,
        }
    }

    /// A watcher on the operating system's file notifications.
    pub fn notify() -> Result<Self, WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self::new(Box::new(NotifyWatcher::new(tx)?), rx))
    }

    /// Reload manifests through `loader` when `path` changes.
    pub fn with_config(mut self, path: PathBuf, loader: ConfigLoader) -> Self {
        self.config_path = Some(path);
        self.loader = Some(loader);
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Paths to register: source roots recursively, the directories holding
    /// config files flat so editors that replace files are still seen.
    fn desired_paths(&self, state: &EngineState) -> BTreeMap<PathBuf, bool> {
        let mut desired: BTreeMap<PathBuf, bool> = BTreeMap::new();
        for config in config_files(state, self.config_path.as_ref()) {
            if let Some(dir) = config.parent().filter(|d| !d.as_os_str().is_empty()) {
                desired.entry(dir.to_path_buf()).or_insert(false);
            }
        }
        for manifest in state.manifests() {
            for root in manifest.local_paths() {
                desired.insert(root, true);
            }
        }
        desired
    }

    fn sync_paths(&self, state: &EngineState) {
        let desired = self.desired_paths(state);
        let mut watched = self.watched.lock();
        let mut backend = self.backend.lock();

        let stale: Vec<PathBuf> = watched
            .iter()
            .filter(|(path, recursive)| desired.get(*path) != Some(*recursive))
            .map(|(path, _)| path.clone())
            .collect();
        for path in stale {
            if let Err(err) = backend.unwatch(&path) {
                debug!(path = %path.display(), error = %err, "unwatch failed");
            }
            watched.remove(&path);
        }

        for (path, recursive) in desired {
            if watched.contains_key(&path) {
                continue;
            }
            match backend.watch(&path, recursive) {
                Ok(()) => {
                    debug!(path = %path.display(), recursive, "watching");
                    watched.insert(path, recursive);
                }
                Err(err) => warn!(path = %path.display(), error = %err, "cannot watch path"),
            }
        }
    }
}

#[async_trait]
impl Subscriber for FileWatcher {
    fn name(&self) -> &str {
        "file-watch"
    }

    async fn set_up(&self, store: &Store) -> Result<(), StoreError> {
        let events = self
            .events
            .lock()
            .take()
            .ok_or_else(|| StoreError::Subscriber("file watcher already started".to_string()))?;
        let router = EventRouter {
            store: store.clone(),
            config_path: self.config_path.clone(),
            loader: self.loader.clone(),
            debounce: self.debounce,
        };
        tokio::spawn(router.run(events, self.stop.subscribe()));
        Ok(())
    }

    async fn on_change(&self, store: &Store, summary: ChangeSummary) -> Result<(), StoreError> {
        if summary.config_reloaded {
            self.sync_paths(&store.rlock_state());
        }
        Ok(())
    }

    async fn tear_down(&self, _store: &Store) {
        self.stop.send_replace(true);
    }
}

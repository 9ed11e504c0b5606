// ABOUTME: Wires config, store, build controller and reporting subscribers into a running engine.
// ABOUTME: `up` runs until shutdown; `run_initial_builds` stops once every first build settles.

mod file_watch;
mod runtime_monitor;
mod triggers;

pub use file_watch::{
    ConfigLoader, DEFAULT_DEBOUNCE, FileWatcher, NotifyWatcher, PathWatcher, WatchError,
};
pub use runtime_monitor::RuntimeMonitor;
pub use triggers::read_triggers;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::buildcontrol::{
    BuildAndDeployer, BuildController, Collaborators, UpdateMode, build_order,
    next_target_to_build,
};
use crate::config::Config;
use crate::error::Error;
use crate::model::Manifest;
use crate::output::{OutputMode, OutputSubscriber};
use crate::runtime::{ClusterDeployer, DockerCli, Environment, Kubectl, ShellRunner};
use crate::store::{
    Action, ChangeSummary, EngineState, Store, StoreError, Subscriber,
    engine_state::{DEFAULT_BUILD_HISTORY_LIMIT, DEFAULT_MAX_PARALLEL_BUILDS},
};
use crate::types::ManifestName;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub update_mode: UpdateMode,
    pub max_parallel_builds: usize,
    pub build_history_limit: usize,
    pub output: OutputMode,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            update_mode: UpdateMode::default(),
            max_parallel_builds: DEFAULT_MAX_PARALLEL_BUILDS,
            build_history_limit: DEFAULT_BUILD_HISTORY_LIMIT,
            output: OutputMode::default(),
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &Config, output: OutputMode) -> Self {
        Self {
            update_mode: config.update_mode,
            max_parallel_builds: config.max_parallel_builds,
            build_history_limit: config.build_history_limit,
            output,
        }
    }
}

/// CLI-backed collaborators for the detected environment.
pub fn default_collaborators(kube_context: Option<&str>) -> Collaborators {
    let docker = Arc::new(DockerCli::default());
    let kubectl = match kube_context {
        Some(context) => Kubectl::default().with_context(context),
        None => Kubectl::default(),
    };
    let kubectl = Arc::new(kubectl);

    Collaborators {
        image_builder: docker.clone(),
        cluster: kubectl.clone(),
        compose: docker.clone(),
        docker_updater: docker,
        exec_updater: kubectl,
        local: Arc::new(ShellRunner),
    }
}

/// Reports when every manifest's first build has settled: built, failed, or
/// blocked with nothing left to run.
struct InitialBuildsWatcher {
    settled: watch::Sender<bool>,
}

fn initial_builds_settled(state: &EngineState) -> bool {
    if state.manifest_targets.is_empty() {
        return false;
    }
    if state.initial_builds_done() {
        return true;
    }
    state.currently_building.is_empty() && next_target_to_build(state).0.is_none()
}

#[async_trait]
impl Subscriber for InitialBuildsWatcher {
    fn name(&self) -> &str {
        "initial-builds"
    }

    async fn on_change(&self, store: &Store, _summary: ChangeSummary) -> Result<(), StoreError> {
        let settled = initial_builds_settled(&store.rlock_state());
        if settled {
            self.settled.send_replace(true);
        }
        Ok(())
    }
}

pub struct Engine {
    store: Store,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    settled: watch::Receiver<bool>,
}

impl Engine {
    /// An engine driving `builder`. With a cluster, deployed pods are watched
    /// so in-place updates can find their containers.
    pub fn new(
        options: &EngineOptions,
        builder: Arc<dyn BuildAndDeployer>,
        cluster: Option<Arc<dyn ClusterDeployer>>,
    ) -> Self {
        let state = EngineState::new()
            .with_max_parallel_builds(options.max_parallel_builds)
            .with_build_history_limit(options.build_history_limit);
        let store = Store::new(state);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (settled_tx, settled) = watch::channel(false);

        store.add_subscriber(Arc::new(BuildController::new(builder, shutdown_rx.clone())));
        if let Some(cluster) = cluster {
            store.add_subscriber(Arc::new(RuntimeMonitor::new(cluster, shutdown_rx.clone())));
        }
        store.add_subscriber(Arc::new(OutputSubscriber::new(options.output)));
        store.add_subscriber(Arc::new(InitialBuildsWatcher {
            settled: settled_tx,
        }));

        Self {
            store,
            shutdown_tx,
            shutdown_rx,
            settled,
        }
    }

    /// An engine whose strategy chain is chosen for `env`.
    pub fn for_environment(
        options: &EngineOptions,
        env: &Environment,
        collaborators: Collaborators,
    ) -> Self {
        let chain = build_order(options.update_mode, env, &collaborators);
        info!(
            update_mode = %options.update_mode,
            cluster = ?env.cluster,
            strategies = ?chain.names(),
            "build strategies selected"
        );
        Self::new(options, Arc::new(chain), Some(collaborators.cluster))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Sender that stops the engine and cancels in-flight builds when set to true.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn load_manifests(&self, manifests: Vec<Manifest>) {
        info!(manifests = manifests.len(), "loading manifests");
        self.store.dispatch(Action::ConfigsReloaded {
            manifests,
            changed_files: Vec::new(),
        });
    }

    /// Turn file edits under each manifest's sources into rebuilds.
    pub fn watch_files(&self, watcher: FileWatcher) {
        self.store.add_subscriber(Arc::new(watcher));
    }

    /// Run until shutdown.
    pub async fn up(&self) -> Result<(), Error> {
        self.store.run(self.shutdown_rx.clone()).await?;
        Ok(())
    }

    /// Run until every first build settles, then stop. Fails when any
    /// manifest's build failed or never ran.
    pub async fn run_initial_builds(&self) -> Result<(), Error> {
        let store = self.store.clone();
        let shutdown = self.shutdown_rx.clone();
        let runner = tokio::spawn(async move { store.run(shutdown).await });

        let mut settled = self.settled.clone();
        let mut stopped = self.shutdown_rx.clone();
        tokio::select! {
            _ = settled.wait_for(|s| *s) => {}
            _ = stopped.wait_for(|s| *s) => {}
        }
        self.shutdown();

        runner
            .await
            .map_err(|e| Error::Task(e.to_string()))??;

        let failed = unsuccessful_manifests(&self.store.rlock_state());
        if failed.is_empty() {
            return Ok(());
        }
        Err(Error::BuildsFailed {
            count: failed.len(),
            names: failed
                .iter()
                .map(ManifestName::as_str)
                .collect::<Vec<_>>()
                .join(", "),
        })
    }
}

/// Auto-initial manifests whose last build failed or that never finished one.
fn unsuccessful_manifests(state: &EngineState) -> Vec<ManifestName> {
    state
        .targets()
        .into_iter()
        .filter(|mt| mt.manifest.trigger_mode.auto_initial())
        .filter(|mt| !mt.state.last_build().is_some_and(|b| b.succeeded()))
        .map(|mt| mt.manifest.name.clone())
        .collect()
}

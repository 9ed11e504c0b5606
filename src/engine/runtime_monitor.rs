// ABOUTME: Store subscriber that watches the containers of each Kubernetes deploy.
// ABOUTME: One polling task per manifest, replaced whenever a deploy rolls out new images.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::buildcontrol::BuildContext;
use crate::model::{K8sTarget, TargetSpec};
use crate::runtime::{ClusterDeployer, WorkloadStatus};
use crate::store::{
    Action, BuildEvent, ChangeSummary, EngineState, RuntimeStatus, Store, StoreError, Subscriber,
};
use crate::types::{ImageRef, ManifestName};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Polls allowed before the first container shows up.
pub const DEFAULT_POLL_ATTEMPTS: usize = 60;

/// A running watch and the images it looks for.
struct WorkloadWatch {
    images: Vec<ImageRef>,
    stop: watch::Sender<bool>,
}

pub struct RuntimeMonitor {
    cluster: Arc<dyn ClusterDeployer>,
    shutdown: watch::Receiver<bool>,
    interval: Duration,
    attempts: usize,
    watches: Mutex<BTreeMap<ManifestName, WorkloadWatch>>,
}

impl RuntimeMonitor {
    pub fn new(cluster: Arc<dyn ClusterDeployer>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            cluster,
            shutdown,
            interval: DEFAULT_POLL_INTERVAL,
            attempts: DEFAULT_POLL_ATTEMPTS,
            watches: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_polling(mut self, interval: Duration, attempts: usize) -> Self {
        self.interval = interval;
        self.attempts = attempts.max(1);
        self
    }

    /// Start watching `images` for `manifest`, stopping any earlier watch.
    /// Returns false when the same images are already watched.
    fn start_watch(
        &self,
        store: &Store,
        manifest: &ManifestName,
        target: K8sTarget,
        images: Vec<ImageRef>,
    ) -> bool {
        let mut watches = self.watches.lock();
        if watches.get(manifest).is_some_and(|w| w.images == images) {
            return false;
        }

        let (stop, stopped) = watch::channel(false);
        let previous = watches.insert(
            manifest.clone(),
            WorkloadWatch {
                images: images.clone(),
                stop,
            },
        );
        if let Some(previous) = previous {
            debug!(manifest = %manifest, images = ?previous.images, "stopping watch for replaced deploy");
            previous.stop.send_replace(true);
        }

        let poller = WorkloadPoller {
            cluster: self.cluster.clone(),
            store: store.clone(),
            ctx: BuildContext::new(manifest.clone(), self.shutdown.clone()),
            target,
            images,
            interval: self.interval,
            attempts: self.attempts,
        };
        tokio::spawn(poller.run(stopped));
        true
    }

    fn forget_removed(&self, state: &EngineState) {
        self.watches.lock().retain(|name, w| {
            let keep = state.manifest_target(name).is_some();
            if !keep {
                w.stop.send_replace(true);
            }
            keep
        });
    }
}

/// The K8s target and its deployed images, once `name` has any.
fn watch_request(state: &EngineState, name: &ManifestName) -> Option<(K8sTarget, Vec<ImageRef>)> {
    let mt = state.manifest_target(name)?;
    let TargetSpec::K8s(k8s) = &mt.manifest.deploy_target else {
        return None;
    };
    let images = mt.deployed_images();
    if images.is_empty() {
        return None;
    }
    Some((k8s.clone(), images))
}

fn runtime_status(report: &WorkloadStatus) -> RuntimeStatus {
    if report.crashed {
        RuntimeStatus::Error
    } else if report.running.is_empty() {
        RuntimeStatus::Pending
    } else {
        RuntimeStatus::Ready
    }
}

struct WorkloadPoller {
    cluster: Arc<dyn ClusterDeployer>,
    store: Store,
    ctx: BuildContext,
    target: K8sTarget,
    images: Vec<ImageRef>,
    interval: Duration,
    attempts: usize,
}

impl WorkloadPoller {
    /// Poll until stopped, reporting every change. Gives up if nothing ever
    /// matches within the attempt budget.
    async fn run(self, mut stopped: watch::Receiver<bool>) {
        let manifest = self.ctx.manifest().clone();
        let mut last = WorkloadStatus::default();
        let mut seen_any = false;
        let mut attempt = 0;

        loop {
            let report = tokio::select! {
                _ = stopped.wait_for(|s| *s) => return,
                _ = self.ctx.cancelled() => return,
                report = self.cluster.workload_status(&self.ctx, &self.target, &self.images) => report,
            };

            match report {
                Ok(report) if report != last => {
                    let status = runtime_status(&report);
                    if status == RuntimeStatus::Error {
                        warn!(manifest = %manifest, "container crashed");
                    }
                    debug!(manifest = %manifest, ?status, containers = report.running.len(), "workload changed");
                    self.store.dispatch(Action::RuntimeStateChanged {
                        manifest: manifest.clone(),
                        images: self.images.clone(),
                        status,
                        containers: report.running.clone(),
                    });
                    seen_any |= !report.is_empty();
                    last = report;
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(manifest = %manifest, attempt, error = %err, "listing pods failed");
                }
            }

            if !seen_any {
                attempt += 1;
                if attempt >= self.attempts {
                    debug!(manifest = %manifest, attempts = self.attempts, "no running containers found");
                    return;
                }
            }

            tokio::select! {
                _ = stopped.wait_for(|s| *s) => return,
                _ = self.ctx.cancelled() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

#[async_trait]
impl Subscriber for RuntimeMonitor {
    fn name(&self) -> &str {
        "runtime-monitor"
    }

    async fn on_change(&self, store: &Store, summary: ChangeSummary) -> Result<(), StoreError> {
        if summary.config_reloaded {
            self.forget_removed(&store.rlock_state());
        }

        for event in &summary.events {
            let BuildEvent::Completed {
                manifest,
                error: None,
                ..
            } = event
            else {
                continue;
            };

            let Some((target, images)) = watch_request(&store.rlock_state(), manifest) else {
                continue;
            };
            if self.start_watch(store, manifest, target, images) {
                debug!(manifest = %manifest, "watching deployed workload");
            }
        }
        Ok(())
    }
}

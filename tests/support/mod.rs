// ABOUTME: Test support utilities.
// ABOUTME: Tracing setup, manifest builders and scripted fakes for strategies, clusters and file watches.

use async_trait::async_trait;
use kiln::buildcontrol::{BuildAndDeployer, BuildContext, BuildError};
use kiln::engine::{PathWatcher, WatchError};
use kiln::model::{ImageTarget, K8sTarget, LocalTarget, Manifest, TargetId, TargetSpec};
use kiln::runtime::{BuiltImage, ClusterDeployer, RuntimeError, WorkloadStatus};
use kiln::store::{BuildResult, BuildResultSet, BuildStateSet, ContainerInfo};
use kiln::types::{ContainerId, ImageRef, ManifestName, PodId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests. Safe to call multiple times.
#[allow(dead_code)]
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::from_default_env().add_directive("kiln=debug".parse().unwrap());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

#[allow(dead_code)]
pub fn name(n: &str) -> ManifestName {
    ManifestName::new(n).unwrap()
}

#[allow(dead_code)]
pub fn image(n: &str, deps: &[&str]) -> ImageTarget {
    ImageTarget::new(n, ImageRef::parse(n).unwrap(), format!("/src/{n}"))
        .with_dependencies(deps.iter().map(|d| TargetId::image(*d)).collect())
}

/// A Kubernetes manifest deploying `images`, which must include their bases.
#[allow(dead_code)]
pub fn k8s_manifest(n: &str, images: Vec<ImageTarget>, direct: &[&str]) -> Manifest {
    Manifest::new(
        name(n),
        K8sTarget {
            id: TargetId::k8s(n),
            yaml_path: PathBuf::from(format!("/src/{n}.yaml")),
            namespace: None,
            image_dependency_ids: direct.iter().map(|d| TargetId::image(*d)).collect(),
        },
    )
    .with_image_targets(images)
}

#[allow(dead_code)]
pub fn local_manifest(n: &str, allow_parallel: bool) -> Manifest {
    Manifest::new(
        name(n),
        LocalTarget {
            id: TargetId::local(n),
            cmd: format!("echo {n}"),
            workdir: PathBuf::from("/src"),
            deps: vec![PathBuf::from(format!("/src/{n}"))],
            allow_parallel,
        },
    )
}

/// Result a successful strategy would report for `spec`.
#[allow(dead_code)]
pub fn success_result(spec: &TargetSpec) -> BuildResult {
    tagged_result(spec, "kiln-test")
}

/// Like `success_result`, with images tagged `tag`.
#[allow(dead_code)]
pub fn tagged_result(spec: &TargetSpec, tag: &str) -> BuildResult {
    match spec {
        TargetSpec::Image(it) => BuildResult::image(it.id.clone(), it.image_ref.with_tag(tag)),
        TargetSpec::Local(t) => BuildResult::local(t.id.clone()),
        other => BuildResult::deploy(other.id().clone(), vec![]),
    }
}

/// One call a strategy received.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct Call {
    pub manifest: ManifestName,
    pub targets: Vec<TargetId>,
    pub files_changed: Vec<PathBuf>,
}

/// Strategy that succeeds for every target unless told to fail a manifest.
/// Images from the nth call are tagged `kiln-n`.
#[allow(dead_code)]
#[derive(Default)]
pub struct FakeBuilder {
    calls: Mutex<Vec<Call>>,
    failing: Mutex<BTreeSet<ManifestName>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[allow(dead_code)]
impl FakeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn fail(&self, manifest: &str) {
        self.failing.lock().insert(name(manifest));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn built_manifests(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(|c| c.manifest.to_string())
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildAndDeployer for FakeBuilder {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn build_and_deploy(
        &self,
        ctx: &BuildContext,
        specs: &[TargetSpec],
        state_set: &BuildStateSet,
    ) -> Result<BuildResultSet, BuildError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let tag = {
            let mut calls = self.calls.lock();
            calls.push(Call {
                manifest: ctx.manifest().clone(),
                targets: specs.iter().map(|s| s.id().clone()).collect(),
                files_changed: state_set.files_changed(),
            });
            format!("kiln-{}", calls.len())
        };

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = ctx.cancelled() => {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    return Err(BuildError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.lock().contains(ctx.manifest()) {
            return Err(BuildError::dont_fall_back(format!(
                "{} failed to build",
                ctx.manifest()
            )));
        }
        Ok(specs.iter().map(|spec| tagged_result(spec, &tag)).collect())
    }
}

/// Cluster whose workloads report one pod per image tag, after a delay.
#[allow(dead_code)]
#[derive(Default)]
pub struct FakeCluster {
    pods: Mutex<BTreeMap<String, (Duration, String)>>,
    polls: AtomicUsize,
}

#[allow(dead_code)]
impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Workloads running images tagged `tag` report `pod` after `delay`.
    pub fn with_pod(self, tag: &str, delay: Duration, pod: &str) -> Self {
        self.pods
            .lock()
            .insert(tag.to_string(), (delay, pod.to_string()));
        self
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterDeployer for FakeCluster {
    async fn deploy(
        &self,
        _ctx: &BuildContext,
        _target: &K8sTarget,
        _images: &[BuiltImage],
    ) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn workload_status(
        &self,
        _ctx: &BuildContext,
        _target: &K8sTarget,
        images: &[ImageRef],
    ) -> Result<WorkloadStatus, RuntimeError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let found = images
            .iter()
            .filter_map(|i| i.tag())
            .find_map(|tag| self.pods.lock().get(tag).cloned());
        let Some((delay, pod)) = found else {
            return Ok(WorkloadStatus::default());
        };
        tokio::time::sleep(delay).await;
        Ok(WorkloadStatus {
            running: vec![ContainerInfo {
                pod_id: Some(PodId::new(pod.clone())),
                container_id: ContainerId::new(format!("{pod}-main")),
                container_name: "main".to_string(),
                namespace: None,
            }],
            crashed: false,
        })
    }
}

/// Path watcher that records registrations instead of touching the OS.
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct RecordingWatcher(Arc<Mutex<BTreeMap<PathBuf, bool>>>);

#[allow(dead_code)]
impl RecordingWatcher {
    /// Registered paths and whether each is recursive.
    pub fn watched(&self) -> BTreeMap<PathBuf, bool> {
        self.0.lock().clone()
    }
}

impl PathWatcher for RecordingWatcher {
    fn watch(&mut self, path: &Path, recursive: bool) -> Result<(), WatchError> {
        self.0.lock().insert(path.to_path_buf(), recursive);
        Ok(())
    }

    fn unwatch(&mut self, path: &Path) -> Result<(), WatchError> {
        self.0.lock().remove(path);
        Ok(())
    }
}

/// Strategy that always answers with the same outcome and counts its calls.
#[allow(dead_code)]
pub struct ScriptedStrategy {
    name: &'static str,
    outcome: Result<(), BuildError>,
    calls: AtomicUsize,
}

#[allow(dead_code)]
impl ScriptedStrategy {
    pub fn succeeding(name: &'static str) -> Self {
        Self {
            name,
            outcome: Ok(()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: &'static str, err: BuildError) -> Self {
        Self {
            name,
            outcome: Err(err),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildAndDeployer for ScriptedStrategy {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn build_and_deploy(
        &self,
        _ctx: &BuildContext,
        specs: &[TargetSpec],
        _state_set: &BuildStateSet,
    ) -> Result<BuildResultSet, BuildError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()?;
        Ok(specs.iter().map(success_result).collect())
    }
}

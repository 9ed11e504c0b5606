// ABOUTME: The single mutable EngineState and the per-manifest records it owns.
// ABOUTME: Only the store's reducer mutates it; everyone else reads through the lock.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::path::PathBuf;

use super::build_result::{BuildResult, BuildType, ContainerInfo};
use crate::buildcontrol::BuildError;
use crate::model::{Manifest, TargetId, TargetSpec};
use crate::types::{ContainerId, ImageRef, ManifestName};

pub const DEFAULT_MAX_PARALLEL_BUILDS: usize = 3;
pub const DEFAULT_BUILD_HISTORY_LIMIT: usize = 2;

/// Why a build ran. Several reasons can apply at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BuildReason(u8);

impl BuildReason {
    pub const NONE: BuildReason = BuildReason(0);
    pub const INIT: BuildReason = BuildReason(1);
    pub const CHANGED_FILES: BuildReason = BuildReason(1 << 1);
    pub const CHANGED_DEPS: BuildReason = BuildReason(1 << 2);
    pub const TRIGGER: BuildReason = BuildReason(1 << 3);
    pub const CONFIG: BuildReason = BuildReason(1 << 4);
    pub const CRASH: BuildReason = BuildReason(1 << 5);

    const NAMES: [(BuildReason, &'static str); 6] = [
        (Self::INIT, "initial build"),
        (Self::CHANGED_FILES, "changed files"),
        (Self::CHANGED_DEPS, "changed dependencies"),
        (Self::TRIGGER, "manual trigger"),
        (Self::CONFIG, "config changed"),
        (Self::CRASH, "pod crashed"),
    ];

    #[must_use]
    pub fn with(self, other: BuildReason) -> BuildReason {
        BuildReason(self.0 | other.0)
    }

    pub fn has(self, other: BuildReason) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.has(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl fmt::Display for BuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "unknown");
        }
        write!(f, "{}", self.names().join(" | "))
    }
}

impl Serialize for BuildReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.names())
    }
}

/// One build, in flight or finished.
#[derive(Debug, Clone)]
pub struct BuildRecord {
    pub build_count: usize,
    pub start_time: DateTime<Utc>,
    pub finish_time: Option<DateTime<Utc>>,
    pub reason: BuildReason,
    pub edits: Vec<PathBuf>,
    pub build_types: BTreeSet<BuildType>,
    pub error: Option<BuildError>,
}

impl BuildRecord {
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finish_time.map(|end| end - self.start_time)
    }

    pub fn succeeded(&self) -> bool {
        self.finish_time.is_some() && self.error.is_none()
    }
}

/// Per-target bookkeeping inside a manifest.
#[derive(Debug, Clone, Default)]
pub struct BuildStatus {
    pub last_result: Option<BuildResult>,
    /// Changed files with the time each change was last observed.
    pub pending_file_changes: BTreeMap<PathBuf, DateTime<Utc>>,
    /// Dependencies rebuilt by another manifest, with the time of that build.
    pub pending_dependency_changes: BTreeMap<TargetId, DateTime<Utc>>,
}

impl BuildStatus {
    pub fn has_pending_changes(&self) -> bool {
        !self.pending_file_changes.is_empty() || !self.pending_dependency_changes.is_empty()
    }

    /// Drop pending changes observed at or before `cutoff`.
    pub fn clear_pending_changes_before(&mut self, cutoff: DateTime<Utc>) {
        self.pending_file_changes.retain(|_, at| *at > cutoff);
        self.pending_dependency_changes.retain(|_, at| *at > cutoff);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    #[default]
    Unknown,
    Pending,
    Ready,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeState {
    pub status: RuntimeStatus,
    pub containers: Vec<ContainerInfo>,
    pub has_ever_been_ready: bool,
}

#[derive(Debug, Clone)]
pub struct ManifestState {
    pub name: ManifestName,
    pub build_statuses: BTreeMap<TargetId, BuildStatus>,
    pub current_build: Option<BuildRecord>,
    /// Most recent first.
    pub build_history: VecDeque<BuildRecord>,
    pub last_successful_deploy_time: Option<DateTime<Utc>>,
    /// Reasons accumulated by triggers since the last build started.
    pub trigger_reason: BuildReason,
    pub runtime_state: RuntimeState,
    pub config_files_that_caused_change: Vec<PathBuf>,
    /// Set when a config reload changed this manifest's definition.
    pub pending_manifest_change: Option<DateTime<Utc>>,
    /// The runtime crashed after an in-place update, so its files are stale.
    pub needs_rebuild_from_crash: bool,
    /// Containers patched by the last in-place update. Losing one of them
    /// means the runtime restarted from the image.
    pub live_updated_container_ids: BTreeSet<ContainerId>,
}

impl ManifestState {
    pub fn new(manifest: &Manifest) -> Self {
        Self {
            name: manifest.name.clone(),
            build_statuses: manifest
                .target_ids()
                .into_iter()
                .map(|id| (id, BuildStatus::default()))
                .collect(),
            current_build: None,
            build_history: VecDeque::new(),
            last_successful_deploy_time: None,
            trigger_reason: BuildReason::NONE,
            runtime_state: RuntimeState::default(),
            config_files_that_caused_change: Vec::new(),
            pending_manifest_change: None,
            needs_rebuild_from_crash: false,
            live_updated_container_ids: BTreeSet::new(),
        }
    }

    pub fn is_building(&self) -> bool {
        self.current_build.is_some()
    }

    pub fn started_first_build(&self) -> bool {
        self.current_build.is_some() || !self.build_history.is_empty()
    }

    pub fn last_build(&self) -> Option<&BuildRecord> {
        self.build_history.front()
    }

    pub fn build_status(&self, id: &TargetId) -> Option<&BuildStatus> {
        self.build_statuses.get(id)
    }

    pub fn build_status_mut(&mut self, id: &TargetId) -> &mut BuildStatus {
        self.build_statuses.entry(id.clone()).or_default()
    }

    pub fn last_result(&self, id: &TargetId) -> Option<&BuildResult> {
        self.build_statuses.get(id).and_then(|s| s.last_result.as_ref())
    }

    /// Changes newer than the start of the last build. Changes a failed build
    /// already saw stay pending but do not make the manifest eligible again.
    fn is_fresh(&self, at: DateTime<Utc>) -> bool {
        match self.last_build() {
            Some(build) => at > build.start_time,
            None => true,
        }
    }

    pub fn has_pending_file_changes(&self) -> bool {
        self.build_statuses
            .values()
            .flat_map(|s| s.pending_file_changes.values())
            .any(|at| self.is_fresh(*at))
    }

    pub fn has_pending_dependency_changes(&self) -> bool {
        self.build_statuses
            .values()
            .flat_map(|s| s.pending_dependency_changes.values())
            .any(|at| self.is_fresh(*at))
    }

    /// Earliest eligible pending change, if any.
    pub fn earliest_pending_change(&self) -> Option<DateTime<Utc>> {
        let files = self
            .build_statuses
            .values()
            .flat_map(|s| s.pending_file_changes.values());
        let deps = self
            .build_statuses
            .values()
            .flat_map(|s| s.pending_dependency_changes.values());

        files
            .chain(deps)
            .chain(self.pending_manifest_change.iter())
            .copied()
            .filter(|at| self.is_fresh(*at))
            .min()
    }

    pub fn push_history(&mut self, record: BuildRecord, limit: usize) {
        self.build_history.push_front(record);
        self.build_history.truncate(limit.max(1));
    }

    /// True when the last finished build was an in-place update.
    pub fn last_build_was_live_update(&self) -> bool {
        self.last_build()
            .is_some_and(|b| b.succeeded() && b.build_types.contains(&BuildType::LiveUpdate))
    }
}

/// A manifest definition paired with its mutable state.
#[derive(Debug, Clone)]
pub struct ManifestTarget {
    pub manifest: Manifest,
    pub state: ManifestState,
}

impl ManifestTarget {
    pub fn new(manifest: Manifest) -> Self {
        let state = ManifestState::new(&manifest);
        Self { manifest, state }
    }

    /// Images the current Kubernetes deploy runs, from the last successful
    /// build of each deployed image. Empty for other deploy targets.
    pub fn deployed_images(&self) -> Vec<ImageRef> {
        let TargetSpec::K8s(k8s) = &self.manifest.deploy_target else {
            return Vec::new();
        };
        k8s.image_dependency_ids
            .iter()
            .filter_map(|id| self.state.last_result(id)?.image_ref().cloned())
            .collect()
    }

    pub fn next_build_reason(&self) -> BuildReason {
        let state = &self.state;
        let mut reason = state.trigger_reason;
        if state.has_pending_file_changes() {
            reason = reason.with(BuildReason::CHANGED_FILES);
        }
        if state.has_pending_dependency_changes() {
            reason = reason.with(BuildReason::CHANGED_DEPS);
        }
        if state
            .pending_manifest_change
            .is_some_and(|at| state.is_fresh(at))
        {
            reason = reason.with(BuildReason::CONFIG);
        }
        if !state.started_first_build() && self.manifest.trigger_mode.auto_initial() {
            reason = reason.with(BuildReason::INIT);
        }
        if state.needs_rebuild_from_crash {
            reason = reason.with(BuildReason::CRASH);
        }
        reason
    }
}

/// Process-wide state. Created empty, populated by the first config load.
#[derive(Debug, Clone)]
pub struct EngineState {
    pub manifest_definition_order: Vec<ManifestName>,
    pub manifest_targets: BTreeMap<ManifestName, ManifestTarget>,
    pub currently_building: BTreeSet<ManifestName>,
    pub trigger_queue: Vec<ManifestName>,
    pub started_build_count: usize,
    pub completed_build_count: usize,
    pub max_parallel_builds: usize,
    pub build_history_limit: usize,
    pub last_error: Option<String>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            manifest_definition_order: Vec::new(),
            manifest_targets: BTreeMap::new(),
            currently_building: BTreeSet::new(),
            trigger_queue: Vec::new(),
            started_build_count: 0,
            completed_build_count: 0,
            max_parallel_builds: DEFAULT_MAX_PARALLEL_BUILDS,
            build_history_limit: DEFAULT_BUILD_HISTORY_LIMIT,
            last_error: None,
        }
    }

    pub fn with_max_parallel_builds(mut self, n: usize) -> Self {
        self.max_parallel_builds = n.max(1);
        self
    }

    pub fn with_build_history_limit(mut self, n: usize) -> Self {
        self.build_history_limit = n.max(1);
        self
    }

    /// Manifest targets in definition order.
    pub fn targets(&self) -> Vec<&ManifestTarget> {
        self.manifest_definition_order
            .iter()
            .filter_map(|name| self.manifest_targets.get(name))
            .collect()
    }

    pub fn manifests(&self) -> Vec<&Manifest> {
        self.targets().into_iter().map(|mt| &mt.manifest).collect()
    }

    pub fn manifest_target(&self, name: &ManifestName) -> Option<&ManifestTarget> {
        self.manifest_targets.get(name)
    }

    pub fn manifest_target_mut(&mut self, name: &ManifestName) -> Option<&mut ManifestTarget> {
        self.manifest_targets.get_mut(name)
    }

    pub fn manifest_state(&self, name: &ManifestName) -> Option<&ManifestState> {
        self.manifest_targets.get(name).map(|mt| &mt.state)
    }

    pub fn next_build_reason(&self, name: &ManifestName) -> BuildReason {
        self.manifest_targets
            .get(name)
            .map(ManifestTarget::next_build_reason)
            .unwrap_or(BuildReason::NONE)
    }

    pub fn available_build_slots(&self) -> usize {
        self.max_parallel_builds
            .saturating_sub(self.currently_building.len())
    }

    pub fn is_currently_building(&self, name: &ManifestName) -> bool {
        self.currently_building.contains(name)
    }

    /// Every manifest that builds on start has finished its first build.
    pub fn initial_builds_done(&self) -> bool {
        self.targets().iter().all(|mt| {
            !mt.manifest.trigger_mode.auto_initial()
                || (!mt.state.is_building() && !mt.state.build_history.is_empty())
        })
    }

    /// Manifests whose most recent build failed, with the error.
    pub fn failed_manifests(&self) -> Vec<(&ManifestName, &BuildError)> {
        self.targets()
            .into_iter()
            .filter_map(|mt| {
                mt.state
                    .last_build()
                    .and_then(|b| b.error.as_ref())
                    .map(|e| (&mt.manifest.name, e))
            })
            .collect()
    }
}

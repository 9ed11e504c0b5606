// ABOUTME: Immutable build inputs and outputs: BuildResult, BuildState and their per-target sets.
// ABOUTME: BuildState decides whether a target can reuse its previous result.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::model::TargetId;
use crate::types::{ContainerId, ImageRef, PodId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildType {
    Image,
    LiveUpdate,
    Deploy,
    Local,
}

/// Outcome of one successful build of one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildResult {
    /// A freshly built, content-addressed image.
    Image { target: TargetId, image: ImageRef },

    /// Files patched into running containers. Never carries a fresh image.
    /// With no base image and no containers it only marks the target stale.
    LiveUpdate {
        target: TargetId,
        base_image: Option<ImageRef>,
        container_ids: Vec<ContainerId>,
        files_replaced: BTreeSet<PathBuf>,
    },

    Deploy {
        target: TargetId,
        container_ids: Vec<ContainerId>,
    },

    Local { target: TargetId },
}

impl BuildResult {
    pub fn image(target: TargetId, image: ImageRef) -> Self {
        BuildResult::Image { target, image }
    }

    pub fn deploy(target: TargetId, container_ids: Vec<ContainerId>) -> Self {
        BuildResult::Deploy {
            target,
            container_ids,
        }
    }

    pub fn local(target: TargetId) -> Self {
        BuildResult::Local { target }
    }

    /// Result for an image whose running containers were patched in place.
    /// Files replaced by earlier in-place updates of the same image carry over.
    pub fn live_update(
        target: TargetId,
        previous: Option<&BuildResult>,
        container_ids: Vec<ContainerId>,
        files: impl IntoIterator<Item = PathBuf>,
    ) -> Self {
        let (base_image, mut files_replaced) = match previous {
            Some(BuildResult::Image { image, .. }) => (Some(image.clone()), BTreeSet::new()),
            Some(BuildResult::LiveUpdate {
                base_image,
                files_replaced,
                ..
            }) => (base_image.clone(), files_replaced.clone()),
            _ => (None, BTreeSet::new()),
        };
        files_replaced.extend(files);

        BuildResult::LiveUpdate {
            target,
            base_image,
            container_ids,
            files_replaced,
        }
    }

    /// Marks a dependency whose sources changed but which was not rebuilt.
    pub fn invalidated(target: TargetId) -> Self {
        BuildResult::LiveUpdate {
            target,
            base_image: None,
            container_ids: Vec::new(),
            files_replaced: BTreeSet::new(),
        }
    }

    pub fn target_id(&self) -> &TargetId {
        match self {
            BuildResult::Image { target, .. }
            | BuildResult::LiveUpdate { target, .. }
            | BuildResult::Deploy { target, .. }
            | BuildResult::Local { target } => target,
        }
    }

    pub fn build_type(&self) -> BuildType {
        match self {
            BuildResult::Image { .. } => BuildType::Image,
            BuildResult::LiveUpdate { .. } => BuildType::LiveUpdate,
            BuildResult::Deploy { .. } => BuildType::Deploy,
            BuildResult::Local { .. } => BuildType::Local,
        }
    }

    /// Image produced by this build, if it produced one.
    pub fn fresh_image(&self) -> Option<&ImageRef> {
        match self {
            BuildResult::Image { image, .. } => Some(image),
            _ => None,
        }
    }

    /// Image the target's containers are running, fresh or patched.
    pub fn image_ref(&self) -> Option<&ImageRef> {
        match self {
            BuildResult::Image { image, .. } => Some(image),
            BuildResult::LiveUpdate { base_image, .. } => base_image.as_ref(),
            BuildResult::Deploy { .. } | BuildResult::Local { .. } => None,
        }
    }

    pub fn container_ids(&self) -> &[ContainerId] {
        match self {
            BuildResult::LiveUpdate { container_ids, .. }
            | BuildResult::Deploy { container_ids, .. } => container_ids,
            BuildResult::Image { .. } | BuildResult::Local { .. } => &[],
        }
    }

    pub fn files_replaced(&self) -> Option<&BTreeSet<PathBuf>> {
        match self {
            BuildResult::LiveUpdate { files_replaced, .. } => Some(files_replaced),
            _ => None,
        }
    }

    /// Whether the next pass may reuse this result when nothing changed.
    pub fn is_reusable(&self) -> bool {
        match self {
            BuildResult::LiveUpdate {
                base_image,
                container_ids,
                ..
            } => base_image.is_some() || !container_ids.is_empty(),
            BuildResult::Image { .. } | BuildResult::Deploy { .. } | BuildResult::Local { .. } => {
                true
            }
        }
    }
}

/// Results of one build pass, keyed by target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildResultSet(BTreeMap<TargetId, BuildResult>);

impl BuildResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, result: BuildResult) {
        self.0.insert(result.target_id().clone(), result);
    }

    pub fn get(&self, id: &TargetId) -> Option<&BuildResult> {
        self.0.get(id)
    }

    pub fn contains(&self, id: &TargetId) -> bool {
        self.0.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TargetId, &BuildResult)> {
        self.0.iter()
    }

    pub fn results(&self) -> impl Iterator<Item = &BuildResult> {
        self.0.values()
    }

    pub fn extend(&mut self, other: BuildResultSet) {
        self.0.extend(other.0);
    }

    /// Subset restricted to the given targets.
    pub fn filter(&self, ids: &[TargetId]) -> BuildResultSet {
        BuildResultSet(
            ids.iter()
                .filter_map(|id| self.0.get(id).map(|r| (id.clone(), r.clone())))
                .collect(),
        )
    }

    pub fn live_updated_container_ids(&self) -> Vec<ContainerId> {
        let ids: BTreeSet<ContainerId> = self
            .0
            .values()
            .filter(|r| r.build_type() == BuildType::LiveUpdate)
            .flat_map(|r| r.container_ids().iter().cloned())
            .collect();
        ids.into_iter().collect()
    }

    pub fn build_types(&self) -> BTreeSet<BuildType> {
        self.0.values().map(BuildResult::build_type).collect()
    }
}

impl FromIterator<BuildResult> for BuildResultSet {
    fn from_iter<I: IntoIterator<Item = BuildResult>>(iter: I) -> Self {
        let mut set = BuildResultSet::new();
        for result in iter {
            set.insert(result);
        }
        set
    }
}

/// A running container kiln can patch in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub pod_id: Option<PodId>,
    pub container_id: ContainerId,
    pub container_name: String,
    pub namespace: Option<String>,
}

impl ContainerInfo {
    pub fn docker(container_id: ContainerId, container_name: impl Into<String>) -> Self {
        Self {
            pod_id: None,
            container_id,
            container_name: container_name.into(),
            namespace: None,
        }
    }
}

/// Input to one build attempt for one target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildState {
    /// Last successful result; `None` iff the target never built.
    pub last_result: Option<BuildResult>,

    /// Files changed since `last_result`. Over-inclusion is fine, omission is not.
    pub files_changed: BTreeSet<PathBuf>,

    /// Dependencies rebuilt since `last_result`.
    pub deps_changed: BTreeSet<TargetId>,

    /// `None` while the deploy has not reported its containers yet.
    pub running_containers: Option<Vec<ContainerInfo>>,

    /// Rebuild even though nothing changed, e.g. on a manual trigger.
    pub full_build_triggered: bool,
}

impl BuildState {
    /// No history, no changes.
    pub fn clean() -> Self {
        Self::default()
    }

    pub fn new(last_result: Option<BuildResult>, files: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            last_result,
            files_changed: files.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn with_deps_changed(mut self, deps: impl IntoIterator<Item = TargetId>) -> Self {
        self.deps_changed = deps.into_iter().collect();
        self
    }

    pub fn with_running_containers(mut self, containers: Vec<ContainerInfo>) -> Self {
        self.running_containers = Some(containers);
        self
    }

    pub fn with_full_build_triggered(mut self, triggered: bool) -> Self {
        self.full_build_triggered = triggered;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.last_result.is_none()
    }

    pub fn needs_image_build(&self) -> bool {
        let reusable = self
            .last_result
            .as_ref()
            .is_some_and(BuildResult::is_reusable);
        !reusable
            || !self.files_changed.is_empty()
            || !self.deps_changed.is_empty()
            || self.full_build_triggered
    }

    pub fn files_changed(&self) -> Vec<PathBuf> {
        self.files_changed.iter().cloned().collect()
    }

    pub fn last_image(&self) -> Option<&ImageRef> {
        self.last_result.as_ref().and_then(BuildResult::image_ref)
    }

    /// Changes since the last image build, including files patched in place since.
    pub fn files_changed_since_last_image(&self) -> Vec<PathBuf> {
        let mut all = self.files_changed.clone();
        if let Some(replaced) = self.last_result.as_ref().and_then(BuildResult::files_replaced) {
            all.extend(replaced.iter().cloned());
        }
        all.into_iter().collect()
    }

    pub fn running_containers(&self) -> &[ContainerInfo] {
        self.running_containers.as_deref().unwrap_or(&[])
    }
}

/// Build inputs for every target of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildStateSet(BTreeMap<TargetId, BuildState>);

impl BuildStateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: TargetId, state: BuildState) {
        self.0.insert(id, state);
    }

    pub fn get(&self, id: &TargetId) -> Option<&BuildState> {
        self.0.get(id)
    }

    pub fn get_or_clean(&self, id: &TargetId) -> BuildState {
        self.0.get(id).cloned().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TargetId, &BuildState)> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&TargetId, &mut BuildState)> {
        self.0.iter_mut()
    }

    /// Sorted union of every target's changed files.
    pub fn files_changed(&self) -> Vec<PathBuf> {
        let all: BTreeSet<&PathBuf> = self.0.values().flat_map(|s| &s.files_changed).collect();
        all.into_iter().cloned().collect()
    }
}

impl FromIterator<(TargetId, BuildState)> for BuildStateSet {
    fn from_iter<I: IntoIterator<Item = (TargetId, BuildState)>>(iter: I) -> Self {
        BuildStateSet(iter.into_iter().collect())
    }
}

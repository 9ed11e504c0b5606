// ABOUTME: Chooses which manifest builds next and records why the others are held.
// ABOUTME: Pure function of EngineState; the BuildController calls it on every change.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use crate::model::{TargetId, TargetSpec};
use crate::store::{
    BuildReason, BuildResult, BuildStatus, EngineState, ManifestTarget, RuntimeStatus,
};
use crate::types::ManifestName;

/// Why a manifest with pending work is not eligible to build right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Hold {
    /// Another build of a manifest sharing one of its targets is in flight.
    BuildingComponent,
    /// A resource dependency has not deployed yet.
    WaitingForDep,
    /// The last deploy has not produced a container to patch yet.
    WaitingForDeploy,
    /// A local target that must run alone is building.
    WaitingForUnparallelizableTarget,
    /// This is a local target that must run alone, and something else is building.
    IsUnparallelizableTarget,
}

impl fmt::Display for Hold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Hold::BuildingComponent => "building-component",
            Hold::WaitingForDep => "waiting-for-dep",
            Hold::WaitingForDeploy => "waiting-for-deploy",
            Hold::WaitingForUnparallelizableTarget => "waiting-for-unparallelizable-target",
            Hold::IsUnparallelizableTarget => "is-unparallelizable-target",
        };
        f.write_str(s)
    }
}

/// Held manifests and the reason for each. The first hold recorded wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HoldSet(BTreeMap<ManifestName, Hold>);

impl HoldSet {
    pub fn get(&self, name: &ManifestName) -> Option<Hold> {
        self.0.get(name).copied()
    }

    pub fn is_held(&self, name: &ManifestName) -> bool {
        self.0.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ManifestName, &Hold)> {
        self.0.iter()
    }

    fn add(&mut self, mt: &ManifestTarget, hold: Hold) {
        if !mt.next_build_reason().is_empty() {
            self.0.entry(mt.manifest.name.clone()).or_insert(hold);
        }
    }

    fn fill(&mut self, targets: &[&ManifestTarget], hold: Hold) {
        for mt in targets {
            self.add(mt, hold);
        }
    }

    fn remove_ineligible<'a>(&self, targets: Vec<&'a ManifestTarget>) -> Vec<&'a ManifestTarget> {
        targets
            .into_iter()
            .filter(|mt| !mt.state.is_building() && !self.is_held(&mt.manifest.name))
            .collect()
    }
}

/// The manifest to build next, if any, plus every hold that applied.
pub fn next_target_to_build(state: &EngineState) -> (Option<ManifestName>, HoldSet) {
    let mut holds = HoldSet::default();
    let mut targets = state.targets();

    if is_building_unparallelizable_local(&targets) {
        holds.fill(&targets, Hold::WaitingForUnparallelizableTarget);
        return (None, holds);
    }

    if targets.iter().any(|mt| mt.state.is_building()) {
        hold_unparallelizable_local_targets(&targets, &mut holds);
    }
    hold_targets_with_building_components(&targets, &mut holds);
    hold_targets_waiting_on_dependencies(state, &targets, &mut holds);

    targets = holds.remove_ineligible(targets);

    let unbuilt: Vec<&ManifestTarget> = targets
        .iter()
        .copied()
        .filter(|mt| !mt.state.started_first_build() && mt.manifest.trigger_mode.auto_initial())
        .collect();
    if let Some(mt) = next_unbuilt_target(&unbuilt) {
        return (Some(mt.manifest.name.clone()), holds);
    }

    if let Some(mt) = targets.iter().find(|mt| mt.state.needs_rebuild_from_crash) {
        return (Some(mt.manifest.name.clone()), holds);
    }

    if let Some(name) = state.trigger_queue.first()
        && let Some(mt) = targets.iter().find(|mt| &mt.manifest.name == name)
    {
        return (Some(mt.manifest.name.clone()), holds);
    }

    for mt in &targets {
        if is_live_update_target_waiting_on_deploy(mt) {
            holds.add(mt, Hold::WaitingForDeploy);
        }
    }
    targets = holds.remove_ineligible(targets);

    let next = earliest_pending_auto_trigger_target(&targets).map(|mt| mt.manifest.name.clone());
    (next, holds)
}

fn is_unparallelizable_local(mt: &ManifestTarget) -> bool {
    matches!(&mt.manifest.deploy_target, TargetSpec::Local(local) if !local.allow_parallel)
}

fn is_building_unparallelizable_local(targets: &[&ManifestTarget]) -> bool {
    targets
        .iter()
        .any(|mt| mt.state.is_building() && is_unparallelizable_local(mt))
}

fn hold_unparallelizable_local_targets(targets: &[&ManifestTarget], holds: &mut HoldSet) {
    for mt in targets {
        if is_unparallelizable_local(mt) {
            holds.add(mt, Hold::IsUnparallelizableTarget);
        }
    }
}

/// Whether a shared image target will likely be reused rather than rebuilt.
/// A cheap stand-in for the full check the target queue makes.
fn can_reuse_image_heuristic(spec: &TargetSpec, status: Option<&BuildStatus>) -> bool {
    let TargetSpec::Image(_) = spec else {
        return false;
    };
    let Some(status) = status else {
        return false;
    };
    if status.has_pending_changes() {
        return false;
    }
    matches!(
        status.last_result,
        Some(BuildResult::Image { .. } | BuildResult::LiveUpdate { .. })
    )
}

/// Target IDs of `mt` that a build of it would touch.
fn component_ids(mt: &ManifestTarget) -> Vec<TargetId> {
    mt.manifest
        .target_specs()
        .iter()
        .filter(|spec| !can_reuse_image_heuristic(spec, mt.state.build_status(spec.id())))
        .map(|spec| spec.id().clone())
        .collect()
}

fn hold_targets_with_building_components(targets: &[&ManifestTarget], holds: &mut HoldSet) {
    let mut building: BTreeSet<TargetId> = BTreeSet::new();
    for mt in targets.iter().filter(|mt| mt.state.is_building()) {
        building.insert(mt.manifest.deploy_target_id().clone());
        building.extend(component_ids(mt));
    }

    for mt in targets {
        let busy = building.contains(mt.manifest.deploy_target_id())
            || component_ids(mt).iter().any(|id| building.contains(id));
        if busy {
            holds.add(mt, Hold::BuildingComponent);
        }
    }
}

/// Resource dependencies only gate the first build.
fn is_waiting_on_dependencies(state: &EngineState, mt: &ManifestTarget) -> bool {
    if mt.state.started_first_build() {
        return false;
    }
    mt.manifest.resource_deps.iter().any(|dep| {
        !state.manifest_state(dep).is_some_and(|ms| {
            ms.last_successful_deploy_time.is_some() || ms.runtime_state.has_ever_been_ready
        })
    })
}

fn hold_targets_waiting_on_dependencies(
    state: &EngineState,
    targets: &[&ManifestTarget],
    holds: &mut HoldSet,
) {
    for mt in targets {
        if is_waiting_on_dependencies(state, mt) {
            holds.add(mt, Hold::WaitingForDep);
        }
    }
}

/// Local targets first, since they may write files cluster builds read.
/// Then Kubernetes manifests without images, then definition order.
fn next_unbuilt_target<'a>(unbuilt: &[&'a ManifestTarget]) -> Option<&'a ManifestTarget> {
    unbuilt
        .iter()
        .find(|mt| mt.manifest.is_local())
        .or_else(|| {
            unbuilt
                .iter()
                .find(|mt| mt.manifest.is_k8s() && mt.manifest.image_targets.is_empty())
        })
        .or_else(|| unbuilt.first())
        .copied()
}

/// Earliest pending change wins; ties go to the first in definition order.
/// Manual manifests only build through the trigger queue.
fn earliest_pending_auto_trigger_target<'a>(
    targets: &[&'a ManifestTarget],
) -> Option<&'a ManifestTarget> {
    let mut choice: Option<(&ManifestTarget, chrono::DateTime<chrono::Utc>)> = None;
    for mt in targets {
        if !mt.manifest.trigger_mode.auto_on_change() {
            continue;
        }
        let Some(at) = mt.state.earliest_pending_change() else {
            continue;
        };
        if choice.is_none_or(|(_, earliest)| at < earliest) {
            choice = Some((mt, at));
        }
    }
    choice.map(|(mt, _)| mt)
}

/// True when a file change should wait for the pending deploy instead of
/// triggering a full rebuild that would replace it: every change is
/// live-updatable and no container is running yet.
fn is_live_update_target_waiting_on_deploy(mt: &ManifestTarget) -> bool {
    if mt.next_build_reason() != BuildReason::CHANGED_FILES {
        return false;
    }

    let ms = &mt.state;
    if !ms.last_build().is_some_and(|b| b.succeeded()) {
        return false;
    }
    if ms.runtime_state.status == RuntimeStatus::Error {
        return false;
    }

    for (id, status) in &ms.build_statuses {
        if status.pending_file_changes.is_empty() {
            continue;
        }
        let Some(image) = mt.manifest.image_target(id) else {
            return false;
        };
        let Some(lu) = &image.live_update else {
            return false;
        };

        let files: Vec<PathBuf> = status.pending_file_changes.keys().cloned().collect();
        let (_, unmatched) = lu.files_to_path_mappings(&files);
        if !unmatched.is_empty() || lu.fall_back_on_match(&files).is_some() {
            return false;
        }

        if !(mt.manifest.is_k8s() || mt.manifest.is_docker_compose()) {
            return false;
        }
        if !ms.runtime_state.containers.is_empty() {
            return false;
        }
    }

    true
}

// ABOUTME: Pure state transitions applied by the store's reducer task.
// ABOUTME: One function per action kind, each returning what changed.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, warn};

use super::action::{Action, BuildCompleteAction, BuildEvent, BuildStartedAction, ChangeSummary};
use super::build_result::{BuildResult, BuildResultSet, BuildType, ContainerInfo};
use super::engine_state::{
    BuildReason, BuildRecord, BuildStatus, EngineState, ManifestTarget, RuntimeStatus,
};
use crate::model::{Manifest, TargetId, TargetSpec};
use crate::types::{ImageRef, ManifestName};

/// Apply one action to the engine state.
pub fn reduce(state: &mut EngineState, action: Action) -> ChangeSummary {
    debug!(action = action.name(), "reducing");
    match action {
        Action::ConfigsReloaded {
            manifests,
            changed_files,
        } => handle_configs_reloaded(state, manifests, &changed_files),
        Action::FileChange {
            target_id,
            paths,
            at,
        } => handle_file_change(state, &target_id, paths, at),
        Action::ManualTrigger { manifest, reason } => handle_manual_trigger(state, manifest, reason),
        Action::RuntimeStateChanged {
            manifest,
            images,
            status,
            containers,
        } => handle_runtime_state(state, manifest, &images, status, containers),
        Action::BuildStarted(started) => handle_build_started(state, started),
        Action::BuildComplete(complete) => handle_build_completed(state, complete),
        Action::Error { message } => {
            error!(error = %message, "engine error");
            state.last_error = Some(message.clone());
            ChangeSummary {
                errors: vec![message],
                ..Default::default()
            }
        }
    }
}

fn handle_configs_reloaded(
    state: &mut EngineState,
    manifests: Vec<Manifest>,
    changed_files: &[std::path::PathBuf],
) -> ChangeSummary {
    let now = Utc::now();
    let mut summary = ChangeSummary {
        config_reloaded: true,
        ..Default::default()
    };

    let new_names: BTreeSet<ManifestName> = manifests.iter().map(|m| m.name.clone()).collect();
    let removed: Vec<ManifestName> = state
        .manifest_targets
        .keys()
        .filter(|name| !new_names.contains(*name))
        .cloned()
        .collect();
    for name in removed {
        debug!(manifest = %name, "manifest removed");
        state.manifest_targets.remove(&name);
        state.trigger_queue.retain(|n| n != &name);
        summary.manifests.insert(name);
    }

    state.manifest_definition_order = manifests.iter().map(|m| m.name.clone()).collect();

    for manifest in manifests {
        let name = manifest.name.clone();
        match state.manifest_targets.get_mut(&name) {
            Some(mt) if mt.manifest == manifest => {}
            Some(mt) => {
                let ids: BTreeSet<TargetId> = manifest.target_ids().into_iter().collect();
                mt.state.build_statuses.retain(|id, _| ids.contains(id));
                for id in ids {
                    mt.state.build_statuses.entry(id).or_default();
                }
                for path in changed_files {
                    if manifest.config_files.contains(path)
                        && !mt.state.config_files_that_caused_change.contains(path)
                    {
                        mt.state.config_files_that_caused_change.push(path.clone());
                    }
                }
                mt.manifest = manifest;
                mt.state.pending_manifest_change = Some(now);
                summary.manifests.insert(name);
            }
            None => {
                state
                    .manifest_targets
                    .insert(name.clone(), ManifestTarget::new(manifest));
                summary.manifests.insert(name);
            }
        }
    }

    summary
}

fn handle_file_change(
    state: &mut EngineState,
    target_id: &TargetId,
    paths: Vec<std::path::PathBuf>,
    at: DateTime<Utc>,
) -> ChangeSummary {
    let mut summary = ChangeSummary::default();

    for mt in state.manifest_targets.values_mut() {
        if !mt.manifest.has_target(target_id) {
            continue;
        }

        for path in &mt.manifest.config_files {
            if paths.contains(path) && !mt.state.config_files_that_caused_change.contains(path) {
                mt.state.config_files_that_caused_change.push(path.clone());
            }
        }

        let status = mt.state.build_status_mut(target_id);
        for path in &paths {
            let seen = status.pending_file_changes.entry(path.clone()).or_insert(at);
            if at > *seen {
                *seen = at;
            }
        }
        summary.manifests.insert(mt.manifest.name.clone());
    }

    if summary.manifests.is_empty() {
        debug!(target = %target_id, "file change for unknown target ignored");
    }
    summary
}

fn handle_manual_trigger(
    state: &mut EngineState,
    name: ManifestName,
    reason: BuildReason,
) -> ChangeSummary {
    let Some(mt) = state.manifest_targets.get_mut(&name) else {
        warn!(manifest = %name, "trigger for unknown manifest ignored");
        return ChangeSummary::default();
    };

    mt.state.trigger_reason = mt.state.trigger_reason.with(reason);
    if !state.trigger_queue.contains(&name) {
        state.trigger_queue.push(name.clone());
    }
    ChangeSummary::manifest(name)
}

fn handle_runtime_state(
    state: &mut EngineState,
    name: ManifestName,
    images: &[ImageRef],
    status: RuntimeStatus,
    containers: Vec<ContainerInfo>,
) -> ChangeSummary {
    let Some(mt) = state.manifest_targets.get_mut(&name) else {
        return ChangeSummary::default();
    };

    // Reports for an earlier deploy describe pods that are being replaced.
    let deployed = mt.deployed_images();
    if deployed != images {
        debug!(manifest = %name, reported = ?images, deployed = ?deployed, "stale runtime report dropped");
        return ChangeSummary::default();
    }

    let ms = &mut mt.state;
    let lost_live_update = ms
        .live_updated_container_ids
        .iter()
        .any(|id| !containers.iter().any(|c| &c.container_id == id));
    let crashed_after_live_update =
        status == RuntimeStatus::Error && ms.last_build_was_live_update();

    ms.runtime_state.status = status;
    ms.runtime_state.containers = containers;
    if status == RuntimeStatus::Ready {
        ms.runtime_state.has_ever_been_ready = true;
    }

    // Restarted containers run the image again and lose in-place updates.
    if !ms.is_building()
        && !ms.needs_rebuild_from_crash
        && (lost_live_update || crashed_after_live_update)
    {
        warn!(manifest = %name, "container changed after a live update, rebuilding");
        ms.needs_rebuild_from_crash = true;
        ms.live_updated_container_ids.clear();
    }

    ChangeSummary::manifest(name)
}

fn handle_build_started(state: &mut EngineState, action: BuildStartedAction) -> ChangeSummary {
    state.started_build_count += 1;

    let name = action.manifest;
    let Some(mt) = state.manifest_targets.get_mut(&name) else {
        return ChangeSummary::default();
    };

    let ms = &mut mt.state;
    ms.current_build = Some(BuildRecord {
        build_count: action.build_count,
        start_time: action.start_time,
        finish_time: None,
        reason: action.reason,
        edits: action.files_changed.clone(),
        build_types: BTreeSet::new(),
        error: None,
    });
    ms.config_files_that_caused_change.clear();
    ms.trigger_reason = BuildReason::NONE;
    if action.full_build_triggered {
        ms.runtime_state.containers.clear();
    }

    state.currently_building.insert(name.clone());
    state.trigger_queue.retain(|n| n != &name);

    let mut summary = ChangeSummary::manifest(name.clone());
    summary.events.push(BuildEvent::Started {
        manifest: name,
        build_count: action.build_count,
        reason: action.reason,
        files_changed: action.files_changed,
    });
    summary
}

fn handle_build_completed(state: &mut EngineState, action: BuildCompleteAction) -> ChangeSummary {
    state.completed_build_count += 1;
    let name = action.manifest;
    state.currently_building.remove(&name);

    let limit = state.build_history_limit;
    let Some(mt) = state.manifest_targets.get_mut(&name) else {
        return ChangeSummary::default();
    };

    let ms = &mut mt.state;
    let mut record = ms.current_build.take().unwrap_or_else(|| BuildRecord {
        build_count: action.build_count,
        start_time: action.finish_time,
        finish_time: None,
        reason: BuildReason::NONE,
        edits: Vec::new(),
        build_types: BTreeSet::new(),
        error: None,
    });
    record.finish_time = Some(action.finish_time);
    ms.needs_rebuild_from_crash = false;

    let start_time = record.start_time;
    let results = match action.result {
        Ok(results) => {
            record.build_types = results.build_types();
            Some(results)
        }
        Err(err) => {
            warn!(manifest = %name, error = %err, kind = %err.kind(), "build failed");
            record.error = Some(err);
            None
        }
    };

    if ms.pending_manifest_change.is_some_and(|at| at <= start_time) {
        ms.pending_manifest_change = None;
    }

    let event = BuildEvent::Completed {
        manifest: name.clone(),
        build_count: record.build_count,
        duration: action.finish_time - start_time,
        error: record.error.clone(),
    };
    ms.push_history(record, limit);

    if let Some(results) = results {
        apply_build_results(mt, &results, start_time, action.finish_time);
        propagate_shared_images(state, &name, &results, start_time);
    }

    let mut summary = ChangeSummary::manifest(name);
    summary.events.push(event);
    summary
}

fn apply_build_results(
    mt: &mut ManifestTarget,
    results: &BuildResultSet,
    start_time: DateTime<Utc>,
    finish_time: DateTime<Utc>,
) {
    let ms = &mut mt.state;
    for (id, result) in results.iter() {
        ms.build_status_mut(id).last_result = Some(result.clone());
    }
    for status in ms.build_statuses.values_mut() {
        status.clear_pending_changes_before(start_time);
    }
    ms.last_successful_deploy_time = Some(finish_time);

    let fresh_image = results.results().any(|r| r.fresh_image().is_some());
    if fresh_image {
        ms.live_updated_container_ids.clear();
    } else if results.build_types().contains(&BuildType::LiveUpdate) {
        ms.live_updated_container_ids = results.live_updated_container_ids().into_iter().collect();
    }

    // Fresh images roll out new pods; the old containers are no longer a
    // target for in-place updates until the runtime monitor reports again.
    if mt.manifest.is_k8s() && fresh_image {
        ms.runtime_state.status = RuntimeStatus::Pending;
        ms.runtime_state.containers.clear();
    }

    // Compose reports the service container directly, so it can be
    // patched in place without waiting for a runtime watcher.
    if let TargetSpec::DockerCompose(dc) = &mt.manifest.deploy_target {
        let containers: Vec<ContainerInfo> = results
            .get(&dc.id)
            .map(|r| {
                r.container_ids()
                    .iter()
                    .map(|cid| ContainerInfo::docker(cid.clone(), dc.service.clone()))
                    .collect()
            })
            .unwrap_or_default();
        if !containers.is_empty() {
            ms.runtime_state.status = RuntimeStatus::Ready;
            ms.runtime_state.has_ever_been_ready = true;
            ms.runtime_state.containers = containers;
        }
    }
}

/// Hand freshly built images to other manifests that share the image target
/// and are already queued, and mark their dependents dirty.
fn propagate_shared_images(
    state: &mut EngineState,
    built: &ManifestName,
    results: &BuildResultSet,
    start_time: DateTime<Utc>,
) {
    let images: Vec<&BuildResult> = results
        .results()
        .filter(|r| r.fresh_image().is_some())
        .collect();
    if images.is_empty() {
        return;
    }

    let building = state.currently_building.clone();
    for (name, mt) in state.manifest_targets.iter_mut() {
        if name == built || building.contains(name) || mt.next_build_reason().is_empty() {
            continue;
        }

        let mut updated: BTreeSet<TargetId> = BTreeSet::new();
        for result in &images {
            let id = result.target_id();
            if !mt.manifest.has_target(id) {
                continue;
            }
            let status: &mut BuildStatus = mt.state.build_status_mut(id);
            status.last_result = Some((*result).clone());
            status.clear_pending_changes_before(start_time);
            updated.insert(id.clone());
        }
        if updated.is_empty() {
            continue;
        }

        let reverse: BTreeMap<TargetId, Vec<TargetId>> = mt.manifest.reverse_dependency_ids();
        for id in &updated {
            for dependent in reverse.get(id).into_iter().flatten() {
                if updated.contains(dependent) {
                    continue;
                }
                mt.state
                    .build_status_mut(dependent)
                    .pending_dependency_changes
                    .insert(id.clone(), start_time);
            }
        }
        debug!(manifest = %name, images = updated.len(), "reused images built by {}", built);
    }
}

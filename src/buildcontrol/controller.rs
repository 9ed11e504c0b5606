// ABOUTME: Store subscriber that starts the next eligible build and reports its outcome.
// ABOUTME: Each build runs on its own task; the reducer only sees BuildStarted/BuildComplete.

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use super::composite::BuildAndDeployer;
use super::context::BuildContext;
use super::error::BuildError;
use super::next_target::next_target_to_build;
use crate::model::{TargetSpec, TargetType};
use crate::store::{
    Action, BuildCompleteAction, BuildReason, BuildResultSet, BuildStartedAction, BuildState,
    BuildStateSet, ChangeSummary, ManifestTarget, Store, StoreError, Subscriber,
};
use crate::types::ManifestName;

/// Everything a build task needs, captured under the read lock.
#[derive(Debug, Clone)]
struct BuildEntry {
    name: ManifestName,
    specs: Vec<TargetSpec>,
    state_set: BuildStateSet,
    files_changed: Vec<PathBuf>,
    reason: BuildReason,
    first_build: bool,
    build_count: usize,
}

pub struct BuildController {
    builder: Arc<dyn BuildAndDeployer>,
    /// Builds this controller started. Compared against the store's count so a
    /// build is never started twice before its BuildStarted is reduced.
    builds_started: Mutex<usize>,
    shutdown: watch::Receiver<bool>,
}

impl BuildController {
    pub fn new(builder: Arc<dyn BuildAndDeployer>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            builder,
            builds_started: Mutex::new(0),
            shutdown,
        }
    }

    fn needs_build(&self, store: &Store) -> Option<BuildEntry> {
        let state = store.rlock_state();
        let mut started = self.builds_started.lock();

        if *started != state.started_build_count {
            return None;
        }
        if state.available_build_slots() < 1 {
            return None;
        }

        let (next, holds) = next_target_to_build(&state);
        if !holds.is_empty() {
            debug!(holds = holds.len(), "manifests on hold");
        }
        let mt = state.manifest_target(&next?)?;

        *started += 1;
        let state_set = build_state_set(mt);
        let mut files_changed = mt.state.config_files_that_caused_change.clone();
        files_changed.extend(state_set.files_changed());

        Some(BuildEntry {
            name: mt.manifest.name.clone(),
            specs: mt.manifest.target_specs(),
            state_set,
            files_changed,
            reason: mt.next_build_reason(),
            first_build: !mt.state.started_first_build(),
            build_count: *started,
        })
    }

    fn spawn_build(&self, store: &Store, entry: BuildEntry) {
        let builder = self.builder.clone();
        let store = store.clone();
        let ctx = BuildContext::new(entry.name.clone(), self.shutdown.clone());

        tokio::spawn(async move {
            log_build_entry(&entry);

            let result = AssertUnwindSafe(build_and_deploy(builder.as_ref(), &ctx, &entry))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(BuildError::unexpected(format!(
                        "build panicked: {}",
                        crate::store::panic_message(&*panic)
                    )))
                });

            store.dispatch(Action::BuildComplete(BuildCompleteAction {
                manifest: entry.name,
                build_count: entry.build_count,
                result,
                finish_time: Utc::now(),
            }));
        });
    }
}

async fn build_and_deploy(
    builder: &dyn BuildAndDeployer,
    ctx: &BuildContext,
    entry: &BuildEntry,
) -> Result<BuildResultSet, BuildError> {
    for spec in &entry.specs {
        spec.validate()
            .map_err(|e| BuildError::dont_fall_back(e.to_string()))?;
    }
    builder
        .build_and_deploy(ctx, &entry.specs, &entry.state_set)
        .await
}

fn log_build_entry(entry: &BuildEntry) {
    if entry.first_build {
        info!(manifest = %entry.name, build = entry.build_count, "Building: {}", entry.name);
        return;
    }
    if !entry.files_changed.is_empty() {
        let files: Vec<String> = entry
            .files_changed
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        info!(
            manifest = %entry.name,
            "{} changed: {}",
            files.len(),
            files.join(", ")
        );
    }
    info!(
        manifest = %entry.name,
        build = entry.build_count,
        reason = %entry.reason,
        "Rebuilding: {}", entry.name
    );
}

/// Build inputs for every target of `mt`, from its pending changes and runtime.
pub(crate) fn build_state_set(mt: &ManifestTarget) -> BuildStateSet {
    let manifest = &mt.manifest;
    let ms = &mt.state;
    let local_paths = manifest.local_paths();
    let last_start = ms.last_build().map(|b| b.start_time);

    // Config files reload the manifest; they only count as source changes
    // when they also live under a watched path.
    let is_config_only = |path: &PathBuf| {
        manifest.config_files.contains(path) && !local_paths.iter().any(|p| path.starts_with(p))
    };

    let mut any_changed_since_last_build = false;
    let mut result = BuildStateSet::new();

    for spec in manifest.target_specs() {
        let id = spec.id();
        let Some(status) = ms.build_status(id) else {
            result.insert(id.clone(), BuildState::clean());
            continue;
        };

        let mut files = Vec::new();
        for (path, at) in &status.pending_file_changes {
            if is_config_only(path) {
                continue;
            }
            if last_start.is_none_or(|start| *at > start) {
                any_changed_since_last_build = true;
            }
            files.push(path.clone());
        }

        let mut state = BuildState::new(status.last_result.clone(), files)
            .with_deps_changed(status.pending_dependency_changes.keys().cloned());

        // Crashed containers restarted from the image, so they are not a
        // trustworthy base for an in-place update.
        if spec.target_type() == TargetType::Image
            && !ms.needs_rebuild_from_crash
            && (manifest.is_k8s() || manifest.is_docker_compose())
        {
            state = state.with_running_containers(ms.runtime_state.containers.clone());
        }

        result.insert(id.clone(), state);
    }

    if !ms.needs_rebuild_from_crash && !any_changed_since_last_build {
        for (_, state) in result.iter_mut() {
            state.full_build_triggered = true;
        }
    }

    result
}

#[async_trait]
impl Subscriber for BuildController {
    fn name(&self) -> &str {
        "build-controller"
    }

    async fn on_change(&self, store: &Store, _summary: ChangeSummary) -> Result<(), StoreError> {
        let Some(entry) = self.needs_build(store) else {
            return Ok(());
        };

        store.dispatch(Action::BuildStarted(BuildStartedAction {
            manifest: entry.name.clone(),
            start_time: Utc::now(),
            files_changed: entry.files_changed.clone(),
            reason: entry.reason,
            build_count: entry.build_count,
            full_build_triggered: entry.state_set.iter().any(|(_, s)| s.full_build_triggered),
        }));

        self.spawn_build(store, entry);
        Ok(())
    }
}

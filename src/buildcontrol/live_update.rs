// ABOUTME: In-place update strategy: copies changed files into running containers and runs steps.
// ABOUTME: Redirects to a full build whenever the change cannot be expressed as a file sync.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::composite::BuildAndDeployer;
use super::context::BuildContext;
use super::error::{BuildError, BuildErrorKind};
use super::extractors::{LiveUpdateStateTree, extract_image_targets_for_live_updates};
use crate::model::{Cmd, PathMapping, TargetSpec};
use crate::runtime::archive::{split_mappings, tar_mappings};
use crate::runtime::{ContainerUpdate, ContainerUpdater, RuntimeError};
use crate::store::{BuildResult, BuildResultSet, BuildStateSet, ContainerInfo};

/// Which updater patches containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdaterChoice {
    /// Through the local docker daemon.
    Docker,
    /// Through `kubectl exec`.
    Exec,
}

pub struct LiveUpdateBuildAndDeployer {
    docker: Arc<dyn ContainerUpdater>,
    exec: Arc<dyn ContainerUpdater>,
    choice: UpdaterChoice,
}

/// One image's worth of work for a live update.
#[derive(Debug)]
struct LiveUpdateInput<'a> {
    tree: &'a LiveUpdateStateTree,
    name: String,
    mappings: Vec<PathMapping>,
    cmds: Vec<Cmd>,
    hot_reload: bool,
}

impl LiveUpdateBuildAndDeployer {
    pub fn new(
        docker: Arc<dyn ContainerUpdater>,
        exec: Arc<dyn ContainerUpdater>,
        choice: UpdaterChoice,
    ) -> Self {
        Self {
            docker,
            exec,
            choice,
        }
    }

    /// Compose containers always live on the local daemon.
    fn updater_for(&self, specs: &[TargetSpec]) -> &dyn ContainerUpdater {
        let is_compose = specs
            .iter()
            .any(|s| matches!(s, TargetSpec::DockerCompose(_)));
        if is_compose || self.choice == UpdaterChoice::Docker {
            self.docker.as_ref()
        } else {
            self.exec.as_ref()
        }
    }

    async fn update_image(
        &self,
        ctx: &BuildContext,
        updater: &dyn ContainerUpdater,
        input: &LiveUpdateInput<'_>,
    ) -> Result<(), BuildError> {
        let containers = &input.tree.containers;
        let ids = short_ids(containers);
        let suffix = if containers.len() == 1 { "" } else { "(s)" };

        let plan = split_mappings(&input.mappings);
        if !plan.to_delete.is_empty() {
            info!(
                manifest = %ctx.manifest(),
                "Will delete {} file(s) from container{}: {}",
                plan.to_delete.len(), suffix, ids
            );
        }
        if !plan.to_archive.is_empty() {
            info!(
                manifest = %ctx.manifest(),
                "Will copy {} file(s) to container{}: {}",
                plan.to_archive.len(), suffix, ids
            );
            for mapping in &plan.to_archive {
                info!(manifest = %ctx.manifest(), "- {}", mapping);
            }
        }

        let archive = if plan.to_archive.is_empty() {
            Vec::new()
        } else {
            tar_mappings(&plan.to_archive).map_err(RuntimeError::into_infra_failure)?
        };
        let update = ContainerUpdate {
            archive,
            to_delete: plan.to_delete,
            cmds: input.cmds.clone(),
            hot_reload: input.hot_reload,
        };

        let mut last_user_failure: Option<RuntimeError> = None;
        for container in containers {
            let short = container.container_id.short_str();
            match updater.update_container(ctx, container, &update).await {
                Ok(()) => {
                    info!(manifest = %ctx.manifest(), "  → Container {} updated!", short);
                    if let Some(failure) = &last_user_failure {
                        // Containers now disagree on their files; only a rebuild fixes that.
                        return Err(BuildError::unexpected(format!(
                            "Failed to update container: container {} successfully updated, \
                             but last update failed with '{}'",
                            short, failure
                        )));
                    }
                }
                Err(err) if err.is_run_step_failure() => {
                    // Keep going so every container ends up with the same files.
                    info!(
                        manifest = %ctx.manifest(),
                        "  → Failed to update container {}: {}", short, err
                    );
                    last_user_failure = Some(err);
                }
                Err(err) => return Err(err.into_infra_failure()),
            }
        }

        match last_user_failure {
            Some(failure) => Err(failure.into_user_failure()),
            None => Ok(()),
        }
    }
}

fn short_ids(containers: &[ContainerInfo]) -> String {
    containers
        .iter()
        .map(|c| c.container_id.short_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Validate one state tree. `None` means there is nothing to sync for it.
fn live_update_input(tree: &LiveUpdateStateTree) -> Result<Option<LiveUpdateInput<'_>>, BuildError> {
    let image = &tree.image_target;
    let Some(spec) = image.live_update.as_ref() else {
        return Err(BuildError::unexpected(format!(
            "did not find Live Update info on target {}",
            image.id
        )));
    };

    let (mappings, unmatched) = spec.files_to_path_mappings(&tree.files_changed);
    if !unmatched.is_empty() {
        let files: Vec<_> = unmatched.iter().map(|f| spec.display_path(f)).collect();
        return Err(BuildError::info_redirect(format!(
            "Found file(s) not matching any sync for {} (files: {})",
            image.id,
            files.join(", ")
        )));
    }

    if let Some(file) = spec.fall_back_on_match(&tree.files_changed) {
        return Err(BuildError::info_redirect(format!(
            "Detected change to fall_back_on file \"{}\"",
            spec.display_path(file)
        )));
    }

    if mappings.is_empty() {
        return Ok(None);
    }

    let cmds = spec.boil_runs(&mappings);
    Ok(Some(LiveUpdateInput {
        tree,
        name: image.image_ref.familiar_name(),
        mappings,
        cmds,
        hot_reload: !spec.restart,
    }))
}

/// Live-update results for updated images, plus invalidation markers for their
/// changed dependencies so those rebuild next time.
fn result_set(inputs: &[LiveUpdateInput<'_>]) -> BuildResultSet {
    let mut results = BuildResultSet::new();
    for input in inputs {
        let tree = input.tree;
        let image_id = &tree.image_target.id;
        results.insert(BuildResult::live_update(
            image_id.clone(),
            tree.build_state.last_result.as_ref(),
            tree.containers.iter().map(|c| c.container_id.clone()).collect(),
            input.mappings.iter().map(|m| m.local_path.clone()),
        ));
        for id in tree.ids_with_changes.iter().filter(|id| *id != image_id) {
            results.insert(BuildResult::invalidated(id.clone()));
        }
    }
    results
}

#[async_trait]
impl BuildAndDeployer for LiveUpdateBuildAndDeployer {
    fn name(&self) -> &'static str {
        "live-update"
    }

    async fn build_and_deploy(
        &self,
        ctx: &BuildContext,
        specs: &[TargetSpec],
        state_set: &BuildStateSet,
    ) -> Result<BuildResultSet, BuildError> {
        let trees = extract_image_targets_for_live_updates(specs, state_set)?;
        if trees.is_empty() {
            return Err(BuildError::silent_redirect("no targets for Live Update found"));
        }

        let updater = self.updater_for(specs);
        let mut inputs = Vec::with_capacity(trees.len());
        for tree in &trees {
            if let Some(input) = live_update_input(tree)? {
                inputs.push(input);
            }
        }

        let mut dont_fall_back = None;
        for input in &inputs {
            ctx.check_cancelled()?;
            info!(
                manifest = %ctx.manifest(),
                updater = updater.name(),
                "updating image {}", input.name
            );
            match self.update_image(ctx, updater, input).await {
                Ok(()) => {}
                Err(err) if err.kind() == BuildErrorKind::DontFallBack => dont_fall_back = Some(err),
                Err(err) => return Err(err),
            }
        }

        match dont_fall_back {
            Some(err) => Err(err),
            None => Ok(result_set(&inputs)),
        }
    }
}

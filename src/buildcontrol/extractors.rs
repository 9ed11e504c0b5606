// ABOUTME: Decides whether a manifest's change can be applied as an in-place container update.
// ABOUTME: Produces one state tree per deployed image, or a redirect explaining why not.

use std::collections::BTreeSet;
use std::path::PathBuf;

use super::error::BuildError;
use crate::model::{ImageTarget, TargetGraph, TargetId, TargetSpec};
use crate::store::{BuildState, BuildStateSet, ContainerInfo};

/// Everything needed to live-update one deployed image.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveUpdateStateTree {
    pub image_target: ImageTarget,
    /// Changed files across the image and its dependencies, sorted.
    pub files_changed: Vec<PathBuf>,
    pub build_state: BuildState,
    pub containers: Vec<ContainerInfo>,
    /// Targets in the image's tree that had file changes.
    pub ids_with_changes: Vec<TargetId>,
}

fn graph_error(e: impl std::fmt::Display) -> BuildError {
    BuildError::unexpected(e.to_string())
}

/// Targets under `root` (inclusive) with changed files, in dependency order.
pub fn has_file_changes_tree(
    graph: &TargetGraph,
    root: &TargetId,
    state_set: &BuildStateSet,
) -> Result<Vec<TargetId>, BuildError> {
    let mut ids = Vec::new();
    graph
        .visit_tree(root, |spec| {
            if state_set
                .get(spec.id())
                .is_some_and(|s| !s.files_changed.is_empty())
            {
                ids.push(spec.id().clone());
            }
        })
        .map_err(graph_error)?;
    Ok(ids)
}

/// Union of changed files under `root` (inclusive), deduplicated and sorted.
pub fn files_changed_tree(
    graph: &TargetGraph,
    root: &TargetId,
    state_set: &BuildStateSet,
) -> Result<Vec<PathBuf>, BuildError> {
    let mut files = BTreeSet::new();
    graph
        .visit_tree(root, |spec| {
            if let Some(state) = state_set.get(spec.id()) {
                files.extend(state.files_changed.iter().cloned());
            }
        })
        .map_err(graph_error)?;
    Ok(files.into_iter().collect())
}

/// State trees for every deployed image with changes that a live update could apply.
/// Images without changes are skipped; any image that needs a real build redirects.
pub fn extract_image_targets_for_live_updates(
    specs: &[TargetSpec],
    state_set: &BuildStateSet,
) -> Result<Vec<LiveUpdateStateTree>, BuildError> {
    let graph = TargetGraph::new(specs).map_err(graph_error)?;
    if !graph.is_single_source_dag() {
        return Err(BuildError::unexpected(
            "Cannot extract live updates on this build graph structure",
        ));
    }

    let mut trees = Vec::new();
    for image in graph.deployed_images() {
        let state = state_set.get_or_clean(&image.id);

        if state.is_empty() {
            return Err(BuildError::silent_redirect(
                "In-place build does not support initial deploy",
            ));
        }
        if state.full_build_triggered {
            return Err(BuildError::silent_redirect(
                "Force update (triggered manually, not automatically, with no dirty files)",
            ));
        }
        if !state.deps_changed.is_empty() {
            return Err(BuildError::silent_redirect("Pending dependencies"));
        }

        let ids_with_changes = has_file_changes_tree(&graph, &image.id, state_set)?;
        if ids_with_changes.is_empty() {
            continue;
        }

        if image.live_update.as_ref().is_none_or(|lu| lu.is_empty()) {
            return Err(BuildError::silent_redirect(
                "LiveUpdate requires that LiveUpdate details be specified",
            ));
        }

        let files_changed = files_changed_tree(&graph, &image.id, state_set)?;

        let containers = match &state.running_containers {
            Some(containers) if !containers.is_empty() => containers.clone(),
            _ => {
                return Err(BuildError::not_ready(format!(
                    "Don't have info for running container of image {} \
                     (often a result of the deployment not yet being ready)",
                    image.image_ref.familiar_name()
                )));
            }
        };

        trees.push(LiveUpdateStateTree {
            image_target: image.clone(),
            files_changed,
            build_state: state,
            containers,
            ids_with_changes,
        });
    }

    Ok(trees)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buildcontrol::{BuildErrorKind, RedirectLevel};
    use crate::model::{K8sTarget, LiveUpdateSpec, SyncRule};
    use crate::store::BuildResult;
    use crate::types::{ContainerId, ImageRef};

    fn live_update() -> LiveUpdateSpec {
        LiveUpdateSpec {
            syncs: vec![SyncRule {
                local_path: PathBuf::from("/src/web"),
                container_path: "/app".to_string(),
            }],
            ..Default::default()
        }
    }

    fn specs(with_live_update: bool) -> Vec<TargetSpec> {
        let mut web = ImageTarget::new("web", ImageRef::parse("web").unwrap(), "/src/web")
            .with_dependencies(vec![TargetId::image("base")]);
        if with_live_update {
            web = web.with_live_update(live_update());
        }
        let base = ImageTarget::new("base", ImageRef::parse("base").unwrap(), "/src/base");
        let deploy = K8sTarget {
            id: TargetId::k8s("web"),
            yaml_path: PathBuf::from("/src/web.yaml"),
            namespace: None,
            image_dependency_ids: vec![TargetId::image("web")],
        };
        vec![base.into(), web.into(), deploy.into()]
    }

    fn container() -> ContainerInfo {
        ContainerInfo::docker(ContainerId::new("c0ffee"), "web")
    }

    fn built(name: &str) -> Option<BuildResult> {
        Some(BuildResult::image(
            TargetId::image(name),
            ImageRef::parse(&format!("{name}:kiln-1")).unwrap(),
        ))
    }

    fn state_set(web_files: &[&str], base_files: &[&str]) -> BuildStateSet {
        let web = BuildState::new(built("web"), web_files.iter().map(PathBuf::from))
            .with_running_containers(vec![container()]);
        let base = BuildState::new(built("base"), base_files.iter().map(PathBuf::from));
        [(TargetId::image("web"), web), (TargetId::image("base"), base)]
            .into_iter()
            .collect()
    }

    #[test]
    fn produces_tree_with_changes_from_dependencies() {
        let trees = extract_image_targets_for_live_updates(
            &specs(true),
            &state_set(&["/src/web/b.go", "/src/web/a.go"], &["/src/web/a.go"]),
        )
        .unwrap();
        assert_eq!(trees.len(), 1);
        let tree = &trees[0];
        assert_eq!(tree.image_target.id, TargetId::image("web"));
        assert_eq!(
            tree.files_changed,
            vec![PathBuf::from("/src/web/a.go"), PathBuf::from("/src/web/b.go")]
        );
        assert_eq!(
            tree.ids_with_changes,
            vec![TargetId::image("base"), TargetId::image("web")]
        );
        assert_eq!(tree.containers, vec![container()]);
    }

    #[test]
    fn no_changes_means_no_trees() {
        let trees = extract_image_targets_for_live_updates(&specs(true), &state_set(&[], &[]))
            .unwrap();
        assert!(trees.is_empty());
    }

    #[test]
    fn initial_deploy_redirects_silently() {
        let err = extract_image_targets_for_live_updates(&specs(true), &BuildStateSet::new())
            .unwrap_err();
        assert!(matches!(
            err,
            BuildError::Redirect {
                level: RedirectLevel::Silent,
                ..
            }
        ));
    }

    #[test]
    fn missing_live_update_spec_redirects() {
        let err = extract_image_targets_for_live_updates(
            &specs(false),
            &state_set(&["/src/web/a.go"], &[]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            BuildError::silent_redirect("LiveUpdate requires that LiveUpdate details be specified")
        );
    }

    #[test]
    fn unknown_containers_are_not_ready() {
        let mut set = state_set(&["/src/web/a.go"], &[]);
        set.insert(
            TargetId::image("web"),
            BuildState::new(built("web"), [PathBuf::from("/src/web/a.go")]),
        );
        let err = extract_image_targets_for_live_updates(&specs(true), &set).unwrap_err();
        assert!(err.is_not_ready());
        assert!(err.to_string().contains("running container of image web"));
    }

    #[test]
    fn forced_and_dependency_builds_redirect() {
        let mut set = state_set(&["/src/web/a.go"], &[]);
        let forced = set
            .get(&TargetId::image("web"))
            .cloned()
            .unwrap()
            .with_full_build_triggered(true);
        set.insert(TargetId::image("web"), forced);
        let err = extract_image_targets_for_live_updates(&specs(true), &set).unwrap_err();
        assert_eq!(err.kind(), BuildErrorKind::Redirect);

        let mut set = state_set(&[], &[]);
        let pending = set
            .get(&TargetId::image("web"))
            .cloned()
            .unwrap()
            .with_deps_changed([TargetId::image("base")]);
        set.insert(TargetId::image("web"), pending);
        let err = extract_image_targets_for_live_updates(&specs(true), &set).unwrap_err();
        assert_eq!(err, BuildError::silent_redirect("Pending dependencies"));
    }
}

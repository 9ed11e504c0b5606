// ABOUTME: A manifest groups the image targets and the single deploy target of one resource.
// ABOUTME: Validation enforces a single-source DAG rooted at the deploy target.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;

use super::graph::TargetGraph;
use super::target::{ImageTarget, TargetId, TargetSpec};
use super::ModelError;
use crate::types::ManifestName;

/// When file changes and the initial build happen automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Build on start and on every change.
    #[default]
    Auto,
    /// Build on start; later builds only when triggered.
    ManualAfterInitial,
    /// Never build without a trigger.
    Manual,
}

impl TriggerMode {
    pub fn auto_on_change(self) -> bool {
        matches!(self, TriggerMode::Auto)
    }

    pub fn auto_initial(self) -> bool {
        matches!(self, TriggerMode::Auto | TriggerMode::ManualAfterInitial)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub name: ManifestName,
    pub image_targets: Vec<ImageTarget>,
    pub deploy_target: TargetSpec,
    pub trigger_mode: TriggerMode,
    /// Manifests that must deploy successfully before this one builds for the first time.
    pub resource_deps: Vec<ManifestName>,
    /// Config files whose edits reload this manifest rather than rebuild it.
    pub config_files: Vec<PathBuf>,
}

impl Manifest {
    pub fn new(name: ManifestName, deploy_target: impl Into<TargetSpec>) -> Self {
        Self {
            name,
            image_targets: Vec::new(),
            deploy_target: deploy_target.into(),
            trigger_mode: TriggerMode::default(),
            resource_deps: Vec::new(),
            config_files: Vec::new(),
        }
    }

    pub fn with_image_targets(mut self, images: Vec<ImageTarget>) -> Self {
        self.image_targets = images;
        self
    }

    pub fn with_trigger_mode(mut self, mode: TriggerMode) -> Self {
        self.trigger_mode = mode;
        self
    }

    pub fn with_resource_deps(mut self, deps: Vec<ManifestName>) -> Self {
        self.resource_deps = deps;
        self
    }

    /// Image targets first, then the deploy target.
    pub fn target_specs(&self) -> Vec<TargetSpec> {
        self.image_targets
            .iter()
            .cloned()
            .map(TargetSpec::Image)
            .chain(std::iter::once(self.deploy_target.clone()))
            .collect()
    }

    pub fn target_ids(&self) -> Vec<TargetId> {
        self.image_targets
            .iter()
            .map(|t| t.id.clone())
            .chain(std::iter::once(self.deploy_target.id().clone()))
            .collect()
    }

    pub fn deploy_target_id(&self) -> &TargetId {
        self.deploy_target.id()
    }

    pub fn image_target(&self, id: &TargetId) -> Option<&ImageTarget> {
        self.image_targets.iter().find(|t| &t.id == id)
    }

    pub fn has_target(&self, id: &TargetId) -> bool {
        self.deploy_target.id() == id || self.image_target(id).is_some()
    }

    pub fn is_local(&self) -> bool {
        matches!(self.deploy_target, TargetSpec::Local(_))
    }

    pub fn is_k8s(&self) -> bool {
        matches!(self.deploy_target, TargetSpec::K8s(_))
    }

    pub fn is_docker_compose(&self) -> bool {
        matches!(self.deploy_target, TargetSpec::DockerCompose(_))
    }

    pub fn has_live_update(&self) -> bool {
        self.image_targets
            .iter()
            .any(|t| t.live_update.as_ref().is_some_and(|lu| !lu.is_empty()))
    }

    /// Paths watched for this manifest, deduplicated and sorted.
    pub fn local_paths(&self) -> Vec<PathBuf> {
        let paths: BTreeSet<PathBuf> = match &self.deploy_target {
            TargetSpec::Local(local) => local.deps.iter().cloned().collect(),
            TargetSpec::Image(_) | TargetSpec::K8s(_) | TargetSpec::DockerCompose(_) => self
                .image_targets
                .iter()
                .map(|t| t.build.context.clone())
                .collect(),
        };
        paths.into_iter().collect()
    }

    /// For each target, the targets in this manifest that depend on it.
    pub fn reverse_dependency_ids(&self) -> BTreeMap<TargetId, Vec<TargetId>> {
        let mut result: BTreeMap<TargetId, Vec<TargetId>> = BTreeMap::new();
        for spec in self.target_specs() {
            for dep in spec.dependency_ids() {
                result
                    .entry(dep.clone())
                    .or_default()
                    .push(spec.id().clone());
            }
        }
        result
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if !self.deploy_target.is_deploy_target() {
            return Err(ModelError::NotADeployTarget(self.deploy_target.id().clone()));
        }

        let mut seen = HashSet::new();
        let specs = self.target_specs();
        for spec in &specs {
            spec.validate()?;
            if !seen.insert(spec.id().clone()) {
                return Err(ModelError::DuplicateTarget {
                    manifest: self.name.clone(),
                    target: spec.id().clone(),
                });
            }
        }

        for image in &self.image_targets {
            if let Some(lu) = &image.live_update {
                lu.validate()?;
            }
        }

        if self.resource_deps.contains(&self.name) {
            return Err(ModelError::SelfDependency(self.name.clone()));
        }

        let graph = TargetGraph::new(&specs)?;
        let roots: Vec<&TargetId> = graph.roots().map(TargetSpec::id).collect();
        if roots.as_slice() != [self.deploy_target.id()] {
            return Err(ModelError::NotSingleSource {
                manifest: self.name.clone(),
                roots: roots.into_iter().cloned().collect(),
            });
        }

        Ok(())
    }
}

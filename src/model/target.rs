// ABOUTME: Buildable target definitions: images, Kubernetes, Compose and local commands.
// ABOUTME: TargetSpec is the tagged union every scheduler component dispatches on.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use super::live_update::LiveUpdateSpec;
use super::ModelError;
use crate::types::ImageRef;

/// Kind of buildable unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetType {
    Image,
    K8s,
    DockerCompose,
    Local,
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetType::Image => write!(f, "image"),
            TargetType::K8s => write!(f, "k8s"),
            TargetType::DockerCompose => write!(f, "docker-compose"),
            TargetType::Local => write!(f, "local"),
        }
    }
}

/// Uniquely identifies a target across all manifests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TargetId {
    pub kind: TargetType,
    pub name: String,
}

impl TargetId {
    pub fn new(kind: TargetType, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn image(name: impl Into<String>) -> Self {
        Self::new(TargetType::Image, name)
    }

    pub fn k8s(name: impl Into<String>) -> Self {
        Self::new(TargetType::K8s, name)
    }

    pub fn docker_compose(name: impl Into<String>) -> Self {
        Self::new(TargetType::DockerCompose, name)
    }

    pub fn local(name: impl Into<String>) -> Self {
        Self::new(TargetType::Local, name)
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// How to produce an image from local sources.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImageBuildDetails {
    pub context: PathBuf,
    pub dockerfile: Option<PathBuf>,
    pub build_args: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageTarget {
    pub id: TargetId,
    /// Repository the built image is tagged into.
    pub image_ref: ImageRef,
    pub build: ImageBuildDetails,
    /// Base images built by kiln that this image consumes.
    pub dependency_ids: Vec<TargetId>,
    pub live_update: Option<LiveUpdateSpec>,
}

impl ImageTarget {
    pub fn new(name: impl Into<String>, image_ref: ImageRef, context: impl Into<PathBuf>) -> Self {
        Self {
            id: TargetId::image(name),
            image_ref,
            build: ImageBuildDetails {
                context: context.into(),
                ..Default::default()
            },
            dependency_ids: Vec::new(),
            live_update: None,
        }
    }

    pub fn with_dependencies(mut self, ids: Vec<TargetId>) -> Self {
        self.dependency_ids = ids;
        self
    }

    pub fn with_live_update(mut self, spec: LiveUpdateSpec) -> Self {
        self.live_update = Some(spec);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct K8sTarget {
    pub id: TargetId,
    pub yaml_path: PathBuf,
    pub namespace: Option<String>,
    pub image_dependency_ids: Vec<TargetId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DockerComposeTarget {
    pub id: TargetId,
    pub config_paths: Vec<PathBuf>,
    pub service: String,
    pub image_dependency_ids: Vec<TargetId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalTarget {
    pub id: TargetId,
    /// Shell command line, run with `sh -c`.
    pub cmd: String,
    pub workdir: PathBuf,
    /// Files and directories whose changes re-run the command.
    pub deps: Vec<PathBuf>,
    pub allow_parallel: bool,
}

/// A single buildable unit. Every place that needs per-kind behavior matches on
/// this enum exhaustively, so adding a kind is a compile error until handled.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetSpec {
    Image(ImageTarget),
    K8s(K8sTarget),
    DockerCompose(DockerComposeTarget),
    Local(LocalTarget),
}

impl TargetSpec {
    pub fn id(&self) -> &TargetId {
        match self {
            TargetSpec::Image(t) => &t.id,
            TargetSpec::K8s(t) => &t.id,
            TargetSpec::DockerCompose(t) => &t.id,
            TargetSpec::Local(t) => &t.id,
        }
    }

    pub fn target_type(&self) -> TargetType {
        self.id().kind
    }

    pub fn dependency_ids(&self) -> &[TargetId] {
        match self {
            TargetSpec::Image(t) => &t.dependency_ids,
            TargetSpec::K8s(t) => &t.image_dependency_ids,
            TargetSpec::DockerCompose(t) => &t.image_dependency_ids,
            TargetSpec::Local(_) => &[],
        }
    }

    /// Whether this target deploys something rather than producing an artifact.
    pub fn is_deploy_target(&self) -> bool {
        match self {
            TargetSpec::Image(_) => false,
            TargetSpec::K8s(_) | TargetSpec::DockerCompose(_) | TargetSpec::Local(_) => true,
        }
    }

    pub fn as_image(&self) -> Option<&ImageTarget> {
        match self {
            TargetSpec::Image(t) => Some(t),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        let id = self.id();
        if id.name.is_empty() {
            return Err(ModelError::EmptyTargetName(id.kind));
        }

        let kind_matches = match self {
            TargetSpec::Image(_) => id.kind == TargetType::Image,
            TargetSpec::K8s(_) => id.kind == TargetType::K8s,
            TargetSpec::DockerCompose(_) => id.kind == TargetType::DockerCompose,
            TargetSpec::Local(_) => id.kind == TargetType::Local,
        };
        if !kind_matches {
            return Err(ModelError::MismatchedTargetType(id.clone()));
        }

        if let Some(dep) = self.dependency_ids().iter().find(|d| d.kind != TargetType::Image) {
            return Err(ModelError::NonImageDependency {
                target: id.clone(),
                dependency: dep.clone(),
            });
        }

        match self {
            TargetSpec::Image(t) => {
                if t.build.context.as_os_str().is_empty() {
                    return Err(ModelError::MissingField {
                        target: id.clone(),
                        field: "context",
                    });
                }
            }
            TargetSpec::K8s(t) => {
                if t.yaml_path.as_os_str().is_empty() {
                    return Err(ModelError::MissingField {
                        target: id.clone(),
                        field: "yaml",
                    });
                }
            }
            TargetSpec::DockerCompose(t) => {
                if t.service.is_empty() {
                    return Err(ModelError::MissingField {
                        target: id.clone(),
                        field: "service",
                    });
                }
            }
            TargetSpec::Local(t) => {
                if t.cmd.trim().is_empty() {
                    return Err(ModelError::MissingField {
                        target: id.clone(),
                        field: "cmd",
                    });
                }
            }
        }

        Ok(())
    }
}

impl From<ImageTarget> for TargetSpec {
    fn from(t: ImageTarget) -> Self {
        TargetSpec::Image(t)
    }
}

impl From<K8sTarget> for TargetSpec {
    fn from(t: K8sTarget) -> Self {
        TargetSpec::K8s(t)
    }
}

impl From<DockerComposeTarget> for TargetSpec {
    fn from(t: DockerComposeTarget) -> Self {
        TargetSpec::DockerCompose(t)
    }
}

impl From<LocalTarget> for TargetSpec {
    fn from(t: LocalTarget) -> Self {
        TargetSpec::Local(t)
    }
}

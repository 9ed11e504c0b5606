// ABOUTME: Static description of what kiln builds: targets, manifests and their graph.
// ABOUTME: Everything here is immutable once loaded from config.

pub mod graph;
mod live_update;
mod manifest;
mod target;

use thiserror::Error;

use crate::types::ManifestName;

pub use graph::{GraphError, TargetGraph, topological_sort};
pub use live_update::{Cmd, LiveUpdateSpec, PathMapping, RunStep, SyncRule};
pub use manifest::{Manifest, TriggerMode};
pub use target::{
    DockerComposeTarget, ImageBuildDetails, ImageTarget, K8sTarget, LocalTarget, TargetId,
    TargetSpec, TargetType,
};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("{0} target has an empty name")]
    EmptyTargetName(TargetType),

    #[error("target id {0} does not match its spec kind")]
    MismatchedTargetType(TargetId),

    #[error("{target} may only depend on image targets, not {dependency}")]
    NonImageDependency {
        target: TargetId,
        dependency: TargetId,
    },

    #[error("{target} is missing required field '{field}'")]
    MissingField {
        target: TargetId,
        field: &'static str,
    },

    #[error("invalid live_update: {0}")]
    InvalidLiveUpdate(String),

    #[error("{0} cannot be used as a deploy target")]
    NotADeployTarget(TargetId),

    #[error("manifest {manifest} declares target {target} twice")]
    DuplicateTarget {
        manifest: ManifestName,
        target: TargetId,
    },

    #[error("manifest {0} lists itself in resource_deps")]
    SelfDependency(ManifestName),

    #[error("manifest {manifest} must have its deploy target as the only root, found {roots:?}")]
    NotSingleSource {
        manifest: ManifestName,
        roots: Vec<TargetId>,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

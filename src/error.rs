// ABOUTME: Application-wide error types for kiln's config and command paths.
// ABOUTME: Engine internals use their own error enums; this wraps them at the edges.

use std::path::PathBuf;
use thiserror::Error;

use crate::engine::WatchError;
use crate::model::ModelError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("file already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("configuration file not found in {0}")]
    ConfigNotFound(PathBuf),

    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown image '{image}' referenced by {referrer}")]
    UnknownImage { image: String, referrer: String },

    #[error("manifest '{0}' declares no deploy target (k8s, docker_compose or local)")]
    MissingDeployTarget(String),

    #[error("manifest '{0}' declares more than one deploy target")]
    MultipleDeployTargets(String),

    #[error("duplicate manifest name: {0}")]
    DuplicateManifest(String),

    #[error("manifest {manifest} depends on unknown manifest {dependency}")]
    UnknownResourceDep { manifest: String, dependency: String },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("engine task failed: {0}")]
    Task(String),

    #[error("{count} manifest(s) failed: {names}")]
    BuildsFailed { count: usize, names: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

// ABOUTME: Detection of the local Docker daemon and the current Kubernetes context.
// ABOUTME: Decides whether in-place updates can talk to containers through the local daemon.

use serde::Deserialize;
use std::path::{Path, PathBuf};

const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Kind of cluster the current kube context points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterKind {
    /// No kubeconfig or no current context.
    None,
    DockerDesktop,
    /// Minikube running on the docker runtime with its daemon exported to this shell.
    MinikubeDocker,
    Other(String),
}

impl ClusterKind {
    /// True when containers in the cluster are visible to the local docker CLI.
    pub fn shares_local_docker(&self) -> bool {
        matches!(
            self,
            ClusterKind::None | ClusterKind::DockerDesktop | ClusterKind::MinikubeDocker
        )
    }
}

/// What kiln found about the machine it runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub cluster: ClusterKind,
    pub kube_context: Option<String>,
    pub docker_available: bool,
}

impl Environment {
    pub fn detect() -> Self {
        let kube_context = kubeconfig_path().and_then(|p| current_context(&p));
        let cluster = classify_context(
            kube_context.as_deref(),
            std::env::var_os("MINIKUBE_ACTIVE_DOCKERD").is_some(),
        );
        Self {
            cluster,
            kube_context,
            docker_available: docker_available(),
        }
    }
}

/// Docker is reachable through `DOCKER_HOST` or the default socket.
pub fn docker_available() -> bool {
    std::env::var_os("DOCKER_HOST").is_some() || Path::new(DOCKER_SOCKET).exists()
}

fn kubeconfig_path() -> Option<PathBuf> {
    if let Some(paths) = std::env::var_os("KUBECONFIG") {
        return std::env::split_paths(&paths).next();
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".kube").join("config"))
}

#[derive(Deserialize)]
struct KubeConfig {
    #[serde(rename = "current-context")]
    current_context: Option<String>,
}

/// `current-context` of a kubeconfig file, if set.
pub fn current_context(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let config: KubeConfig = serde_yaml::from_str(&content).ok()?;
    config.current_context.filter(|c| !c.is_empty())
}

pub fn classify_context(context: Option<&str>, minikube_docker_env: bool) -> ClusterKind {
    match context {
        None => ClusterKind::None,
        Some("docker-desktop" | "docker-for-desktop") => ClusterKind::DockerDesktop,
        Some("minikube") if minikube_docker_env => ClusterKind::MinikubeDocker,
        Some(other) => ClusterKind::Other(other.to_string()),
    }
}

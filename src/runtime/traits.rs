// ABOUTME: Capability traits for the external systems build strategies drive.
// ABOUTME: Strategies depend only on these, so tests swap in fakes.

use async_trait::async_trait;

use super::error::RuntimeError;
use super::types::{BuiltImage, ContainerUpdate, WorkloadStatus};
use crate::buildcontrol::BuildContext;
use crate::model::{DockerComposeTarget, ImageTarget, K8sTarget, LocalTarget};
use crate::store::ContainerInfo;
use crate::types::{ContainerId, ImageRef};

/// Builds container images.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build `target` and return a content-addressed reference. `base_images`
    /// are the already-built images this target depends on.
    async fn build(
        &self,
        ctx: &BuildContext,
        target: &ImageTarget,
        base_images: &[BuiltImage],
    ) -> Result<ImageRef, RuntimeError>;
}

/// Applies workloads to a cluster.
#[async_trait]
pub trait ClusterDeployer: Send + Sync {
    /// Apply the target's YAML with `images` substituted for their declared references.
    async fn deploy(
        &self,
        ctx: &BuildContext,
        target: &K8sTarget,
        images: &[BuiltImage],
    ) -> Result<(), RuntimeError>;

    /// Containers of the target's workload that run any of `images`.
    async fn workload_status(
        &self,
        ctx: &BuildContext,
        target: &K8sTarget,
        images: &[ImageRef],
    ) -> Result<WorkloadStatus, RuntimeError>;
}

/// Brings up Docker Compose services.
#[async_trait]
pub trait ComposeClient: Send + Sync {
    /// Start or recreate the service and return its container IDs.
    async fn up(
        &self,
        ctx: &BuildContext,
        target: &DockerComposeTarget,
        images: &[BuiltImage],
    ) -> Result<Vec<ContainerId>, RuntimeError>;
}

/// Patches files into a running container and runs commands there.
#[async_trait]
pub trait ContainerUpdater: Send + Sync {
    fn name(&self) -> &'static str;

    /// A failing run step must surface as `RuntimeError::RunStepFailed`.
    async fn update_container(
        &self,
        ctx: &BuildContext,
        container: &ContainerInfo,
        update: &ContainerUpdate,
    ) -> Result<(), RuntimeError>;
}

/// Runs local commands.
#[async_trait]
pub trait LocalRunner: Send + Sync {
    async fn run(&self, ctx: &BuildContext, target: &LocalTarget) -> Result<(), RuntimeError>;
}

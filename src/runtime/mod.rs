// ABOUTME: External collaborators that build images, deploy workloads and patch containers.
// ABOUTME: Traits define the capabilities; CLI-backed implementations drive docker, kubectl and sh.

pub mod archive;
pub mod detection;
mod docker;
mod error;
mod kubectl;
mod local;
pub mod process;
mod traits;
mod types;

pub use detection::{ClusterKind, Environment};
pub use docker::DockerCli;
pub use error::{RuntimeError, RuntimeErrorKind};
pub use kubectl::Kubectl;
pub use local::ShellRunner;
pub use traits::{ClusterDeployer, ComposeClient, ContainerUpdater, ImageBuilder, LocalRunner};
pub use types::{BuiltImage, ContainerUpdate, ProcessOutput, WorkloadStatus};

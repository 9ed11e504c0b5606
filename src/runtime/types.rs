// ABOUTME: Value types passed between build strategies and runtime collaborators.
// ABOUTME: Built image pairs, container update payloads and captured process output.

use crate::model::Cmd;
use crate::store::ContainerInfo;
use crate::types::ImageRef;

/// An image kiln built, with the reference the user declared for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    pub declared: ImageRef,
    pub built: ImageRef,
}

/// Everything needed to patch one running container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerUpdate {
    /// Tar stream rooted at `/` inside the container.
    pub archive: Vec<u8>,
    /// Absolute container paths to remove before extracting.
    pub to_delete: Vec<String>,
    pub cmds: Vec<Cmd>,
    /// When false the container is restarted after syncing.
    pub hot_reload: bool,
}

impl ContainerUpdate {
    pub fn is_empty(&self) -> bool {
        self.archive.is_empty() && self.to_delete.is_empty() && self.cmds.is_empty()
    }
}

/// Containers of a workload that run one of the deployed images.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadStatus {
    pub running: Vec<ContainerInfo>,
    /// A matching container exited or is waiting to restart after exiting.
    pub crashed: bool,
}

impl WorkloadStatus {
    pub fn is_empty(&self) -> bool {
        self.running.is_empty() && !self.crashed
    }
}

/// Result of running an external command.
#[derive(Debug)]
pub struct ProcessOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

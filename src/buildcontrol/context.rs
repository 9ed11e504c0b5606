// ABOUTME: Per-build context handed to strategies and runtime collaborators.
// ABOUTME: Carries the manifest being built and the cancellation signal.

use tokio::sync::watch;

use super::error::BuildError;
use crate::types::ManifestName;

/// Context for one build. Cloning shares the cancellation signal.
#[derive(Debug, Clone)]
pub struct BuildContext {
    manifest: ManifestName,
    cancel: watch::Receiver<bool>,
}

impl BuildContext {
    pub fn new(manifest: ManifestName, cancel: watch::Receiver<bool>) -> Self {
        Self { manifest, cancel }
    }

    /// A context that is never cancelled.
    pub fn detached(manifest: ManifestName) -> Self {
        let (_tx, cancel) = watch::channel(false);
        Self { manifest, cancel }
    }

    pub fn manifest(&self) -> &ManifestName {
        &self.manifest
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn check_cancelled(&self) -> Result<(), BuildError> {
        if self.is_cancelled() {
            Err(BuildError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the build is cancelled. Never resolves for a detached context.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        if rx.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

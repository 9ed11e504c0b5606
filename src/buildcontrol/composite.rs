// ABOUTME: The BuildAndDeployer contract and the composite that tries strategies in order.
// ABOUTME: Redirects and unexpected errors fall through to the next strategy; user failures stop.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::context::BuildContext;
use super::docker_compose::DockerComposeBuildAndDeployer;
use super::error::{BuildError, BuildErrorKind, RedirectLevel};
use super::image::ImageBuildAndDeployer;
use super::live_update::{LiveUpdateBuildAndDeployer, UpdaterChoice};
use super::local::LocalTargetBuildAndDeployer;
use crate::model::TargetSpec;
use crate::runtime::{
    ClusterDeployer, ComposeClient, ContainerUpdater, Environment, ImageBuilder, LocalRunner,
};
use crate::store::{BuildResultSet, BuildStateSet};

/// One way of turning a manifest's targets into running software.
#[async_trait]
pub trait BuildAndDeployer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build and deploy `specs`. A redirect means this strategy does not apply.
    async fn build_and_deploy(
        &self,
        ctx: &BuildContext,
        specs: &[TargetSpec],
        state_set: &BuildStateSet,
    ) -> Result<BuildResultSet, BuildError>;
}

/// Tries each strategy until one succeeds or one fails for good.
pub struct CompositeBuildAndDeployer {
    builders: Vec<Arc<dyn BuildAndDeployer>>,
}

impl CompositeBuildAndDeployer {
    pub fn new(builders: Vec<Arc<dyn BuildAndDeployer>>) -> Self {
        Self { builders }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.builders.iter().map(|b| b.name()).collect()
    }
}

impl fmt::Debug for CompositeBuildAndDeployer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeBuildAndDeployer")
            .field("builders", &self.names())
            .finish()
    }
}

#[async_trait]
impl BuildAndDeployer for CompositeBuildAndDeployer {
    fn name(&self) -> &'static str {
        "composite"
    }

    async fn build_and_deploy(
        &self,
        ctx: &BuildContext,
        specs: &[TargetSpec],
        state_set: &BuildStateSet,
    ) -> Result<BuildResultSet, BuildError> {
        let mut last_err = None;
        let mut last_unexpected = None;

        for (i, builder) in self.builders.iter().enumerate() {
            ctx.check_cancelled()?;

            let err = match builder.build_and_deploy(ctx, specs, state_set).await {
                Ok(results) => return Ok(results),
                Err(err) => err,
            };

            match err.kind() {
                BuildErrorKind::Cancelled | BuildErrorKind::DontFallBack => return Err(err),
                BuildErrorKind::Redirect => {
                    if let BuildError::Redirect { level, .. } = &err {
                        match level {
                            RedirectLevel::Silent => debug!(
                                manifest = %ctx.manifest(),
                                strategy = builder.name(),
                                "Falling back to next update method because: {}", err
                            ),
                            RedirectLevel::Info => info!(
                                manifest = %ctx.manifest(),
                                strategy = builder.name(),
                                "Falling back to next update method because: {}", err
                            ),
                        }
                    }
                }
                BuildErrorKind::Unexpected => {
                    if i + 1 < self.builders.len() {
                        warn!(
                            manifest = %ctx.manifest(),
                            strategy = builder.name(),
                            "got unexpected error during build/deploy: {}", err
                        );
                    }
                    last_unexpected = Some(err.clone());
                }
            }
            last_err = Some(err);
        }

        Err(last_unexpected
            .or(last_err)
            .unwrap_or_else(|| BuildError::unexpected("no build strategy can handle these targets")))
    }
}

/// How changes to image targets are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// In-place updates where possible, picking the container updater from the environment.
    #[default]
    Auto,
    /// Always rebuild images.
    Image,
    /// In-place updates through the docker daemon.
    Container,
    /// In-place updates through `kubectl exec`.
    Exec,
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdateMode::Auto => "auto",
            UpdateMode::Image => "image",
            UpdateMode::Container => "container",
            UpdateMode::Exec => "exec",
        };
        f.write_str(s)
    }
}

impl FromStr for UpdateMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(UpdateMode::Auto),
            "image" => Ok(UpdateMode::Image),
            "container" => Ok(UpdateMode::Container),
            "exec" => Ok(UpdateMode::Exec),
            other => Err(format!(
                "unknown update mode '{}' (expected auto, image, container or exec)",
                other
            )),
        }
    }
}

/// External systems the strategies drive.
#[derive(Clone)]
pub struct Collaborators {
    pub image_builder: Arc<dyn ImageBuilder>,
    pub cluster: Arc<dyn ClusterDeployer>,
    pub compose: Arc<dyn ComposeClient>,
    pub docker_updater: Arc<dyn ContainerUpdater>,
    pub exec_updater: Arc<dyn ContainerUpdater>,
    pub local: Arc<dyn LocalRunner>,
}

/// Which container updater in-place updates use, or `None` when they are off.
pub fn updater_choice(mode: UpdateMode, env: &Environment) -> Option<UpdaterChoice> {
    match mode {
        UpdateMode::Image => None,
        UpdateMode::Container => Some(UpdaterChoice::Docker),
        UpdateMode::Exec => Some(UpdaterChoice::Exec),
        UpdateMode::Auto if env.cluster.shares_local_docker() => Some(UpdaterChoice::Docker),
        UpdateMode::Auto => Some(UpdaterChoice::Exec),
    }
}

/// The strategy chain for this process. Chosen once at startup.
pub fn build_order(
    mode: UpdateMode,
    env: &Environment,
    collaborators: &Collaborators,
) -> CompositeBuildAndDeployer {
    let mut builders: Vec<Arc<dyn BuildAndDeployer>> = Vec::new();

    if let Some(choice) = updater_choice(mode, env) {
        builders.push(Arc::new(LiveUpdateBuildAndDeployer::new(
            collaborators.docker_updater.clone(),
            collaborators.exec_updater.clone(),
            choice,
        )));
    }
    builders.push(Arc::new(DockerComposeBuildAndDeployer::new(
        collaborators.image_builder.clone(),
        collaborators.compose.clone(),
    )));
    builders.push(Arc::new(ImageBuildAndDeployer::new(
        collaborators.image_builder.clone(),
        collaborators.cluster.clone(),
    )));
    builders.push(Arc::new(LocalTargetBuildAndDeployer::new(
        collaborators.local.clone(),
    )));

    CompositeBuildAndDeployer::new(builders)
}

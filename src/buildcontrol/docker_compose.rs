// ABOUTME: Strategy for Docker Compose manifests: build dirty images, then bring the service up.
// ABOUTME: The service's container IDs become the deploy result.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::composite::BuildAndDeployer;
use super::context::BuildContext;
use super::error::BuildError;
use super::image::{built_images, split_specs};
use super::target_queue::{BuildHandler, TargetQueue};
use crate::model::{ImageTarget, TargetSpec};
use crate::runtime::{ComposeClient, ImageBuilder};
use crate::store::{BuildResult, BuildResultSet, BuildState, BuildStateSet};

pub struct DockerComposeBuildAndDeployer {
    builder: Arc<dyn ImageBuilder>,
    compose: Arc<dyn ComposeClient>,
}

impl DockerComposeBuildAndDeployer {
    pub fn new(builder: Arc<dyn ImageBuilder>, compose: Arc<dyn ComposeClient>) -> Self {
        Self { builder, compose }
    }
}

struct Handler<'a> {
    ctx: &'a BuildContext,
    images: Vec<&'a ImageTarget>,
    builder: &'a dyn ImageBuilder,
    compose: &'a dyn ComposeClient,
}

#[async_trait]
impl BuildHandler for Handler<'_> {
    async fn handle(
        &mut self,
        target: &TargetSpec,
        _state: BuildState,
        dep_results: &BuildResultSet,
    ) -> Result<BuildResult, BuildError> {
        self.ctx.check_cancelled()?;
        let bases = built_images(&self.images, dep_results);

        match target {
            TargetSpec::Image(image) => {
                let built = self
                    .builder
                    .build(self.ctx, image, &bases)
                    .await
                    .map_err(|e| e.into_user_failure())?;
                Ok(BuildResult::image(image.id.clone(), built))
            }
            TargetSpec::DockerCompose(dc) => {
                let ids = self
                    .compose
                    .up(self.ctx, dc, &bases)
                    .await
                    .map_err(|e| e.into_user_failure())?;
                info!(
                    manifest = %self.ctx.manifest(),
                    service = %dc.service,
                    containers = ids.len(),
                    "service up"
                );
                Ok(BuildResult::deploy(dc.id.clone(), ids))
            }
            other => Err(BuildError::unexpected(format!(
                "compose build cannot handle target {}",
                other.id()
            ))),
        }
    }
}

#[async_trait]
impl BuildAndDeployer for DockerComposeBuildAndDeployer {
    fn name(&self) -> &'static str {
        "docker-compose"
    }

    async fn build_and_deploy(
        &self,
        ctx: &BuildContext,
        specs: &[TargetSpec],
        state_set: &BuildStateSet,
    ) -> Result<BuildResultSet, BuildError> {
        let Some((images, _)) = split_specs(specs, |s| match s {
            TargetSpec::DockerCompose(dc) => Some(dc),
            _ => None,
        }) else {
            return Err(BuildError::silent_redirect(
                "DockerComposeBuildAndDeployer requires exactly one Docker Compose target",
            ));
        };

        let mut queue = TargetQueue::new(specs, state_set.clone())?;
        let mut handler = Handler {
            ctx,
            images,
            builder: self.builder.as_ref(),
            compose: self.compose.as_ref(),
        };
        queue.run_builds(&mut handler).await?;
        Ok(queue.new_results())
    }
}

// ABOUTME: Full-rebuild strategy for Kubernetes manifests: build dirty images, then apply the YAML.
// ABOUTME: Any failure here is the user's build or deploy failing, so it never falls back.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::composite::BuildAndDeployer;
use super::context::BuildContext;
use super::error::BuildError;
use super::target_queue::{BuildHandler, TargetQueue};
use crate::model::{ImageTarget, TargetSpec};
use crate::runtime::{BuiltImage, ClusterDeployer, ImageBuilder};
use crate::store::{BuildResult, BuildResultSet, BuildState, BuildStateSet};

pub struct ImageBuildAndDeployer {
    builder: Arc<dyn ImageBuilder>,
    deployer: Arc<dyn ClusterDeployer>,
}

impl ImageBuildAndDeployer {
    pub fn new(builder: Arc<dyn ImageBuilder>, deployer: Arc<dyn ClusterDeployer>) -> Self {
        Self { builder, deployer }
    }
}

/// Image targets and the single deploy target of kind `D`, or `None` for any other shape.
pub(super) fn split_specs<'a, D>(
    specs: &'a [TargetSpec],
    deploy: impl Fn(&'a TargetSpec) -> Option<&'a D>,
) -> Option<(Vec<&'a ImageTarget>, &'a D)> {
    let mut images = Vec::new();
    let mut deploys = Vec::new();
    for spec in specs {
        if let Some(image) = spec.as_image() {
            images.push(image);
        } else if let Some(d) = deploy(spec) {
            deploys.push(d);
        } else {
            return None;
        }
    }
    match deploys.as_slice() {
        [only] => Some((images, *only)),
        _ => None,
    }
}

/// Pair each built dependency image with the reference its spec declares.
pub(super) fn built_images(images: &[&ImageTarget], results: &BuildResultSet) -> Vec<BuiltImage> {
    images
        .iter()
        .filter_map(|image| {
            let built = results.get(&image.id)?.image_ref()?.clone();
            Some(BuiltImage {
                declared: image.image_ref.clone(),
                built,
            })
        })
        .collect()
}

struct Handler<'a> {
    ctx: &'a BuildContext,
    images: Vec<&'a ImageTarget>,
    builder: &'a dyn ImageBuilder,
    deployer: &'a dyn ClusterDeployer,
    total: usize,
    step: usize,
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
        self.step += 1;
        let bases = built_images(&self.images, dep_results);

        match target {
            TargetSpec::Image(image) => {
                info!(
                    manifest = %self.ctx.manifest(),
                    "STEP {}/{}: building image {}",
                    self.step, self.total, image.image_ref.familiar_name()
                );
                let built = self
                    .builder
                    .build(self.ctx, image, &bases)
                    .await
                    .map_err(|e| e.into_user_failure())?;
                Ok(BuildResult::image(image.id.clone(), built))
            }
            TargetSpec::K8s(k8s) => {
                info!(
                    manifest = %self.ctx.manifest(),
                    "STEP {}/{}: deploying {}",
                    self.step, self.total, k8s.yaml_path.display()
                );
                self.deployer
                    .deploy(self.ctx, k8s, &bases)
                    .await
                    .map_err(|e| e.into_user_failure())?;
                Ok(BuildResult::deploy(k8s.id.clone(), vec![]))
            }
            other => Err(BuildError::unexpected(format!(
                "image build cannot handle target {}",
                other.id()
            ))),
        }
    }
}

#[async_trait]
impl BuildAndDeployer for ImageBuildAndDeployer {
    fn name(&self) -> &'static str {
        "image"
    }

    async fn build_and_deploy(
        &self,
        ctx: &BuildContext,
        specs: &[TargetSpec],
        state_set: &BuildStateSet,
    ) -> Result<BuildResultSet, BuildError> {
        let Some((images, _)) = split_specs(specs, |s| match s {
            TargetSpec::K8s(k) => Some(k),
            _ => None,
        }) else {
            return Err(BuildError::silent_redirect(
                "ImageBuildAndDeployer does not support these specs",
            ));
        };

        let mut queue = TargetQueue::new(specs, state_set.clone())?;
        let reused = queue.reused_results();
        for result in reused.results() {
            if let Some(image) = result.image_ref() {
                info!(manifest = %ctx.manifest(), "Reusing image {}", image);
            }
        }

        let mut handler = Handler {
            ctx,
            images,
            builder: self.builder.as_ref(),
            deployer: self.deployer.as_ref(),
            total: queue.count_builds(),
            step: 0,
        };
        queue.run_builds(&mut handler).await?;
        Ok(queue.new_results())
    }
}

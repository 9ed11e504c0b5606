// ABOUTME: Strategy for manifests whose only target is a local command.
// ABOUTME: A non-zero exit is the user's failure and stops the chain.

use async_trait::async_trait;
use std::sync::Arc;

use super::composite::BuildAndDeployer;
use super::context::BuildContext;
use super::error::BuildError;
use crate::model::TargetSpec;
use crate::runtime::LocalRunner;
use crate::store::{BuildResult, BuildResultSet, BuildStateSet};

pub struct LocalTargetBuildAndDeployer {
    runner: Arc<dyn LocalRunner>,
}

impl LocalTargetBuildAndDeployer {
    pub fn new(runner: Arc<dyn LocalRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl BuildAndDeployer for LocalTargetBuildAndDeployer {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn build_and_deploy(
        &self,
        ctx: &BuildContext,
        specs: &[TargetSpec],
        _state_set: &BuildStateSet,
    ) -> Result<BuildResultSet, BuildError> {
        let [TargetSpec::Local(target)] = specs else {
            return Err(BuildError::silent_redirect(
                "LocalTargetBuildAndDeployer requires exactly one LocalTarget",
            ));
        };

        ctx.check_cancelled()?;
        self.runner
            .run(ctx, target)
            .await
            .map_err(|e| e.into_user_failure())?;

        Ok([BuildResult::local(target.id.clone())].into_iter().collect())
    }
}

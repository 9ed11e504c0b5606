// ABOUTME: Runs local targets as `sh -c` commands in their working directory.
// ABOUTME: Command output is forwarded to the log under the manifest's name.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use super::error::RuntimeError;
use super::process::{self, describe};
use super::traits::LocalRunner;
use crate::buildcontrol::BuildContext;
use crate::model::LocalTarget;

#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

#[async_trait]
impl LocalRunner for ShellRunner {
    async fn run(&self, ctx: &BuildContext, target: &LocalTarget) -> Result<(), RuntimeError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&target.cmd).current_dir(&target.workdir);
        let command = describe(&cmd);

        info!(manifest = %ctx.manifest(), cmd = %target.cmd, "running local command");
        let output = process::run(ctx, cmd, None).await?;
        for line in output.stdout.lines().chain(output.stderr.lines()) {
            info!(manifest = %ctx.manifest(), "{}", line);
        }

        if output.success {
            Ok(())
        } else {
            Err(RuntimeError::CommandFailed {
                command,
                exit_code: output.exit_code,
                stderr: output.stderr,
            })
        }
    }
}

// ABOUTME: Runs external commands with captured output and build cancellation.
// ABOUTME: Cancelling a build kills the child process.

use snafu::ResultExt;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::error::{RuntimeError, SpawnSnafu};
use super::types::ProcessOutput;
use crate::buildcontrol::BuildContext;

/// Human-readable command line for logs and errors.
pub fn describe(cmd: &Command) -> String {
    let std = cmd.as_std();
    std::iter::once(std.get_program())
        .chain(std.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run `cmd` to completion, feeding `stdin` if given. A non-zero exit is not an error here.
pub async fn run(
    ctx: &BuildContext,
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
) -> Result<ProcessOutput, RuntimeError> {
    let description = describe(&cmd);
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    debug!(manifest = %ctx.manifest(), command = %description, "running");

    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);

    let mut child = cmd.spawn().context(SpawnSnafu { program })?;

    let writer = match (stdin, child.stdin.take()) {
        (Some(bytes), Some(mut pipe)) => Some(tokio::spawn(async move {
            // The child may exit without reading everything.
            let _ = pipe.write_all(&bytes).await;
            let _ = pipe.shutdown().await;
        })),
        _ => None,
    };

    let output = tokio::select! {
        output = child.wait_with_output() => output,
        _ = ctx.cancelled() => {
            debug!(command = %description, "cancelled");
            return Err(RuntimeError::Cancelled);
        }
    };
    if let Some(writer) = writer {
        let _ = writer.await;
    }

    let output = output.map_err(|source| RuntimeError::Spawn {
        program: description.clone(),
        source,
    })?;

    Ok(ProcessOutput {
        success: output.status.success(),
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Like `run`, but a non-zero exit becomes `CommandFailed`.
pub async fn run_checked(
    ctx: &BuildContext,
    cmd: Command,
    stdin: Option<Vec<u8>>,
) -> Result<ProcessOutput, RuntimeError> {
    let command = describe(&cmd);
    let output = run(ctx, cmd, stdin).await?;
    if output.success {
        Ok(output)
    } else {
        Err(RuntimeError::CommandFailed {
            command,
            exit_code: output.exit_code,
            stderr: output.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ManifestName;
    use tokio::sync::watch;

    fn ctx() -> BuildContext {
        BuildContext::detached(ManifestName::new("test").unwrap())
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn describe_joins_program_and_args() {
        let mut cmd = Command::new("docker");
        cmd.args(["exec", "abc", "ls"]);
        assert_eq!(describe(&cmd), "docker exec abc ls");
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let out = run(&ctx(), sh("echo hi; echo err >&2; exit 3"), None)
            .await
            .unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let out = run_checked(&ctx(), sh("cat"), Some(b"payload".to_vec()))
            .await
            .unwrap();
        assert_eq!(out.stdout, "payload");
    }

    #[tokio::test]
    async fn checked_run_reports_failure() {
        let err = run_checked(&ctx(), sh("exit 1"), None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::CommandFailed { exit_code: Some(1), .. }));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let err = run(&ctx(), Command::new("kiln-no-such-binary"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Spawn { .. }));
    }

    #[tokio::test]
    async fn cancellation_kills_the_command() {
        let (tx, rx) = watch::channel(false);
        let ctx = BuildContext::new(ManifestName::new("test").unwrap(), rx);
        let handle = tokio::spawn(async move { run(&ctx, sh("sleep 30"), None).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(RuntimeError::Cancelled)));
    }
}

// ABOUTME: Docker CLI implementation of image builds, Compose services and container updates.
// ABOUTME: Built images are tagged `kiln-<digest>` so identical inputs give identical references.

use async_trait::async_trait;
use snafu::ResultExt;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

use super::error::{ReadFileSnafu, RuntimeError};
use super::process::{self, describe};
use super::traits::{ComposeClient, ContainerUpdater, ImageBuilder};
use super::types::{BuiltImage, ContainerUpdate};
use crate::buildcontrol::BuildContext;
use crate::model::{DockerComposeTarget, ImageTarget};
use crate::store::ContainerInfo;
use crate::types::{ContainerId, ImageRef};

/// Length of the digest prefix used in image tags.
const TAG_DIGEST_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    fn compose(&self, target: &DockerComposeTarget) -> Command {
        let mut cmd = self.command();
        cmd.arg("compose");
        for path in &target.config_paths {
            cmd.arg("-f").arg(path);
        }
        cmd
    }
}

/// Tag derived from an image ID like `sha256:0123...`.
pub fn content_tag(image_id: &str) -> Option<String> {
    let hex = image_id.trim().strip_prefix("sha256:").unwrap_or(image_id.trim());
    if hex.len() < TAG_DIGEST_LEN || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("kiln-{}", &hex[..TAG_DIGEST_LEN]))
}

/// Point `FROM` lines at freshly built base images.
pub fn inject_base_images(dockerfile: &str, base_images: &[BuiltImage]) -> String {
    let mut out = String::with_capacity(dockerfile.len());
    for line in dockerfile.lines() {
        out.push_str(&rewrite_from_line(line, base_images).unwrap_or_else(|| line.to_string()));
        out.push('\n');
    }
    out
}

fn rewrite_from_line(line: &str, base_images: &[BuiltImage]) -> Option<String> {
    let trimmed = line.trim_start();
    let keyword = trimmed.get(..4)?;
    if !keyword.eq_ignore_ascii_case("FROM") {
        return None;
    }
    let mut words: Vec<String> = trimmed[4..].split_whitespace().map(String::from).collect();
    let idx = words.iter().position(|w| !w.starts_with("--"))?;
    let current = ImageRef::parse(&words[idx]).ok()?;
    let base = base_images.iter().find(|b| b.declared.matches_name(&current))?;
    words[idx] = base.built.to_string();
    Some(format!("{} {}", keyword, words.join(" ")))
}

#[async_trait]
impl ImageBuilder for DockerCli {
    async fn build(
        &self,
        ctx: &BuildContext,
        target: &ImageTarget,
        base_images: &[BuiltImage],
    ) -> Result<ImageRef, RuntimeError> {
        let details = &target.build;
        let dockerfile_path = details
            .dockerfile
            .clone()
            .unwrap_or_else(|| details.context.join("Dockerfile"));
        let dockerfile = tokio::fs::read_to_string(&dockerfile_path)
            .await
            .context(ReadFileSnafu {
                path: dockerfile_path.display().to_string(),
            })?;
        let dockerfile = inject_base_images(&dockerfile, base_images);

        let mut cmd = self.command();
        cmd.args(["build", "--quiet", "--file", "-"]);
        for (key, value) in &details.build_args {
            cmd.arg("--build-arg").arg(format!("{}={}", key, value));
        }
        cmd.arg(&details.context);

        info!(manifest = %ctx.manifest(), image = %target.image_ref, "building image");
        let command = describe(&cmd);
        let output = process::run_checked(ctx, cmd, Some(dockerfile.into_bytes())).await?;
        let image_id = output.stdout.trim().to_string();
        let tag = content_tag(&image_id).ok_or_else(|| RuntimeError::UnexpectedOutput {
            command,
            message: format!("expected an image id, got '{}'", image_id),
        })?;

        let built = target.image_ref.with_tag(tag);
        let mut tag_cmd = self.command();
        tag_cmd.arg("tag").arg(&image_id).arg(built.to_string());
        process::run_checked(ctx, tag_cmd, None).await?;

        debug!(image = %built, "tagged image");
        Ok(built)
    }
}

#[async_trait]
impl ComposeClient for DockerCli {
    async fn up(
        &self,
        ctx: &BuildContext,
        target: &DockerComposeTarget,
        images: &[BuiltImage],
    ) -> Result<Vec<ContainerId>, RuntimeError> {
        // Compose files name the declared reference, so point it at the new build.
        for image in images {
            let mut cmd = self.command();
            cmd.arg("tag")
                .arg(image.built.to_string())
                .arg(image.declared.to_string());
            process::run_checked(ctx, cmd, None).await?;
        }

        let mut up = self.compose(target);
        up.args(["up", "--detach", "--no-deps", "--force-recreate"])
            .arg(&target.service);
        info!(manifest = %ctx.manifest(), service = %target.service, "docker compose up");
        process::run_checked(ctx, up, None).await?;

        let mut ps = self.compose(target);
        ps.args(["ps", "--quiet"]).arg(&target.service);
        let output = process::run_checked(ctx, ps, None).await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ContainerId::new)
            .collect())
    }
}

#[async_trait]
impl ContainerUpdater for DockerCli {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn update_container(
        &self,
        ctx: &BuildContext,
        container: &ContainerInfo,
        update: &ContainerUpdate,
    ) -> Result<(), RuntimeError> {
        let id = container.container_id.as_str();

        if !update.to_delete.is_empty() {
            let mut rm = self.command();
            rm.args(["exec", id, "rm", "-rf"]).args(&update.to_delete);
            process::run_checked(ctx, rm, None).await?;
        }

        if !update.archive.is_empty() {
            let mut cp = self.command();
            cp.args(["cp", "-"]).arg(format!("{}:/", id));
            process::run_checked(ctx, cp, Some(update.archive.clone())).await?;
        }

        for step in &update.cmds {
            let mut exec = self.command();
            exec.args(["exec", id]).args(&step.argv);
            let output = process::run(ctx, exec, None).await?;
            if !output.success {
                return Err(RuntimeError::RunStepFailed {
                    command: step.to_string(),
                    exit_code: output.exit_code.unwrap_or(-1),
                    output: output.stdout + &output.stderr,
                });
            }
        }

        if !update.hot_reload {
            let mut restart = self.command();
            restart.args(["restart", id]);
            process::run_checked(ctx, restart, None).await?;
        }

        Ok(())
    }
}

// ABOUTME: kubectl implementation of cluster deploys and exec-based container updates.
// ABOUTME: Deploys rewrite image references in the workload YAML before piping it to `kubectl apply`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_yaml::Value;
use snafu::ResultExt;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::info;

use super::error::{ReadFileSnafu, RuntimeError};
use super::process::{self, describe};
use super::traits::{ClusterDeployer, ContainerUpdater};
use super::types::{BuiltImage, ContainerUpdate, WorkloadStatus};
use crate::buildcontrol::BuildContext;
use crate::model::K8sTarget;
use crate::store::ContainerInfo;
use crate::types::{ContainerId, ImageRef, PodId};

#[derive(Debug, Clone)]
pub struct Kubectl {
    binary: PathBuf,
    context: Option<String>,
}

impl Default for Kubectl {
    fn default() -> Self {
        Self::new("kubectl")
    }
}

impl Kubectl {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            context: None,
        }
    }

    /// Pin every call to one kubeconfig context.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    fn command(&self, namespace: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(context) = &self.context {
            cmd.arg("--context").arg(context);
        }
        if let Some(ns) = namespace {
            cmd.arg("--namespace").arg(ns);
        }
        cmd
    }

    fn exec(&self, container: &ContainerInfo, stdin: bool) -> Result<Command, RuntimeError> {
        let pod = container
            .pod_id
            .as_ref()
            .ok_or_else(|| RuntimeError::Unsupported {
                message: format!(
                    "container {} has no pod, cannot kubectl exec",
                    container.container_id.short_str()
                ),
            })?;
        let mut cmd = self.command(container.namespace.as_deref());
        cmd.arg("exec");
        if stdin {
            cmd.arg("-i");
        }
        cmd.arg(pod.as_str())
            .arg("-c")
            .arg(&container.container_name)
            .arg("--");
        Ok(cmd)
    }
}

/// Replace every `image:` field naming a declared image with its built reference.
/// Returns the rewritten multi-document YAML.
pub fn substitute_images(yaml: &str, images: &[BuiltImage]) -> Result<String, serde_yaml::Error> {
    let mut docs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let mut value = Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        replace_images(&mut value, images);
        docs.push(serde_yaml::to_string(&value)?);
    }
    Ok(docs.join("---\n"))
}

fn replace_images(value: &mut Value, images: &[BuiltImage]) {
    match value {
        Value::Mapping(map) => {
            let mut replaced = false;
            if let Some(Value::String(current)) = map.get_mut("image")
                && let Ok(parsed) = ImageRef::parse(current)
                && let Some(image) = images.iter().find(|i| i.declared.matches_name(&parsed))
            {
                *current = image.built.to_string();
                replaced = true;
            }
            if replaced {
                // Locally built images are never in a registry the cluster can pull from.
                map.insert(
                    Value::String("imagePullPolicy".to_string()),
                    Value::String("IfNotPresent".to_string()),
                );
            }
            for (_, child) in map.iter_mut() {
                replace_images(child, images);
            }
        }
        Value::Sequence(items) => {
            for item in items {
                replace_images(item, images);
            }
        }
        Value::Tagged(tagged) => replace_images(&mut tagged.value, images),
        _ => {}
    }
}

const CRASH_WAIT_REASONS: [&str; 2] = ["CrashLoopBackOff", "Error"];

/// Containers in `kubectl get pods -o json` output that run exactly one of `images`.
pub fn parse_workload_status(
    json: &str,
    images: &[ImageRef],
) -> Result<WorkloadStatus, serde_json::Error> {
    let pods: serde_json::Value = serde_json::from_str(json)?;
    let mut report = WorkloadStatus::default();

    let items = pods["items"].as_array().cloned().unwrap_or_default();
    for pod in &items {
        let pod_name = pod["metadata"]["name"].as_str().unwrap_or_default();
        let namespace = pod["metadata"]["namespace"].as_str().map(String::from);
        let statuses = pod["status"]["containerStatuses"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        for status in &statuses {
            let running = status["state"]["running"].is_object();
            let image_matches = status["image"]
                .as_str()
                .and_then(|s| ImageRef::parse(s).ok())
                .is_some_and(|img| {
                    images
                        .iter()
                        .any(|i| i.matches_name(&img) && i.tag() == img.tag())
                });
            let container_id = status["containerID"]
                .as_str()
                .map(|id| id.split_once("://").map_or(id, |(_, rest)| rest))
                .unwrap_or_default();

            if !image_matches {
                continue;
            }
            if !running {
                let terminated = status["state"]["terminated"]["exitCode"]
                    .as_i64()
                    .is_some_and(|code| code != 0);
                let waiting_after_exit = status["state"]["waiting"]["reason"]
                    .as_str()
                    .is_some_and(|r| CRASH_WAIT_REASONS.contains(&r));
                report.crashed |= terminated || waiting_after_exit;
                continue;
            }
            if !container_id.is_empty() && !pod_name.is_empty() {
                report.running.push(ContainerInfo {
                    pod_id: Some(PodId::new(pod_name)),
                    container_id: ContainerId::new(container_id),
                    container_name: status["name"].as_str().unwrap_or_default().to_string(),
                    namespace: namespace.clone(),
                });
            }
        }
    }
    Ok(report)
}

#[async_trait]
impl ClusterDeployer for Kubectl {
    async fn deploy(
        &self,
        ctx: &BuildContext,
        target: &K8sTarget,
        images: &[BuiltImage],
    ) -> Result<(), RuntimeError> {
        let path = target.yaml_path.display().to_string();
        let yaml = tokio::fs::read_to_string(&target.yaml_path)
            .await
            .context(ReadFileSnafu { path: path.clone() })?;
        let yaml = substitute_images(&yaml, images).map_err(|e| RuntimeError::UnexpectedOutput {
            command: format!("parse {}", path),
            message: e.to_string(),
        })?;

        let mut cmd = self.command(target.namespace.as_deref());
        cmd.args(["apply", "-f", "-"]);
        info!(manifest = %ctx.manifest(), yaml = %path, "kubectl apply");
        process::run_checked(ctx, cmd, Some(yaml.into_bytes())).await?;
        Ok(())
    }

    async fn workload_status(
        &self,
        ctx: &BuildContext,
        target: &K8sTarget,
        images: &[ImageRef],
    ) -> Result<WorkloadStatus, RuntimeError> {
        let mut cmd = self.command(target.namespace.as_deref());
        cmd.args(["get", "pods", "--output", "json"]);
        let command = describe(&cmd);
        let output = process::run_checked(ctx, cmd, None).await?;
        parse_workload_status(&output.stdout, images).map_err(|e| {
            RuntimeError::UnexpectedOutput {
                command,
                message: e.to_string(),
            }
        })
    }
}

#[async_trait]
impl ContainerUpdater for Kubectl {
    fn name(&self) -> &'static str {
        "exec"
    }

    async fn update_container(
        &self,
        ctx: &BuildContext,
        container: &ContainerInfo,
        update: &ContainerUpdate,
    ) -> Result<(), RuntimeError> {
        if !update.hot_reload {
            return Err(RuntimeError::Unsupported {
                message: "exec updates cannot restart containers".to_string(),
            });
        }

        if !update.to_delete.is_empty() {
            let mut rm = self.exec(container, false)?;
            rm.args(["rm", "-rf"]).args(&update.to_delete);
            process::run_checked(ctx, rm, None).await?;
        }

        if !update.archive.is_empty() {
            let mut untar = self.exec(container, true)?;
            untar.args(["tar", "-C", "/", "-x", "-f", "-"]);
            process::run_checked(ctx, untar, Some(update.archive.clone())).await?;
        }

        for step in &update.cmds {
            let mut exec = self.exec(container, false)?;
            exec.args(&step.argv);
            let output = process::run(ctx, exec, None).await?;
            if !output.success {
                return Err(RuntimeError::RunStepFailed {
                    command: step.to_string(),
                    exit_code: output.exit_code.unwrap_or(-1),
                    output: output.stdout + &output.stderr,
                });
            }
        }

        Ok(())
    }
}

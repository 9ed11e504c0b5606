// ABOUTME: Configuration types and parsing for kiln.yml.
// ABOUTME: Turns the YAML description of images and manifests into validated Manifests.

mod deserialize;
mod env_value;
mod init;

pub use env_value::{EnvValue, resolve_env_map};
pub use init::init_config;

use deserialize::{
    deserialize_image_ref, deserialize_manifest_name, deserialize_manifest_names,
    deserialize_manifests,
};

use crate::buildcontrol::UpdateMode;
use crate::error::{Error, Result};
use crate::model::{
    Cmd, DockerComposeTarget, ImageBuildDetails, ImageTarget, K8sTarget, LiveUpdateSpec,
    LocalTarget, Manifest, RunStep, SyncRule, TargetId, TargetSpec, TriggerMode,
};
use crate::store::engine_state::{DEFAULT_BUILD_HISTORY_LIMIT, DEFAULT_MAX_PARALLEL_BUILDS};
use crate::types::{ImageRef, ManifestName};
use nonempty::NonEmpty;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

pub const CONFIG_FILENAME: &str = "kiln.yml";
pub const CONFIG_FILENAME_ALT: &str = "kiln.yaml";
pub const CONFIG_FILENAME_DIR: &str = ".kiln/config.yml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub update_mode: UpdateMode,

    #[serde(default = "default_max_parallel_builds")]
    pub max_parallel_builds: usize,

    #[serde(default = "default_build_history_limit")]
    pub build_history_limit: usize,

    /// Overrides the current context from kubeconfig.
    #[serde(default)]
    pub kube_context: Option<String>,

    #[serde(default)]
    pub images: Vec<ImageConfig>,

    #[serde(deserialize_with = "deserialize_manifests")]
    pub manifests: NonEmpty<ManifestConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageConfig {
    pub name: String,

    #[serde(rename = "ref", deserialize_with = "deserialize_image_ref")]
    pub image: ImageRef,

    #[serde(default = "default_context")]
    pub context: PathBuf,

    #[serde(default)]
    pub dockerfile: Option<PathBuf>,

    #[serde(default)]
    pub build_args: HashMap<String, EnvValue>,

    /// Names of other images this one is built from.
    #[serde(default)]
    pub deps: Vec<String>,

    #[serde(default)]
    pub live_update: Option<LiveUpdateConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LiveUpdateConfig {
    #[serde(default)]
    pub sync: Vec<SyncConfig>,

    #[serde(default)]
    pub run: Vec<RunEntry>,

    #[serde(default)]
    pub fall_back_on: Vec<PathBuf>,

    #[serde(default)]
    pub restart: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    pub local: PathBuf,
    pub container: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RunEntry {
    Simple(String),
    Detailed {
        cmd: String,
        #[serde(default)]
        trigger: Vec<PathBuf>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestConfig {
    #[serde(deserialize_with = "deserialize_manifest_name")]
    pub name: ManifestName,

    #[serde(default)]
    pub trigger_mode: TriggerMode,

    #[serde(default, deserialize_with = "deserialize_manifest_names")]
    pub resource_deps: Vec<ManifestName>,

    /// Names of images the deploy target consumes.
    #[serde(default)]
    pub images: Vec<String>,

    #[serde(default)]
    pub k8s: Option<K8sConfig>,

    #[serde(default)]
    pub docker_compose: Option<ComposeConfig>,

    #[serde(default)]
    pub local: Option<LocalConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct K8sConfig {
    pub yaml: PathBuf,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComposeConfig {
    pub files: Vec<PathBuf>,
    /// Defaults to the manifest name.
    #[serde(default)]
    pub service: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    pub cmd: String,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub deps: Vec<PathBuf>,
    #[serde(default)]
    pub allow_parallel: bool,
}

fn default_max_parallel_builds() -> usize {
    DEFAULT_MAX_PARALLEL_BUILDS
}

fn default_build_history_limit() -> usize {
    DEFAULT_BUILD_HISTORY_LIMIT
}

fn default_context() -> PathBuf {
    PathBuf::from(".")
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else if path == Path::new(".") {
        base.to_path_buf()
    } else {
        base.join(path)
    }
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(Error::from)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// First config file found in `dir`.
    pub fn find(dir: &Path) -> Result<PathBuf> {
        let candidates = [
            dir.join(CONFIG_FILENAME),
            dir.join(CONFIG_FILENAME_ALT),
            dir.join(CONFIG_FILENAME_DIR),
        ];

        candidates
            .into_iter()
            .find(|path| path.exists())
            .ok_or_else(|| Error::ConfigNotFound(dir.to_path_buf()))
    }

    pub fn discover(dir: &Path) -> Result<Self> {
        Self::load(&Self::find(dir)?)
    }

    fn image_config(&self, name: &str, referrer: &str) -> Result<&ImageConfig> {
        self.images
            .iter()
            .find(|i| i.name == name)
            .ok_or_else(|| Error::UnknownImage {
                image: name.to_string(),
                referrer: referrer.to_string(),
            })
    }

    /// Image names `roots` need, dependencies included, in `images` order.
    fn image_closure(&self, roots: &[String], referrer: &str) -> Result<Vec<&ImageConfig>> {
        let mut needed: BTreeSet<&str> = BTreeSet::new();
        let mut stack: Vec<(&str, String)> = roots
            .iter()
            .map(|r| (r.as_str(), referrer.to_string()))
            .collect();

        while let Some((name, from)) = stack.pop() {
            let image = self.image_config(name, &from)?;
            if needed.insert(image.name.as_str()) {
                for dep in &image.deps {
                    stack.push((dep.as_str(), format!("image {}", image.name)));
                }
            }
        }

        Ok(self
            .images
            .iter()
            .filter(|i| needed.contains(i.name.as_str()))
            .collect())
    }

    /// Validated manifests in definition order. Relative paths resolve against
    /// `base_dir`; `config_path` becomes each manifest's config file.
    pub fn to_manifests(&self, base_dir: &Path, config_path: &Path) -> Result<Vec<Manifest>> {
        let mut names: BTreeSet<&ManifestName> = BTreeSet::new();
        for m in &self.manifests {
            if !names.insert(&m.name) {
                return Err(Error::DuplicateManifest(m.name.to_string()));
            }
        }
        let mut image_names: BTreeSet<&str> = BTreeSet::new();
        for image in &self.images {
            if !image_names.insert(image.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate image name: {}",
                    image.name
                )));
            }
        }

        let mut manifests = Vec::with_capacity(self.manifests.len());
        for mc in &self.manifests {
            if let Some(dep) = mc.resource_deps.iter().find(|d| !names.contains(d)) {
                return Err(Error::UnknownResourceDep {
                    manifest: mc.name.to_string(),
                    dependency: dep.to_string(),
                });
            }

            let referrer = format!("manifest {}", mc.name);
            let images = self
                .image_closure(&mc.images, &referrer)?
                .into_iter()
                .map(|i| image_target(i, base_dir))
                .collect::<Result<Vec<_>>>()?;
            let image_ids: Vec<TargetId> =
                mc.images.iter().map(|n| TargetId::image(n.as_str())).collect();

            let deploy = deploy_target(mc, image_ids, base_dir)?;
            if matches!(deploy, TargetSpec::Local(_)) && !images.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "manifest '{}' runs a local command and cannot build images",
                    mc.name
                )));
            }

            let mut manifest = Manifest::new(mc.name.clone(), deploy)
                .with_image_targets(images)
                .with_trigger_mode(mc.trigger_mode)
                .with_resource_deps(mc.resource_deps.clone());
            manifest.config_files = vec![config_path.to_path_buf()];
            manifest.validate()?;
            manifests.push(manifest);
        }

        Ok(manifests)
    }
}

fn image_target(config: &ImageConfig, base_dir: &Path) -> Result<ImageTarget> {
    let context = resolve(base_dir, &config.context);
    let mut target = ImageTarget::new(config.name.as_str(), config.image.clone(), &context)
        .with_dependencies(
            config
                .deps
                .iter()
                .map(|d| TargetId::image(d.as_str()))
                .collect(),
        );
    target.build = ImageBuildDetails {
        context,
        dockerfile: config.dockerfile.as_deref().map(|p| resolve(base_dir, p)),
        build_args: resolve_env_map(&config.build_args)?,
    };
    if let Some(lu) = &config.live_update {
        target = target.with_live_update(live_update_spec(lu, base_dir));
    }
    Ok(target)
}

fn live_update_spec(config: &LiveUpdateConfig, base_dir: &Path) -> LiveUpdateSpec {
    LiveUpdateSpec {
        base_path: base_dir.to_path_buf(),
        syncs: config
            .sync
            .iter()
            .map(|s| SyncRule {
                local_path: resolve(base_dir, &s.local),
                container_path: s.container.clone(),
            })
            .collect(),
        runs: config
            .run
            .iter()
            .map(|entry| match entry {
                RunEntry::Simple(cmd) => RunStep {
                    cmd: Cmd::shell(cmd.as_str()),
                    triggers: vec![],
                },
                RunEntry::Detailed { cmd, trigger } => RunStep {
                    cmd: Cmd::shell(cmd.as_str()),
                    triggers: trigger.iter().map(|t| resolve(base_dir, t)).collect(),
                },
            })
            .collect(),
        fall_back_on: config
            .fall_back_on
            .iter()
            .map(|p| resolve(base_dir, p))
            .collect(),
        restart: config.restart,
    }
}

fn deploy_target(
    mc: &ManifestConfig,
    image_ids: Vec<TargetId>,
    base_dir: &Path,
) -> Result<TargetSpec> {
    let name = mc.name.as_str();
    let declared = [mc.k8s.is_some(), mc.docker_compose.is_some(), mc.local.is_some()]
        .into_iter()
        .filter(|d| *d)
        .count();
    if declared > 1 {
        return Err(Error::MultipleDeployTargets(name.to_string()));
    }

    if let Some(k8s) = &mc.k8s {
        return Ok(K8sTarget {
            id: TargetId::k8s(name),
            yaml_path: resolve(base_dir, &k8s.yaml),
            namespace: k8s.namespace.clone(),
            image_dependency_ids: image_ids,
        }
        .into());
    }
    if let Some(dc) = &mc.docker_compose {
        return Ok(DockerComposeTarget {
            id: TargetId::docker_compose(name),
            config_paths: dc.files.iter().map(|f| resolve(base_dir, f)).collect(),
            service: dc.service.clone().unwrap_or_else(|| name.to_string()),
            image_dependency_ids: image_ids,
        }
        .into());
    }
    if let Some(local) = &mc.local {
        return Ok(LocalTarget {
            id: TargetId::local(name),
            cmd: local.cmd.clone(),
            workdir: local
                .workdir
                .as_deref()
                .map(|w| resolve(base_dir, w))
                .unwrap_or_else(|| base_dir.to_path_buf()),
            deps: local.deps.iter().map(|d| resolve(base_dir, d)).collect(),
            allow_parallel: local.allow_parallel,
        }
        .into());
    }

    Err(Error::MissingDeployTarget(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
update_mode: container
max_parallel_builds: 2
images:
  - name: base
    ref: registry.example.com/base
    context: base
  - name: web
    ref: registry.example.com/web
    context: web
    deps: [base]
    build_args:
      VERSION: {env: KILN_CONFIG_TEST_VERSION, default: dev}
    live_update:
      sync:
        - local: web/src
          container: /app/src
      run:
        - npm run build
        - cmd: npm install
          trigger: [web/package.json]
      fall_back_on: [web/Dockerfile]
manifests:
  - name: gen
    local:
      cmd: make generate
      deps: [proto]
  - name: web
    images: [web]
    resource_deps: [gen]
    k8s:
      yaml: k8s/web.yaml
  - name: worker
    images: [base]
    trigger_mode: manual
    docker_compose:
      files: [compose.yml]
"#;

    fn name(s: &str) -> ManifestName {
        ManifestName::new(s).unwrap()
    }

    #[test]
    fn parses_full_config() {
        let config = Config::from_yaml(FULL).unwrap();
        assert_eq!(config.update_mode, UpdateMode::Container);
        assert_eq!(config.max_parallel_builds, 2);
        assert_eq!(config.build_history_limit, DEFAULT_BUILD_HISTORY_LIMIT);
        assert_eq!(config.images.len(), 2);
        assert_eq!(config.manifests.len(), 3);
        assert_eq!(config.manifests.first().name, name("gen"));
        assert_eq!(config.manifests[2].trigger_mode, TriggerMode::Manual);
    }

    #[test]
    fn empty_manifest_list_is_rejected() {
        let err = Config::from_yaml("manifests: []\n").unwrap_err();
        assert!(err.to_string().contains("at least one manifest"));
    }

    #[test]
    fn invalid_manifest_name_is_rejected() {
        let err = Config::from_yaml("manifests:\n  - name: Web\n    local: {cmd: x}\n").unwrap_err();
        assert!(err.to_string().contains("lowercase"));
    }

    #[test]
    fn converts_to_manifests_with_resolved_paths() {
        let config = Config::from_yaml(FULL).unwrap();
        let base = Path::new("/work");
        let manifests = temp_env::with_var_unset("KILN_CONFIG_TEST_VERSION", || {
            config.to_manifests(base, &base.join("kiln.yml")).unwrap()
        });

        assert_eq!(manifests.len(), 3);
        let gen_manifest = &manifests[0];
        assert!(gen_manifest.is_local());
        let TargetSpec::Local(local) = &gen_manifest.deploy_target else {
            panic!("expected local target");
        };
        assert_eq!(local.workdir, PathBuf::from("/work"));
        assert_eq!(local.deps, vec![PathBuf::from("/work/proto")]);

        let web = &manifests[1];
        let ids: Vec<String> = web.image_targets.iter().map(|t| t.id.to_string()).collect();
        assert_eq!(ids, vec!["image:base", "image:web"]);
        assert_eq!(web.resource_deps, vec![name("gen")]);
        assert_eq!(web.config_files, vec![PathBuf::from("/work/kiln.yml")]);

        let image = web.image_target(&TargetId::image("web")).unwrap();
        assert_eq!(image.build.context, PathBuf::from("/work/web"));
        assert_eq!(image.build.build_args["VERSION"], "dev");
        let lu = image.live_update.as_ref().unwrap();
        assert_eq!(lu.syncs[0].local_path, PathBuf::from("/work/web/src"));
        assert_eq!(lu.runs.len(), 2);
        assert!(lu.runs[0].triggers.is_empty());
        assert_eq!(lu.runs[1].triggers, vec![PathBuf::from("/work/web/package.json")]);

        let TargetSpec::DockerCompose(dc) = &manifests[2].deploy_target else {
            panic!("expected compose target");
        };
        assert_eq!(dc.service, "worker");
        assert_eq!(dc.config_paths, vec![PathBuf::from("/work/compose.yml")]);
    }

    #[test]
    fn build_args_read_the_environment() {
        let config = Config::from_yaml(FULL).unwrap();
        let manifests = temp_env::with_var("KILN_CONFIG_TEST_VERSION", Some("2.0"), || {
            config
                .to_manifests(Path::new("/work"), Path::new("/work/kiln.yml"))
                .unwrap()
        });
        let image = manifests[1].image_target(&TargetId::image("web")).unwrap();
        assert_eq!(image.build.build_args["VERSION"], "2.0");
    }

    #[test]
    fn unknown_image_reference_is_an_error() {
        let yaml = "manifests:\n  - name: web\n    images: [nope]\n    k8s: {yaml: web.yaml}\n";
        let config = Config::from_yaml(yaml).unwrap();
        let err = config
            .to_manifests(Path::new("/w"), Path::new("/w/kiln.yml"))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownImage { image, .. } if image == "nope"));
    }

    #[test]
    fn deploy_target_must_be_declared_exactly_once() {
        let none = Config::from_yaml("manifests:\n  - name: web\n").unwrap();
        assert!(matches!(
            none.to_manifests(Path::new("/w"), Path::new("/w/kiln.yml")),
            Err(Error::MissingDeployTarget(_))
        ));

        let two = Config::from_yaml(
            "manifests:\n  - name: web\n    local: {cmd: x}\n    k8s: {yaml: a.yaml}\n",
        )
        .unwrap();
        assert!(matches!(
            two.to_manifests(Path::new("/w"), Path::new("/w/kiln.yml")),
            Err(Error::MultipleDeployTargets(_))
        ));
    }

    #[test]
    fn unknown_resource_dep_is_an_error() {
        let yaml = "manifests:\n  - name: web\n    resource_deps: [db]\n    local: {cmd: x}\n";
        let config = Config::from_yaml(yaml).unwrap();
        assert!(matches!(
            config.to_manifests(Path::new("/w"), Path::new("/w/kiln.yml")),
            Err(Error::UnknownResourceDep { .. })
        ));
    }

    #[test]
    fn discover_prefers_kiln_yml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".kiln")).unwrap();
        std::fs::write(
            dir.path().join(".kiln/config.yml"),
            "max_parallel_builds: 9\nmanifests:\n  - name: a\n    local: {cmd: x}\n",
        )
        .unwrap();
        assert_eq!(Config::discover(dir.path()).unwrap().max_parallel_builds, 9);

        std::fs::write(
            dir.path().join("kiln.yml"),
            "max_parallel_builds: 1\nmanifests:\n  - name: a\n    local: {cmd: x}\n",
        )
        .unwrap();
        assert_eq!(Config::discover(dir.path()).unwrap().max_parallel_builds, 1);
    }

    #[test]
    fn discover_without_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Config::discover(dir.path()),
            Err(Error::ConfigNotFound(_))
        ));
    }

    #[test]
    fn template_converts_cleanly() {
        let manifests = Config::from_yaml(init::TEMPLATE)
            .unwrap()
            .to_manifests(Path::new("/w"), Path::new("/w/kiln.yml"))
            .unwrap();
        assert_eq!(manifests.len(), 1);
        assert!(manifests[0].has_live_update());
    }
}

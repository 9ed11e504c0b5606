// ABOUTME: Integration tests for loading kiln.yml from disk into manifests.
// ABOUTME: Covers every deploy kind, live update run forms and cross-reference validation.

use kiln::config::*;
use kiln::error::Error;
use kiln::model::{TargetId, TargetSpec, TriggerMode};
use std::fs;
use std::path::Path;

const PROJECT: &str = r#"
max_parallel_builds: 4
images:
  - name: api
    ref: api
    context: services/api
    live_update:
      sync:
        - local: services/api/src
          container: /app/src
      run:
        - go generate ./...
        - cmd: go mod download
          trigger: [services/api/go.mod]
      fall_back_on: [services/api/Dockerfile]
manifests:
  - name: codegen
    local:
      cmd: make proto
      deps: [proto]
      allow_parallel: true
  - name: api
    images: [api]
    resource_deps: [codegen]
    docker_compose:
      files: [docker-compose.yml]
  - name: docs
    trigger_mode: manual
    local:
      cmd: mkdocs build
      workdir: docs
"#;

fn write_project(dir: &Path, yaml: &str) -> std::path::PathBuf {
    let path = dir.join(CONFIG_FILENAME);
    fs::write(&path, yaml).unwrap();
    path
}

#[test]
fn loads_a_project_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_project(dir.path(), PROJECT);

    let config = Config::discover(dir.path()).unwrap();
    assert_eq!(config.max_parallel_builds, 4);

    let manifests = config.to_manifests(dir.path(), &path).unwrap();
    let names: Vec<&str> = manifests.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["codegen", "api", "docs"]);

    let codegen = &manifests[0];
    let TargetSpec::Local(local) = &codegen.deploy_target else {
        panic!("codegen should run locally");
    };
    assert_eq!(local.workdir, dir.path());
    assert_eq!(local.deps, vec![dir.path().join("proto")]);
    assert!(local.allow_parallel);

    let api = &manifests[1];
    assert_eq!(api.resource_deps[0].as_str(), "codegen");
    assert_eq!(api.config_files, vec![path.clone()]);
    let TargetSpec::DockerCompose(dc) = &api.deploy_target else {
        panic!("api should deploy with compose");
    };
    assert_eq!(dc.service, "api");
    assert_eq!(dc.config_paths, vec![dir.path().join("docker-compose.yml")]);
    assert_eq!(dc.image_dependency_ids, vec![TargetId::image("api")]);

    let lu = api.image_targets[0].live_update.as_ref().unwrap();
    assert_eq!(lu.syncs[0].local_path, dir.path().join("services/api/src"));
    assert_eq!(lu.runs.len(), 2);
    assert!(lu.runs[0].triggers.is_empty());
    assert_eq!(lu.runs[1].triggers, vec![dir.path().join("services/api/go.mod")]);
    assert_eq!(lu.fall_back_on, vec![dir.path().join("services/api/Dockerfile")]);

    let docs = &manifests[2];
    assert_eq!(docs.trigger_mode, TriggerMode::Manual);
    let TargetSpec::Local(local) = &docs.deploy_target else {
        panic!("docs should run locally");
    };
    assert_eq!(local.workdir, dir.path().join("docs"));
}

#[test]
fn duplicate_manifest_names_are_rejected() {
    let config = Config::from_yaml(
        r#"
manifests:
  - name: app
    local: { cmd: "true" }
  - name: app
    local: { cmd: "false" }
"#,
    )
    .unwrap();
    let err = config
        .to_manifests(Path::new("/proj"), Path::new("/proj/kiln.yml"))
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateManifest(name) if name == "app"));
}

#[test]
fn local_manifest_cannot_build_images() {
    let config = Config::from_yaml(
        r#"
images:
  - name: app
    ref: app
manifests:
  - name: app
    images: [app]
    local: { cmd: make }
"#,
    )
    .unwrap();
    let err = config
        .to_manifests(Path::new("/proj"), Path::new("/proj/kiln.yml"))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
}

#[test]
fn image_dependency_cycle_is_rejected() {
    let config = Config::from_yaml(
        r#"
images:
  - name: a
    ref: a
    deps: [b]
  - name: b
    ref: b
    deps: [a]
manifests:
  - name: app
    images: [a]
    k8s: { yaml: app.yaml }
"#,
    )
    .unwrap();
    let result = config.to_manifests(Path::new("/proj"), Path::new("/proj/kiln.yml"));
    assert!(matches!(result, Err(Error::Model(_))));
}

#[test]
fn unknown_update_mode_is_a_parse_error() {
    let result = Config::from_yaml(
        r#"
update_mode: rsync
manifests:
  - name: app
    local: { cmd: make }
"#,
    );
    assert!(matches!(result, Err(Error::Yaml(_))));
}

#[test]
fn init_writes_a_loadable_config() {
    let dir = tempfile::tempdir().unwrap();
    init_config(dir.path(), Some("shop"), Some("ghcr.io/acme/shop"), false).unwrap();

    let config = Config::discover(dir.path()).unwrap();
    let manifests = config
        .to_manifests(dir.path(), &dir.path().join(CONFIG_FILENAME))
        .unwrap();
    assert_eq!(manifests[0].name.as_str(), "shop");
    assert_eq!(
        manifests[0].image_targets[0].image_ref.to_string(),
        "ghcr.io/acme/shop:latest"
    );
}

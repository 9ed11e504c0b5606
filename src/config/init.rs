// ABOUTME: Config scaffolding for new projects.
// ABOUTME: Creates kiln.yml template files.

use std::path::Path;

use crate::error::{Error, Result};
use crate::types::{ImageRef, ManifestName};

use super::CONFIG_FILENAME;

pub(crate) const TEMPLATE: &str = r#"# How image changes reach running containers: auto, image, container or exec.
update_mode: auto
max_parallel_builds: 3

images:
  - name: app
    ref: my-registry/my-app
    context: .
    live_update:
      sync:
        - local: src
          container: /app/src
      # run:
      #   - cmd: npm install
      #     trigger: [package.json]
      # fall_back_on: [Dockerfile]

manifests:
  - name: app
    images: [app]
    k8s:
      yaml: k8s/app.yaml
"#;

/// Write a starter `kiln.yml` into `dir`.
pub fn init_config(dir: &Path, name: Option<&str>, image: Option<&str>, force: bool) -> Result<()> {
    let config_path = dir.join(CONFIG_FILENAME);

    if config_path.exists() && !force {
        return Err(Error::AlreadyExists(config_path));
    }

    let mut yaml = TEMPLATE.to_string();

    if let Some(i) = image {
        let image = ImageRef::parse(i).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        yaml = yaml.replace("ref: my-registry/my-app", &format!("ref: {}", image));
    }

    if let Some(n) = name {
        let name = ManifestName::new(n).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        yaml = yaml
            .replace("  - name: app\n", &format!("  - name: {}\n", name))
            .replace("images: [app]", &format!("images: [{}]", name))
            .replace("k8s/app.yaml", &format!("k8s/{}.yaml", name));
    }

    std::fs::write(&config_path, yaml)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn writes_a_loadable_template() {
        let dir = tempfile::tempdir().unwrap();
        init_config(dir.path(), Some("shop"), Some("ghcr.io/acme/shop"), false).unwrap();

        let config = Config::discover(dir.path()).unwrap();
        assert_eq!(config.manifests.first().name.as_str(), "shop");
        assert_eq!(config.images[0].name, "shop");
        assert_eq!(config.images[0].image.name(), "acme/shop");
        config
            .to_manifests(dir.path(), &dir.path().join(CONFIG_FILENAME))
            .unwrap();
    }

    #[test]
    fn refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        init_config(dir.path(), None, None, false).unwrap();
        assert!(matches!(
            init_config(dir.path(), None, None, false),
            Err(Error::AlreadyExists(_))
        ));
        init_config(dir.path(), None, None, true).unwrap();
    }

    #[test]
    fn rejects_invalid_names() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            init_config(dir.path(), Some("Bad Name"), None, false),
            Err(Error::InvalidConfig(_))
        ));
    }
}

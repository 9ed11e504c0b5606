// ABOUTME: Command module aggregator for the kiln CLI.
// ABOUTME: Shared project loading plus the up, ci and targets handlers.

mod ci;
mod targets;
mod up;

pub use ci::ci;
pub use targets::targets;
pub use up::up;

use kiln::buildcontrol::UpdateMode;
use kiln::config::Config;
use kiln::engine::{ConfigLoader, Engine, EngineOptions, default_collaborators};
use kiln::error::Result;
use kiln::model::Manifest;
use kiln::output::OutputMode;
use kiln::runtime::Environment;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn read_config(config_path: &Path) -> Result<(Config, Vec<Manifest>)> {
    let config = Config::load(config_path)?;
    let base_dir = match config_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => env::current_dir()?,
    };
    let manifests = config.to_manifests(&base_dir, config_path)?;
    Ok((config, manifests))
}

/// A config file and the manifests it describes.
pub struct Project {
    pub config: Config,
    pub config_path: PathBuf,
    pub manifests: Vec<Manifest>,
}

impl Project {
    /// Load `file`, or discover a config in the current directory.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let config_path = match file {
            Some(path) => std::path::absolute(path)?,
            None => Config::find(&env::current_dir()?)?,
        };
        let (config, manifests) = read_config(&config_path)?;
        Ok(Self {
            config,
            config_path,
            manifests,
        })
    }

    /// Reloads this project's manifests from disk.
    pub fn loader(&self) -> ConfigLoader {
        let path = self.config_path.clone();
        Arc::new(move || read_config(&path).map(|(_, manifests)| manifests))
    }

    /// An engine for the machine this runs on, with the manifests loaded.
    pub fn engine(self, update_mode: Option<UpdateMode>, output: OutputMode) -> Engine {
        let mut options = EngineOptions::from_config(&self.config, output);
        if let Some(mode) = update_mode {
            options.update_mode = mode;
        }

        let mut environment = Environment::detect();
        if let Some(context) = &self.config.kube_context {
            environment.kube_context = Some(context.clone());
        }
        let collaborators = default_collaborators(environment.kube_context.as_deref());

        let engine = Engine::for_environment(&options, &environment, collaborators);
        engine.load_manifests(self.manifests);
        engine
    }
}

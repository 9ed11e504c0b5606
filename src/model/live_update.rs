// ABOUTME: In-place container update rules attached to image targets.
// ABOUTME: Maps changed local files into container paths and selects run steps.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use super::ModelError;

/// Copy files under `local_path` into the container at `container_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRule {
    pub local_path: PathBuf,
    pub container_path: String,
}

/// Command executed inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cmd {
    pub argv: Vec<String>,
}

impl Cmd {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    /// Wrap a shell line as `sh -c <line>`.
    pub fn shell(line: impl Into<String>) -> Self {
        Self {
            argv: vec!["sh".to_string(), "-c".to_string(), line.into()],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.argv.is_empty()
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.argv.as_slice() {
            [sh, flag, line] if sh == "sh" && flag == "-c" => write!(f, "{}", line),
            argv => write!(f, "{}", argv.join(" ")),
        }
    }
}

/// A command run after files are synced. With no triggers it always runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStep {
    pub cmd: Cmd,
    pub triggers: Vec<PathBuf>,
}

/// A changed local file and where it lands in the container.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PathMapping {
    pub local_path: PathBuf,
    pub container_path: String,
}

impl fmt::Display for PathMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} --> {}", self.local_path.display(), self.container_path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LiveUpdateSpec {
    /// Directory used to shorten paths in log lines.
    pub base_path: PathBuf,
    pub syncs: Vec<SyncRule>,
    pub runs: Vec<RunStep>,
    /// Changes to any of these paths force a full rebuild.
    pub fall_back_on: Vec<PathBuf>,
    /// Restart the container after syncing instead of hot reloading.
    pub restart: bool,
}

impl LiveUpdateSpec {
    pub fn is_empty(&self) -> bool {
        self.syncs.is_empty() && self.runs.is_empty()
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        for sync in &self.syncs {
            if !sync.container_path.starts_with('/') {
                return Err(ModelError::InvalidLiveUpdate(format!(
                    "sync destination '{}' must be an absolute container path",
                    sync.container_path
                )));
            }
        }
        if let Some(run) = self.runs.iter().find(|r| r.cmd.is_empty()) {
            return Err(ModelError::InvalidLiveUpdate(format!(
                "run step with triggers {:?} has an empty command",
                run.triggers
            )));
        }
        Ok(())
    }

    /// Map each file through the first sync rule that contains it.
    /// Files outside every sync rule are returned separately.
    pub fn files_to_path_mappings(&self, files: &[PathBuf]) -> (Vec<PathMapping>, Vec<PathBuf>) {
        let mut mappings = Vec::new();
        let mut unmatched = Vec::new();

        for file in files {
            match self.syncs.iter().find_map(|s| map_through(s, file)) {
                Some(mapping) => mappings.push(mapping),
                None => unmatched.push(file.clone()),
            }
        }

        (mappings, unmatched)
    }

    /// First changed file that sits under a `fall_back_on` path.
    pub fn fall_back_on_match<'a>(&self, files: &'a [PathBuf]) -> Option<&'a PathBuf> {
        files
            .iter()
            .find(|f| self.fall_back_on.iter().any(|fb| f.starts_with(fb)))
    }

    /// Run steps that should execute for this set of changes, in declaration order.
    pub fn boil_runs(&self, mappings: &[PathMapping]) -> Vec<Cmd> {
        self.runs
            .iter()
            .filter(|run| {
                run.triggers.is_empty()
                    || mappings
                        .iter()
                        .any(|m| run.triggers.iter().any(|t| m.local_path.starts_with(t)))
            })
            .map(|run| run.cmd.clone())
            .collect()
    }

    /// Path relative to `base_path` when possible, for log lines.
    pub fn display_path<'a>(&self, path: &'a Path) -> std::borrow::Cow<'a, str> {
        match path.strip_prefix(&self.base_path) {
            Ok(rel) if !self.base_path.as_os_str().is_empty() => rel.to_string_lossy(),
            _ => path.to_string_lossy(),
        }
    }
}

fn map_through(sync: &SyncRule, file: &Path) -> Option<PathMapping> {
    let rel = file.strip_prefix(&sync.local_path).ok()?;

    let container_path = if rel.as_os_str().is_empty() {
        // Syncing a single file into a directory keeps its name.
        match (sync.container_path.ends_with('/'), file.file_name()) {
            (true, Some(name)) => format!("{}{}", sync.container_path, name.to_string_lossy()),
            _ => sync.container_path.clone(),
        }
    } else {
        let base = sync.container_path.trim_end_matches('/');
        format!("{}/{}", base, rel.to_string_lossy())
    };

    Some(PathMapping {
        local_path: file.to_path_buf(),
        container_path,
    })
}

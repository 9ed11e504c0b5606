// ABOUTME: Actions dispatched into the store and the change summaries handed to subscribers.
// ABOUTME: Actions are the only way EngineState changes.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::PathBuf;

use super::build_result::{BuildResultSet, ContainerInfo};
use super::engine_state::{BuildReason, RuntimeStatus};
use crate::buildcontrol::BuildError;
use crate::model::{Manifest, TargetId};
use crate::types::{ImageRef, ManifestName};

#[derive(Debug, Clone)]
pub struct BuildStartedAction {
    pub manifest: ManifestName,
    pub start_time: DateTime<Utc>,
    pub files_changed: Vec<PathBuf>,
    pub reason: BuildReason,
    pub build_count: usize,
    pub full_build_triggered: bool,
}

#[derive(Debug, Clone)]
pub struct BuildCompleteAction {
    pub manifest: ManifestName,
    pub build_count: usize,
    pub result: Result<BuildResultSet, BuildError>,
    pub finish_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum Action {
    /// A config load produced this full list of manifests. `changed_files`
    /// are the config files whose edits caused the reload.
    ConfigsReloaded {
        manifests: Vec<Manifest>,
        changed_files: Vec<PathBuf>,
    },

    FileChange {
        target_id: TargetId,
        paths: Vec<PathBuf>,
        at: DateTime<Utc>,
    },

    ManualTrigger {
        manifest: ManifestName,
        reason: BuildReason,
    },

    /// What the runtime reports for the deploy that runs `images`.
    RuntimeStateChanged {
        manifest: ManifestName,
        images: Vec<ImageRef>,
        status: RuntimeStatus,
        containers: Vec<ContainerInfo>,
    },

    BuildStarted(BuildStartedAction),

    BuildComplete(BuildCompleteAction),

    Error { message: String },
}

impl Action {
    pub fn file_change(target_id: TargetId, paths: Vec<PathBuf>) -> Self {
        Action::FileChange {
            target_id,
            paths,
            at: Utc::now(),
        }
    }

    pub fn trigger(manifest: ManifestName) -> Self {
        Action::ManualTrigger {
            manifest,
            reason: BuildReason::TRIGGER,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Action::Error {
            message: message.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::ConfigsReloaded { .. } => "ConfigsReloaded",
            Action::FileChange { .. } => "FileChange",
            Action::ManualTrigger { .. } => "ManualTrigger",
            Action::RuntimeStateChanged { .. } => "RuntimeStateChanged",
            Action::BuildStarted(_) => "BuildStarted",
            Action::BuildComplete(_) => "BuildComplete",
            Action::Error { .. } => "Error",
        }
    }
}

/// Build lifecycle events, in the order the reducer applied them.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildEvent {
    Started {
        manifest: ManifestName,
        build_count: usize,
        reason: BuildReason,
        files_changed: Vec<PathBuf>,
    },
    Completed {
        manifest: ManifestName,
        build_count: usize,
        duration: chrono::Duration,
        error: Option<BuildError>,
    },
}

/// What changed since a subscriber was last notified. Summaries merge, so a
/// subscriber that falls behind sees one combined summary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSummary {
    pub manifests: BTreeSet<ManifestName>,
    pub config_reloaded: bool,
    pub events: Vec<BuildEvent>,
    pub errors: Vec<String>,
}

impl ChangeSummary {
    pub fn manifest(name: ManifestName) -> Self {
        let mut summary = Self::default();
        summary.manifests.insert(name);
        summary
    }

    pub fn merge(&mut self, other: ChangeSummary) {
        self.manifests.extend(other.manifests);
        self.config_reloaded |= other.config_reloaded;
        self.events.extend(other.events);
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
            && !self.config_reloaded
            && self.events.is_empty()
            && self.errors.is_empty()
    }
}

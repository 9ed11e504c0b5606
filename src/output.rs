// ABOUTME: Output formatting for CLI feedback.
// ABOUTME: Supports normal, quiet (CI), and JSON output modes, fed by build events from the store.

use async_trait::async_trait;
use clap::ValueEnum;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;

use crate::store::{BuildEvent, BuildReason, ChangeSummary, Store, StoreError, Subscriber};
use crate::types::ManifestName;

/// Output mode for CLI feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputMode {
    /// Human-friendly output with progress messages
    #[default]
    Normal,
    /// Minimal output for CI (only failures and the final result)
    Quiet,
    /// JSON lines for scripting
    Json,
}

/// Handles CLI output based on the configured mode.
pub struct Output {
    mode: OutputMode,
    start_time: Option<Instant>,
}

impl Output {
    pub fn new(mode: OutputMode) -> Self {
        Self {
            mode,
            start_time: None,
        }
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    /// Start timing an operation.
    pub fn start_timer(&mut self) {
        self.start_time = Some(Instant::now());
    }

    /// Get elapsed time since timer started.
    pub fn elapsed_secs(&self) -> f64 {
        self.start_time
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    fn duration(&self) -> Option<f64> {
        self.start_time.map(|_| self.elapsed_secs())
    }

    /// Print a progress message (suppressed in quiet/json mode).
    pub fn progress(&self, message: &str) {
        if self.mode == OutputMode::Normal {
            println!("{message}");
        }
    }

    /// Print a success message with optional timing.
    pub fn success(&self, message: &str) {
        match self.mode {
            OutputMode::Normal => {
                let elapsed = self.elapsed_secs();
                if elapsed > 0.0 {
                    println!("{message} ({:.1}s)", elapsed);
                } else {
                    println!("{message}");
                }
            }
            OutputMode::Quiet => println!("{message}"),
            OutputMode::Json => {
                if let Some(json) = json_line(&JsonEvent::Message {
                    event: "success",
                    message,
                    duration_secs: self.duration(),
                }) {
                    println!("{json}");
                }
            }
        }
    }

    /// Print an error message.
    pub fn error(&self, message: &str) {
        match self.mode {
            OutputMode::Normal | OutputMode::Quiet => eprintln!("Error: {message}"),
            OutputMode::Json => {
                if let Some(json) = json_line(&JsonEvent::Message {
                    event: "error",
                    message,
                    duration_secs: self.duration(),
                }) {
                    eprintln!("{json}");
                }
            }
        }
    }

    /// Report one build lifecycle event.
    pub fn build_event(&self, event: &BuildEvent) {
        if let Some(line) = self.format_build_event(event) {
            println!("{line}");
        }
    }

    /// The line printed for `event`, or `None` when the mode hides it.
    pub fn format_build_event(&self, event: &BuildEvent) -> Option<String> {
        match (self.mode, event) {
            (OutputMode::Json, event) => json_line(&JsonEvent::from(event)),
            (
                OutputMode::Normal,
                BuildEvent::Started {
                    manifest,
                    build_count,
                    reason,
                    files_changed,
                },
            ) => {
                let mut line = format!("[{manifest}] build #{build_count} started ({reason})");
                if !files_changed.is_empty() {
                    line.push_str(&format!(", {} file(s) changed", files_changed.len()));
                }
                Some(line)
            }
            (OutputMode::Quiet, BuildEvent::Started { .. }) => None,
            (
                mode,
                BuildEvent::Completed {
                    manifest,
                    build_count,
                    duration,
                    error,
                },
            ) => {
                let secs = seconds(*duration);
                match error {
                    None if mode == OutputMode::Quiet => None,
                    None => Some(format!(
                        "[{manifest}] build #{build_count} succeeded ({secs:.1}s)"
                    )),
                    Some(err) => Some(format!(
                        "[{manifest}] build #{build_count} failed ({secs:.1}s): {err}"
                    )),
                }
            }
        }
    }
}

fn seconds(duration: chrono::Duration) -> f64 {
    duration.num_milliseconds() as f64 / 1000.0
}

fn json_line<T: Serialize>(event: &T) -> Option<String> {
    serde_json::to_string(event).ok()
}

#[derive(Serialize)]
#[serde(untagged)]
enum JsonEvent<'a> {
    Message {
        event: &'a str,
        message: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_secs: Option<f64>,
    },
    BuildStarted {
        event: &'a str,
        manifest: &'a ManifestName,
        build_count: usize,
        reason: BuildReason,
        files_changed: &'a [PathBuf],
    },
    BuildCompleted {
        event: &'a str,
        manifest: &'a ManifestName,
        build_count: usize,
        duration_secs: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl<'a> From<&'a BuildEvent> for JsonEvent<'a> {
    fn from(event: &'a BuildEvent) -> Self {
        match event {
            BuildEvent::Started {
                manifest,
                build_count,
                reason,
                files_changed,
            } => JsonEvent::BuildStarted {
                event: "build_started",
                manifest,
                build_count: *build_count,
                reason: *reason,
                files_changed,
            },
            BuildEvent::Completed {
                manifest,
                build_count,
                duration,
                error,
            } => JsonEvent::BuildCompleted {
                event: "build_completed",
                manifest,
                build_count: *build_count,
                duration_secs: seconds(*duration),
                error: error.as_ref().map(|e| e.to_string()),
            },
        }
    }
}

/// Store subscriber that reports build events as they are reduced.
pub struct OutputSubscriber {
    output: Output,
}

impl OutputSubscriber {
    pub fn new(mode: OutputMode) -> Self {
        Self {
            output: Output::new(mode),
        }
    }
}

#[async_trait]
impl Subscriber for OutputSubscriber {
    fn name(&self) -> &str {
        "output"
    }

    async fn on_change(&self, _store: &Store, summary: ChangeSummary) -> Result<(), StoreError> {
        for event in &summary.events {
            self.output.build_event(event);
        }
        for error in &summary.errors {
            self.output.error(error);
        }
        Ok(())
    }
}

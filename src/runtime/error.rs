// ABOUTME: Runtime error types with SNAFU pattern.
// ABOUTME: Separates user command failures from infrastructure failures for the fallback chain.

use snafu::Snafu;

use crate::buildcontrol::BuildError;

/// Failure of an external tool kiln drives (docker, kubectl, sh).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RuntimeError {
    #[snafu(display("failed to start {program}: {source}"))]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[snafu(display("`{command}` exited with code {}: {}", code_str(*exit_code), stderr.trim()))]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// A live-update run step returned non-zero inside the container.
    #[snafu(display("Run step \"{command}\" failed with exit code: {exit_code}"))]
    RunStepFailed {
        command: String,
        exit_code: i32,
        output: String,
    },

    #[snafu(display("unexpected output from `{command}`: {message}"))]
    UnexpectedOutput { command: String, message: String },

    #[snafu(display("building archive failed: {source}"))]
    Archive { source: std::io::Error },

    #[snafu(display("reading {path}: {source}"))]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("{message}"))]
    Unsupported { message: String },

    #[snafu(display("cancelled"))]
    Cancelled,
}

/// Error kind for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    /// The tool could not be started at all.
    SpawnFailed,
    /// The tool ran and reported failure.
    CommandFailed,
    /// A user-provided run step failed inside a container.
    RunStepFailed,
    /// The tool succeeded but its output made no sense.
    UnexpectedOutput,
    /// Local filesystem problem while preparing inputs.
    Io,
    /// The operation is not available for this target.
    Unsupported,
    Cancelled,
}

fn code_str(code: Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}

impl RuntimeError {
    /// Returns the error kind for programmatic handling.
    pub fn kind(&self) -> RuntimeErrorKind {
        match self {
            RuntimeError::Spawn { .. } => RuntimeErrorKind::SpawnFailed,
            RuntimeError::CommandFailed { .. } => RuntimeErrorKind::CommandFailed,
            RuntimeError::RunStepFailed { .. } => RuntimeErrorKind::RunStepFailed,
            RuntimeError::UnexpectedOutput { .. } => RuntimeErrorKind::UnexpectedOutput,
            RuntimeError::Archive { .. } | RuntimeError::ReadFile { .. } => RuntimeErrorKind::Io,
            RuntimeError::Unsupported { .. } => RuntimeErrorKind::Unsupported,
            RuntimeError::Cancelled => RuntimeErrorKind::Cancelled,
        }
    }

    pub fn is_run_step_failure(&self) -> bool {
        self.kind() == RuntimeErrorKind::RunStepFailed
    }

    /// For failures of the user's own build or deploy: do not fall back.
    pub fn into_user_failure(self) -> BuildError {
        match self {
            RuntimeError::Cancelled => BuildError::Cancelled,
            other => BuildError::dont_fall_back(other.to_string()),
        }
    }

    /// For failures of kiln's own plumbing: let the next strategy try.
    pub fn into_infra_failure(self) -> BuildError {
        match self {
            RuntimeError::Cancelled => BuildError::Cancelled,
            other => BuildError::unexpected(other.to_string()),
        }
    }
}

// ABOUTME: Error taxonomy that steers the build-and-deploy fallback chain.
// ABOUTME: Redirects try the next strategy; DontFallBack and Cancelled stop the chain.

use std::fmt;

/// How loudly a redirect is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectLevel {
    /// Routine, logged at debug.
    Silent,
    /// Worth telling the user, logged at info.
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectCause {
    /// The strategy cannot handle these targets.
    Inapplicable,
    /// The strategy could apply once the deploy reports its containers.
    NotReady,
}

/// Failure of one build attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// This strategy does not apply; try the next one.
    #[error("{message}")]
    Redirect {
        level: RedirectLevel,
        cause: RedirectCause,
        message: String,
    },

    /// The user's own build or update command failed.
    #[error("{message}")]
    DontFallBack { message: String },

    /// The build was cancelled.
    #[error("build cancelled")]
    Cancelled,

    #[error("{message}")]
    Unexpected { message: String },
}

/// Error kind for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildErrorKind {
    Redirect,
    DontFallBack,
    Cancelled,
    Unexpected,
}

impl fmt::Display for BuildErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildErrorKind::Redirect => "redirect",
            BuildErrorKind::DontFallBack => "build failed",
            BuildErrorKind::Cancelled => "cancelled",
            BuildErrorKind::Unexpected => "unexpected",
        };
        f.write_str(s)
    }
}

impl BuildError {
    pub fn silent_redirect(message: impl Into<String>) -> Self {
        BuildError::Redirect {
            level: RedirectLevel::Silent,
            cause: RedirectCause::Inapplicable,
            message: message.into(),
        }
    }

    pub fn info_redirect(message: impl Into<String>) -> Self {
        BuildError::Redirect {
            level: RedirectLevel::Info,
            cause: RedirectCause::Inapplicable,
            message: message.into(),
        }
    }

    /// Redirect because the runtime has not reported what the strategy needs yet.
    pub fn not_ready(message: impl Into<String>) -> Self {
        BuildError::Redirect {
            level: RedirectLevel::Info,
            cause: RedirectCause::NotReady,
            message: message.into(),
        }
    }

    pub fn dont_fall_back(message: impl Into<String>) -> Self {
        BuildError::DontFallBack {
            message: message.into(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        BuildError::Unexpected {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> BuildErrorKind {
        match self {
            BuildError::Redirect { .. } => BuildErrorKind::Redirect,
            BuildError::DontFallBack { .. } => BuildErrorKind::DontFallBack,
            BuildError::Cancelled => BuildErrorKind::Cancelled,
            BuildError::Unexpected { .. } => BuildErrorKind::Unexpected,
        }
    }

    pub fn is_redirect(&self) -> bool {
        self.kind() == BuildErrorKind::Redirect
    }

    pub fn is_not_ready(&self) -> bool {
        matches!(
            self,
            BuildError::Redirect {
                cause: RedirectCause::NotReady,
                ..
            }
        )
    }

    /// Wrap an error as a user failure, keeping cancellation as-is.
    pub fn into_dont_fall_back(self) -> Self {
        match self {
            BuildError::Cancelled | BuildError::DontFallBack { .. } => self,
            other => BuildError::dont_fall_back(other.to_string()),
        }
    }
}

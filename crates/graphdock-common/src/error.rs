//! Common error types for the graphdock harness.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`HarnessError`].
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Errors raised by the harness.
///
/// Setup-phase errors propagate and fail the calling test. Teardown never
/// returns one of these; it records failures in its report instead.
#[derive(Error, Diagnostic, Debug)]
pub enum HarnessError {
    /// Version string does not match `MAJOR.MINOR.PATCH[-LABEL]`.
    #[error("Malformed version: {input}")]
    #[diagnostic(
        code(graphdock::version::malformed),
        help("Versions look like '4.4.0', '5.1.0' or '5.0.0-rc1' (single digit major and minor)")
    )]
    MalformedVersion {
        /// The rejected input.
        input: String,
    },

    /// A host directory could not be created.
    #[error("Could not create directory {}: {source}", path.display())]
    #[diagnostic(code(graphdock::fs::create_dir))]
    DirectoryCreation {
        /// The directory that failed.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// A container did not become ready within its startup timeout.
    #[error("Container {container} was not ready after {timeout_secs}s (waiting for {waiting_for})")]
    #[diagnostic(code(graphdock::container::startup_timeout))]
    StartupTimeout {
        /// Container id.
        container: String,
        /// The timeout that expired.
        timeout_secs: u64,
        /// Human readable description of the wait strategy.
        waiting_for: String,
        /// Container output captured at the time of failure.
        logs: String,
    },

    /// A container exited or failed before becoming ready.
    #[error("Container {container} failed to launch: {message}")]
    #[diagnostic(code(graphdock::container::launch))]
    ContainerLaunch {
        /// Container id, or the image name if creation itself failed.
        container: String,
        /// What went wrong.
        message: String,
        /// Container output captured at the time of failure.
        logs: String,
    },

    /// The privileged ownership change failed.
    #[error("Could not change owner of {} to {owner}: {message}", path.display())]
    #[diagnostic(
        code(graphdock::fs::chown),
        help("Ownership changes run inside a helper container; check that the helper image has a shell and chown")
    )]
    OwnershipChange {
        /// The path being re-owned.
        path: PathBuf,
        /// The requested owner (`uid:gid` or user name).
        owner: String,
        /// Failure description, including the helper's stderr when available.
        message: String,
    },

    /// The container engine API reported an error.
    #[error("Container runtime error: {message}")]
    #[diagnostic(code(graphdock::runtime))]
    Runtime {
        /// The error message.
        message: String,
    },

    /// The database client failed to connect or a query failed.
    #[error("Database error: {message}")]
    #[diagnostic(code(graphdock::database))]
    Database {
        /// The error message.
        message: String,
    },

    /// A scenario assertion failed.
    #[error("Verification failed: {message}")]
    #[diagnostic(code(graphdock::verification))]
    Verification {
        /// The failed assertion.
        message: String,
        /// Raw command output attached for diagnosis.
        output: Option<String>,
    },

    /// A scenario precondition does not hold for this image or platform.
    #[error("Scenario not supported: {reason}")]
    #[diagnostic(code(graphdock::unsupported))]
    UnsupportedScenario {
        /// Why the scenario cannot run.
        reason: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(graphdock::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(graphdock::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(graphdock::serialization))]
    Serialization(String),
}

impl HarnessError {
    /// Shorthand for a [`HarnessError::Verification`] without attached output.
    pub fn verification(message: impl Into<String>) -> Self {
        Self::Verification {
            message: message.into(),
            output: None,
        }
    }

    /// Container output captured by a failed launch, if any.
    #[must_use]
    pub fn container_logs(&self) -> Option<&str> {
        match self {
            Self::StartupTimeout { logs, .. } | Self::ContainerLaunch { logs, .. } => Some(logs),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for HarnessError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for HarnessError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config {
            message: err.to_string(),
        }
    }
}

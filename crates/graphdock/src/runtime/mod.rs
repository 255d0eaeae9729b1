//! Container runtime abstraction.
//!
//! The harness drives containers through [`ContainerRuntime`]. [`launch`]
//! adds the bounded readiness wait on top of create and start, and
//! [`shutdown`] stops a container gracefully, forwards its output to the log
//! and removes it.

mod docker;
mod spec;
pub mod wait;

use std::fmt;

use async_trait::async_trait;
use graphdock_common::{HarnessError, HarnessResult};

pub use docker::DockerRuntime;
pub use spec::{BindMode, ContainerSpec, MountSource, VolumeBinding};
pub use wait::{Readiness, WaitStrategy};

/// A created container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    /// Engine-assigned container id.
    pub id: String,
    /// Image the container was created from.
    pub image: String,
}

impl ContainerHandle {
    /// Short id for log lines.
    #[must_use]
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.short_id(), self.image)
    }
}

/// Container lifecycle state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Created, not yet started.
    Created,
    /// Running.
    Running,
    /// Exited with the given code.
    Exited(i64),
}

/// Output of a command run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Exit code.
    pub exit_code: i64,
}

impl ExecResult {
    /// True if the command exited with 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Captured container output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerLogs {
    /// Everything written to stdout.
    pub stdout: String,
    /// Everything written to stderr.
    pub stderr: String,
}

impl ContainerLogs {
    /// Lines of stdout followed by lines of stderr.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().chain(self.stderr.lines())
    }

    /// Both streams in one string.
    #[must_use]
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// Operations the harness needs from a container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container. Missing images are pulled first.
    async fn create(&self, spec: &ContainerSpec) -> HarnessResult<ContainerHandle>;

    /// Start a created container without waiting for readiness.
    async fn start(&self, container: &ContainerHandle) -> HarnessResult<()>;

    /// Stop a container gracefully so the process can flush its state.
    async fn stop(&self, container: &ContainerHandle) -> HarnessResult<()>;

    /// Remove a container and its anonymous volumes.
    async fn remove(&self, container: &ContainerHandle) -> HarnessResult<()>;

    /// Run a command inside a running container.
    async fn exec(&self, container: &ContainerHandle, command: &[String]) -> HarnessResult<ExecResult>;

    /// Output written so far.
    async fn logs(&self, container: &ContainerHandle) -> HarnessResult<ContainerLogs>;

    /// Current lifecycle state.
    async fn state(&self, container: &ContainerHandle) -> HarnessResult<ContainerState>;

    /// Host port a published container port is mapped to.
    async fn mapped_port(&self, container: &ContainerHandle, port: u16) -> HarnessResult<u16>;

    /// Host on which mapped ports are reachable.
    fn host(&self) -> String;

    /// Remove a named volume.
    async fn remove_volume(&self, name: &str) -> HarnessResult<()>;
}

/// Create and start a container, then wait until `spec.wait` holds.
///
/// There are no retries. On failure the container output is captured into
/// the returned error and the container is stopped and removed.
///
/// # Errors
///
/// Returns [`HarnessError::StartupTimeout`] if the wait does not resolve in
/// `spec.startup_timeout`, or [`HarnessError::ContainerLaunch`] if the
/// container cannot be started or exits before becoming ready.
pub async fn launch(
    runtime: &dyn ContainerRuntime,
    spec: &ContainerSpec,
) -> HarnessResult<ContainerHandle> {
    let container = runtime.create(spec).await?;
    tracing::debug!(container = %container, waiting_for = %spec.wait, "Starting container");

    if let Err(err) = runtime.start(&container).await {
        let logs = discard(runtime, &container).await;
        return Err(HarnessError::ContainerLaunch {
            container: container.id,
            message: err.to_string(),
            logs,
        });
    }

    let waited = tokio::time::timeout(spec.startup_timeout, async {
        loop {
            match spec.wait.poll(runtime, &container).await? {
                Readiness::Ready => return Ok::<_, HarnessError>(None),
                Readiness::Failed(reason) => return Ok(Some(reason)),
                Readiness::Pending => tokio::time::sleep(wait::POLL_INTERVAL).await,
            }
        }
    })
    .await;

    match waited {
        Ok(Ok(None)) => {
            tracing::info!(container = %container, "Container ready");
            Ok(container)
        }
        Ok(Ok(Some(reason))) => {
            let logs = discard(runtime, &container).await;
            tracing::warn!(container = %container, %reason, "Container failed to launch");
            Err(HarnessError::ContainerLaunch {
                container: container.id,
                message: reason,
                logs,
            })
        }
        Ok(Err(err)) => {
            let logs = discard(runtime, &container).await;
            Err(HarnessError::ContainerLaunch {
                container: container.id,
                message: err.to_string(),
                logs,
            })
        }
        Err(_) => {
            let logs = discard(runtime, &container).await;
            tracing::warn!(
                container = %container,
                timeout_secs = spec.startup_timeout.as_secs(),
                "Container startup timed out"
            );
            Err(HarnessError::StartupTimeout {
                container: container.id,
                timeout_secs: spec.startup_timeout.as_secs(),
                waiting_for: spec.wait.to_string(),
                logs,
            })
        }
    }
}

/// Stop a container gracefully, forward its output to the log and remove it.
///
/// # Errors
///
/// Returns an error if the container cannot be stopped. It is removed
/// either way; removal failures are only logged.
pub async fn shutdown(runtime: &dyn ContainerRuntime, container: &ContainerHandle) -> HarnessResult<()> {
    let stopped = runtime.stop(container).await;
    forward_logs(runtime, container).await;
    if let Err(err) = runtime.remove(container).await {
        tracing::warn!(container = %container, error = %err, "Failed to remove container");
    }
    stopped
}

/// Emit every output line of a container as a debug event.
pub async fn forward_logs(runtime: &dyn ContainerRuntime, container: &ContainerHandle) {
    match runtime.logs(container).await {
        Ok(logs) => {
            for line in logs.lines() {
                tracing::debug!(container = container.short_id(), "{line}");
            }
        }
        Err(err) => {
            tracing::debug!(container = %container, error = %err, "Could not read container logs");
        }
    }
}

// Capture output, then stop and remove; used on the failure paths of `launch`.
async fn discard(runtime: &dyn ContainerRuntime, container: &ContainerHandle) -> String {
    let logs = runtime
        .logs(container)
        .await
        .map(|logs| logs.combined())
        .unwrap_or_default();
    if let Err(err) = runtime.stop(container).await {
        tracing::debug!(container = %container, error = %err, "Stop after failed launch");
    }
    if let Err(err) = runtime.remove(container).await {
        tracing::warn!(container = %container, error = %err, "Failed to remove container");
    }
    logs
}

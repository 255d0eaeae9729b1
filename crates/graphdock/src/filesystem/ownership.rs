//! Ownership changes the harness process cannot make itself.
//!
//! Files written by a containerized server belong to the container's user.
//! The [`ContainerOwnershipHelper`] re-owns them from inside a disposable
//! container that mounts each path onto itself.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use graphdock_common::settings::DEFAULT_HELPER_IMAGE;
use graphdock_common::{HarnessError, HarnessResult, OwnerSpec};

use crate::runtime::{self, ContainerRuntime, ContainerSpec, WaitStrategy};

/// The one place the harness needs elevated privilege.
#[async_trait]
pub trait OwnershipAuthority: Send + Sync {
    /// Recursively change the owner of every path.
    async fn chown_recursive(&self, owner: &OwnerSpec, paths: &[PathBuf]) -> HarnessResult<()>;

    /// Change the owner of each path independently and return the paths that failed.
    ///
    /// The default makes one [`chown_recursive`](Self::chown_recursive) call per path.
    async fn chown_each(&self, owner: &OwnerSpec, paths: &[PathBuf]) -> Vec<(PathBuf, HarnessError)> {
        let mut failures = Vec::new();
        for path in paths {
            if let Err(err) = self.chown_recursive(owner, std::slice::from_ref(path)).await {
                failures.push((path.clone(), err));
            }
        }
        failures
    }
}

/// [`OwnershipAuthority`] that runs `chown -R` in a helper container.
pub struct ContainerOwnershipHelper {
    runtime: Arc<dyn ContainerRuntime>,
    image: String,
    wait: WaitStrategy,
    startup_timeout: Duration,
}

impl ContainerOwnershipHelper {
    /// Helper using the default image, ready once it serves HTTP on port 80.
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            image: DEFAULT_HELPER_IMAGE.to_string(),
            wait: WaitStrategy::http(80, "/"),
            startup_timeout: ContainerSpec::DEFAULT_STARTUP_TIMEOUT,
        }
    }

    /// Use another image. It needs a shell and `chown`.
    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Use another readiness condition.
    #[must_use]
    pub fn with_wait(mut self, wait: WaitStrategy) -> Self {
        self.wait = wait;
        self
    }

    fn container_spec(&self, paths: &[PathBuf]) -> ContainerSpec {
        let mut spec = ContainerSpec::new(&self.image)
            .with_exposed_ports([80])
            .waiting_for(self.wait.clone(), self.startup_timeout);
        for path in paths {
            spec.bind_directory(path, path.display().to_string());
        }
        spec
    }
}

#[async_trait]
impl OwnershipAuthority for ContainerOwnershipHelper {
    async fn chown_recursive(&self, owner: &OwnerSpec, paths: &[PathBuf]) -> HarnessResult<()> {
        match self.chown_each(owner, paths).await.into_iter().next() {
            Some((_, err)) => Err(err),
            None => Ok(()),
        }
    }

    // One helper container for all paths; a failing path does not stop the rest.
    async fn chown_each(&self, owner: &OwnerSpec, paths: &[PathBuf]) -> Vec<(PathBuf, HarnessError)> {
        if paths.is_empty() {
            return Vec::new();
        }
        let paths = match paths.iter().map(std::path::absolute).collect::<Result<Vec<_>, _>>() {
            Ok(paths) => paths,
            Err(err) => return fail_all(paths, owner, &err.to_string()),
        };

        let helper = match runtime::launch(self.runtime.as_ref(), &self.container_spec(&paths)).await {
            Ok(helper) => helper,
            Err(err) => return fail_all(&paths, owner, &err.to_string()),
        };

        let mut failures = Vec::new();
        for path in &paths {
            tracing::info!(path = %path.display(), %owner, "Changing owner");
            let command = vec![
                "chown".to_string(),
                "-R".to_string(),
                owner.to_string(),
                path.display().to_string(),
            ];
            let message = match self.runtime.exec(&helper, &command).await {
                Ok(result) if result.success() => continue,
                Ok(result) => format!("chown exited with {}: {}", result.exit_code, result.stderr.trim()),
                Err(err) => err.to_string(),
            };
            tracing::warn!(path = %path.display(), %owner, %message, "Owner change failed");
            failures.push((path.clone(), ownership_error(path, owner, message)));
        }

        if let Err(err) = runtime::shutdown(self.runtime.as_ref(), &helper).await {
            tracing::warn!(container = %helper, error = %err, "Failed to stop ownership helper");
        }
        failures
    }
}

fn fail_all(paths: &[PathBuf], owner: &OwnerSpec, message: &str) -> Vec<(PathBuf, HarnessError)> {
    paths
        .iter()
        .map(|path| (path.clone(), ownership_error(path, owner, message.to_string())))
        .collect()
}

fn ownership_error(path: &Path, owner: &OwnerSpec, message: String) -> HarnessError {
    HarnessError::OwnershipChange {
        path: path.to_path_buf(),
        owner: owner.to_string(),
        message,
    }
}

//! Container creation requests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use graphdock_common::OwnerSpec;

use super::wait::WaitStrategy;

/// Bind mode of a volume binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    /// Read-write.
    ReadWrite,
    /// Read-only.
    ReadOnly,
}

impl BindMode {
    /// Mode suffix used in bind strings.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReadWrite => "rw",
            Self::ReadOnly => "ro",
        }
    }
}

/// What gets mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    /// A host directory, by absolute path.
    Directory(PathBuf),
    /// A named volume managed by the container engine.
    NamedVolume(String),
}

impl MountSource {
    /// Host directory, if this is a directory mount.
    #[must_use]
    pub fn as_directory(&self) -> Option<&Path> {
        match self {
            Self::Directory(path) => Some(path),
            Self::NamedVolume(_) => None,
        }
    }
}

/// A mount request: source, container mount point and mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    /// Mount source.
    pub source: MountSource,
    /// Mount point inside the container.
    pub target: String,
    /// Bind mode.
    pub mode: BindMode,
}

impl VolumeBinding {
    /// Render as an engine bind string, `source:target:mode`.
    #[must_use]
    pub fn to_bind_string(&self) -> String {
        let source = match &self.source {
            MountSource::Directory(path) => path.display().to_string(),
            MountSource::NamedVolume(name) => name.clone(),
        };
        format!("{source}:{}:{}", self.target, self.mode.as_str())
    }
}

/// Everything needed to create a container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Image reference.
    pub image: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Container ports published on random host ports.
    pub exposed_ports: Vec<u16>,
    /// Volume bindings.
    pub mounts: Vec<VolumeBinding>,
    /// Command override.
    pub command: Option<Vec<String>>,
    /// User (`uid:gid`) the container process runs as.
    pub user: Option<String>,
    /// Network mode, e.g. `host`.
    pub network_mode: Option<String>,
    /// Container labels.
    pub labels: BTreeMap<String, String>,
    /// Readiness condition checked after start.
    pub wait: WaitStrategy,
    /// Bound on the readiness wait.
    pub startup_timeout: Duration,
}

impl ContainerSpec {
    /// Default bound on the readiness wait.
    pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

    /// Create a spec for an image that is ready as soon as it runs.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            env: BTreeMap::new(),
            exposed_ports: Vec::new(),
            mounts: Vec::new(),
            command: None,
            user: None,
            network_mode: None,
            labels: BTreeMap::new(),
            wait: WaitStrategy::Running,
            startup_timeout: Self::DEFAULT_STARTUP_TIMEOUT,
        }
    }

    /// Set an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Publish container ports.
    #[must_use]
    pub fn with_exposed_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.exposed_ports.extend(ports);
        self
    }

    /// Override the image command.
    #[must_use]
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Some(command.into_iter().map(Into::into).collect());
        self
    }

    /// Run the container process as the given owner.
    #[must_use]
    pub fn with_user(mut self, user: &OwnerSpec) -> Self {
        self.user = Some(user.to_string());
        self
    }

    /// Set the network mode.
    #[must_use]
    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    /// Add a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set the readiness condition and its bound.
    #[must_use]
    pub fn waiting_for(mut self, wait: WaitStrategy, timeout: Duration) -> Self {
        self.wait = wait;
        self.startup_timeout = timeout;
        self
    }

    /// Bind a host directory read-write at `target`.
    pub fn bind_directory(&mut self, host: &Path, target: impl Into<String>) {
        self.mount(MountSource::Directory(host.to_path_buf()), target, BindMode::ReadWrite);
    }

    /// Bind a named volume read-write at `target`.
    pub fn bind_volume(&mut self, name: impl Into<String>, target: impl Into<String>) {
        self.mount(MountSource::NamedVolume(name.into()), target, BindMode::ReadWrite);
    }

    /// Add a mount.
    pub fn mount(&mut self, source: MountSource, target: impl Into<String>, mode: BindMode) {
        self.mounts.push(VolumeBinding {
            source,
            target: target.into(),
            mode,
        });
    }

    /// The mount bound at `target`, if any.
    #[must_use]
    pub fn mount_at(&self, target: &str) -> Option<&VolumeBinding> {
        self.mounts.iter().find(|m| m.target == target)
    }
}

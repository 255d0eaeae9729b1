//! Harness settings: which image is under test and where output goes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};
use crate::version::Version;

/// Default output root for test folders and their archives.
pub static DEFAULT_OUTPUT_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("GRAPHDOCK_OUTPUT_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("target/graphdock-output"))
});

/// Official image repository used for images other than the one under test.
pub const OFFICIAL_REPOSITORY: &str = "neo4j";

/// Image used for privileged ownership changes.
pub const DEFAULT_HELPER_IMAGE: &str = "nginx:latest";

/// Server edition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edition {
    /// Community edition.
    Community,
    /// Enterprise edition (backup/restore, clustering).
    Enterprise,
}

impl fmt::Display for Edition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Community => write!(f, "community"),
            Self::Enterprise => write!(f, "enterprise"),
        }
    }
}

impl FromStr for Edition {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "community" => Ok(Self::Community),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(HarnessError::Config {
                message: format!("unknown edition '{other}' (expected community or enterprise)"),
            }),
        }
    }
}

/// Settings file contents. Every field is optional; environment variables win.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsFile {
    /// Database image under test.
    pub image: Option<String>,
    /// Administration (backup/restore agent) image.
    pub admin_image: Option<String>,
    /// Version of the image under test.
    pub version: Option<Version>,
    /// Edition of the image under test.
    pub edition: Option<Edition>,
    /// Root for test folders.
    pub output_root: Option<PathBuf>,
    /// Startup timeout for database containers, in seconds.
    pub startup_timeout_secs: Option<u64>,
    /// Completion timeout for agent containers, in seconds.
    pub agent_timeout_secs: Option<u64>,
    /// Image used for privileged ownership changes.
    pub helper_image: Option<String>,
}

impl SettingsFile {
    /// Read a TOML settings file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> HarnessResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

/// Resolved harness settings.
#[derive(Debug, Clone)]
pub struct HarnessSettings {
    /// Database image under test.
    pub image: String,
    /// Administration (backup/restore agent) image.
    pub admin_image: Option<String>,
    /// Version of the image under test.
    pub version: Version,
    /// Edition of the image under test.
    pub edition: Edition,
    /// Root for test folders.
    pub output_root: PathBuf,
    /// Startup timeout for database containers.
    pub startup_timeout: Duration,
    /// Completion timeout for agent containers.
    pub agent_timeout: Duration,
    /// Image used for privileged ownership changes.
    pub helper_image: String,
}

impl HarnessSettings {
    /// Default startup timeout for database containers.
    pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);
    /// Default completion timeout for agent containers.
    pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(90);

    /// Settings for an image, deriving version and edition from its tag.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag does not contain a version.
    pub fn for_image(image: impl Into<String>) -> HarnessResult<Self> {
        let image = image.into();
        let version = Version::from_image_tag(&image)?;
        Ok(Self {
            edition: edition_from_tag(&image),
            version,
            image,
            admin_image: None,
            output_root: DEFAULT_OUTPUT_ROOT.clone(),
            startup_timeout: Self::DEFAULT_STARTUP_TIMEOUT,
            agent_timeout: Self::DEFAULT_AGENT_TIMEOUT,
            helper_image: DEFAULT_HELPER_IMAGE.to_string(),
        })
    }

    /// Load settings from an optional TOML file, then the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is invalid or no image is configured.
    pub fn load(config: Option<&Path>) -> HarnessResult<Self> {
        let file = match config {
            Some(path) => SettingsFile::from_path(path)?,
            None => SettingsFile::default(),
        };
        let settings = Self::resolve(file, |key| std::env::var(key).ok())?;
        tracing::debug!(
            image = %settings.image,
            version = %settings.version,
            edition = %settings.edition,
            output_root = %settings.output_root.display(),
            "Resolved harness settings"
        );
        Ok(settings)
    }

    /// Merge a settings file with variables from `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if no image is configured or a variable is malformed.
    pub fn resolve(
        file: SettingsFile,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> HarnessResult<Self> {
        let image = lookup("NEO4J_IMAGE")
            .or(file.image)
            .ok_or_else(|| HarnessError::Config {
                message: "no image under test; set NEO4J_IMAGE or `image` in the settings file"
                    .to_string(),
            })?;

        let version = match lookup("NEO4J_VERSION") {
            Some(raw) => Version::parse(&raw)?,
            None => match file.version {
                Some(version) => version,
                None => Version::from_image_tag(&image)?,
            },
        };

        let edition = match lookup("NEO4J_EDITION") {
            Some(raw) => raw.parse()?,
            None => file.edition.unwrap_or_else(|| edition_from_tag(&image)),
        };

        let secs = |key: &str, from_file: Option<u64>, default: Duration| -> HarnessResult<Duration> {
            match lookup(key) {
                Some(raw) => raw
                    .parse()
                    .map(Duration::from_secs)
                    .map_err(|_| HarnessError::Config {
                        message: format!("{key} must be a whole number of seconds, got '{raw}'"),
                    }),
                None => Ok(from_file.map_or(default, Duration::from_secs)),
            }
        };

        Ok(Self {
            admin_image: lookup("NEO4JADMIN_IMAGE").or(file.admin_image),
            output_root: lookup("GRAPHDOCK_OUTPUT_ROOT")
                .map(PathBuf::from)
                .or(file.output_root)
                .unwrap_or_else(|| DEFAULT_OUTPUT_ROOT.clone()),
            startup_timeout: secs(
                "GRAPHDOCK_STARTUP_TIMEOUT",
                file.startup_timeout_secs,
                Self::DEFAULT_STARTUP_TIMEOUT,
            )?,
            agent_timeout: secs(
                "GRAPHDOCK_AGENT_TIMEOUT",
                file.agent_timeout_secs,
                Self::DEFAULT_AGENT_TIMEOUT,
            )?,
            helper_image: lookup("GRAPHDOCK_HELPER_IMAGE")
                .or(file.helper_image)
                .unwrap_or_else(|| DEFAULT_HELPER_IMAGE.to_string()),
            image,
            version,
            edition,
        })
    }

    /// Set the output root.
    #[must_use]
    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = root.into();
        self
    }

    /// Set the administration image.
    #[must_use]
    pub fn with_admin_image(mut self, image: impl Into<String>) -> Self {
        self.admin_image = Some(image.into());
        self
    }

    /// Official image of another version in the same edition, e.g. an upgrade source.
    #[must_use]
    pub fn official_image(&self, version: &Version) -> String {
        match self.edition {
            Edition::Enterprise => format!("{OFFICIAL_REPOSITORY}:{version}-enterprise"),
            Edition::Community => format!("{OFFICIAL_REPOSITORY}:{version}"),
        }
    }
}

fn edition_from_tag(image: &str) -> Edition {
    if image.contains("enterprise") {
        Edition::Enterprise
    } else {
        Edition::Community
    }
}

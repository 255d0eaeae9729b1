//! In-place store upgrade across server versions.
//!
//! Data is written by an official image of an older version, the server is
//! stopped gracefully, and the image under test is started on the same
//! mounts with the upgrade flag set.

use std::fmt;

use graphdock_common::version::{V4_4_0, V5_0_0};
use graphdock_common::{HarnessError, HarnessResult, HarnessSettings, Setting, Version};

use super::neo4j::{self, DatabaseContainer};
use super::{ScenarioContext, ScenarioReport};
use crate::database::Credentials;
use crate::runtime::{self, ContainerSpec};

/// Password the upgrade servers are started with.
pub const UPGRADE_PASSWORD: &str = "verylongpassword";

/// Sources for targets before 5.0. 3.5.3 predates the 3.5.6 file permission changes.
pub static PRE5_UPGRADE_SOURCES: [Version; 5] = [
    Version::new(3, 5, 3),
    Version::new(3, 5, 7),
    Version::new(4, 0, 0),
    Version::new(4, 1, 0),
    Version::new(4, 4, 0),
];

/// Sources for 5.x targets.
pub static UPGRADE_SOURCES: [Version; 2] = [Version::new(5, 1, 0), Version::new(5, 2, 0)];

const FILE_MOUNTS: [(&str, &str); 4] = [
    ("data-", "/data"),
    ("logs-", "/logs"),
    ("import-", "/import"),
    ("metrics-", "/metrics"),
];

const VOLUME_MOUNTS: [(&str, &str); 6] = [
    ("conf", "/conf"),
    ("data", "/data"),
    ("import", "/import"),
    ("logs", "/logs"),
    ("metrics", "/metrics"),
    ("plugins", "/plugins"),
];

/// Upgrade phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradePhase {
    /// Old version started and the fixture written.
    PopulateOld,
    /// Old version stopped gracefully.
    StopOld,
    /// Target version started on the same mounts.
    StartNew,
    /// Fixture read back from the target version.
    VerifyNew,
}

impl fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PopulateOld => write!(f, "populate-old"),
            Self::StopOld => write!(f, "stop-old"),
            Self::StartNew => write!(f, "start-new"),
            Self::VerifyNew => write!(f, "verify-new"),
        }
    }
}

/// Where the server state lives between the two containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// Host folders under the output root.
    FileMounts,
    /// Engine-managed named volumes, removed afterwards.
    NamedVolumes,
}

/// Versions the target can be upgraded from.
#[must_use]
pub fn upgradable_versions(target: &Version) -> &'static [Version] {
    if target.is_older_than(&V5_0_0) {
        &PRE5_UPGRADE_SOURCES
    } else {
        &UPGRADE_SOURCES
    }
}

/// Check that upgrading `from` to `target` is meaningful on `arch`.
///
/// # Errors
///
/// Returns [`HarnessError::UnsupportedScenario`] if the target is not newer,
/// or if `arch` is ARM and `from` predates ARM images.
pub fn check_upgrade_supported(from: &Version, target: &Version, arch: &str) -> HarnessResult<()> {
    if !target.is_newer_than(from) {
        return Err(HarnessError::UnsupportedScenario {
            reason: format!("cannot upgrade from newer version {from} to {target}"),
        });
    }
    if arch == "aarch64" && !from.is_newer_than(&V4_4_0) {
        return Err(HarnessError::UnsupportedScenario {
            reason: format!("ARM images only exist after {V4_4_0}; cannot upgrade from {from}"),
        });
    }
    Ok(())
}

/// Populate `from`, stop it, start the image under test on the same storage
/// and verify the fixture survived.
///
/// # Errors
///
/// Returns [`HarnessError::UnsupportedScenario`] if the upgrade is not
/// supported here, a launch error if either server fails to start, or a
/// verification error if the fixture is missing after the upgrade.
pub async fn run_upgrade(
    ctx: ScenarioContext<'_>,
    from: &Version,
    storage: StorageKind,
) -> HarnessResult<ScenarioReport<UpgradePhase>> {
    let target = &ctx.settings.version;
    check_upgrade_supported(from, target, std::env::consts::ARCH)?;

    let credentials = Credentials::default_user(Some(UPGRADE_PASSWORD));
    let old_image = ctx.settings.official_image(from);
    let mut old_spec = neo4j::server_spec(ctx.settings, &old_image, &credentials);

    let volumes = match storage {
        StorageKind::FileMounts => {
            let parent = ctx
                .resources
                .create_directory(&format!("upgrade-{}{}-", from.major, from.minor))?;
            for (prefix, mount_point) in FILE_MOUNTS {
                ctx.resources
                    .create_and_bind_in(&mut old_spec, prefix, mount_point, &parent.path)?;
            }
            Vec::new()
        }
        StorageKind::NamedVolumes => {
            let id = ctx.resources.random_suffix();
            tracing::info!(%id, "Creating volumes");
            VOLUME_MOUNTS
                .iter()
                .map(|(name, mount_point)| {
                    let volume = format!("upgrade-{name}-{id}");
                    old_spec.bind_volume(volume.clone(), *mount_point);
                    volume
                })
                .collect()
        }
    };

    let new_spec = target_spec(ctx.settings, &old_spec, &credentials);

    let outcome = upgrade_phases(ctx, from, &old_spec, &new_spec, &credentials).await;

    for volume in &volumes {
        if let Err(err) = ctx.runtime.remove_volume(volume).await {
            tracing::warn!(%volume, error = %err, "Failed to remove volume");
        }
    }
    outcome
}

/// The image under test on the old server's mounts, with the upgrade flag set.
///
/// 5.x has no name for the flag; those images take it under the 4.x name.
fn target_spec(
    settings: &HarnessSettings,
    old_spec: &ContainerSpec,
    credentials: &Credentials,
) -> ContainerSpec {
    let mut spec = neo4j::server_spec(settings, &settings.image, credentials);
    spec.mounts.clone_from(&old_spec.mounts);
    let flag = Setting::AllowUpgrade
        .env_var_for(&settings.version)
        .or_else(|| Setting::AllowUpgrade.env_var_for(&V4_4_0));
    if let Some(var) = flag {
        spec.env.insert(var, "true".to_string());
    }
    spec
}

async fn upgrade_phases(
    ctx: ScenarioContext<'_>,
    from: &Version,
    old_spec: &ContainerSpec,
    new_spec: &ContainerSpec,
    credentials: &Credentials,
) -> HarnessResult<ScenarioReport<UpgradePhase>> {
    let mut report = ScenarioReport::new("upgrade");

    let old = neo4j::start_server(ctx.runtime, old_spec, from).await?;
    let populated = ctx.database_io(&old).put_initial_data(credentials).await;
    // Graceful stop so the old server flushes its store before the new one opens it.
    let stopped = runtime::shutdown(ctx.runtime, &old.handle).await;
    populated?;
    report.complete(UpgradePhase::PopulateOld);
    stopped?;
    report.complete(UpgradePhase::StopOld);

    let new = neo4j::start_server(ctx.runtime, new_spec, &ctx.settings.version).await?;
    report.complete(UpgradePhase::StartNew);

    verify_and_stop(ctx, &new, credentials).await?;
    report.complete(UpgradePhase::VerifyNew);
    Ok(report)
}

async fn verify_and_stop(
    ctx: ScenarioContext<'_>,
    db: &DatabaseContainer,
    credentials: &Credentials,
) -> HarnessResult<()> {
    let verified = ctx.database_io(db).verify_initial_data(credentials).await;
    if let Err(err) = runtime::shutdown(ctx.runtime, &db.handle).await {
        tracing::warn!(container = %db.handle, error = %err, "Failed to stop upgraded server");
    }
    verified
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_lists_follow_target_branch() {
        assert_eq!(upgradable_versions(&Version::new(4, 4, 9)).len(), 5);
        assert_eq!(
            upgradable_versions(&Version::new(5, 3, 0)),
            &[Version::new(5, 1, 0), Version::new(5, 2, 0)]
        );
    }

    #[test]
    fn target_must_be_strictly_newer() {
        let v51 = Version::new(5, 1, 0);
        assert!(check_upgrade_supported(&Version::new(4, 4, 0), &v51, "x86_64").is_ok());
        assert!(matches!(
            check_upgrade_supported(&v51, &v51, "x86_64"),
            Err(HarnessError::UnsupportedScenario { .. })
        ));
        assert!(check_upgrade_supported(&Version::new(5, 2, 0), &v51, "x86_64").is_err());
    }

    #[test]
    fn arm_window_starts_after_4_4() {
        let target = Version::new(5, 3, 0);
        assert!(check_upgrade_supported(&Version::new(4, 4, 0), &target, "aarch64").is_err());
        assert!(check_upgrade_supported(&Version::new(5, 1, 0), &target, "aarch64").is_ok());
        assert!(check_upgrade_supported(&Version::new(4, 4, 0), &target, "x86_64").is_ok());
    }

    #[test]
    fn upgrade_flag_is_set_for_every_target() {
        let credentials = Credentials::default_user(Some(UPGRADE_PASSWORD));
        let mut old_spec = ContainerSpec::new("neo4j:4.4.0");
        old_spec.bind_volume("upgrade-data-0001", "/data");

        let pre5 = HarnessSettings::for_image("neo4j:4.4.1-enterprise").unwrap();
        let spec = target_spec(&pre5, &old_spec, &credentials);
        assert_eq!(spec.image, "neo4j:4.4.1-enterprise");
        assert_eq!(spec.env.get("NEO4J_dbms_allow__upgrade").map(String::as_str), Some("true"));
        assert_eq!(spec.mounts, old_spec.mounts);

        let v5 = HarnessSettings::for_image("neo4j:5.1.0").unwrap();
        let spec = target_spec(&v5, &old_spec, &credentials);
        assert_eq!(spec.image, "neo4j:5.1.0");
        assert_eq!(spec.env.get("NEO4J_dbms_allow__upgrade").map(String::as_str), Some("true"));
        assert_eq!(spec.mounts, old_spec.mounts);
    }

    #[test]
    fn sources_are_older_than_their_targets() {
        for source in &PRE5_UPGRADE_SOURCES {
            assert!(Version::new(4, 4, 1).is_newer_than(source));
        }
        for source in &UPGRADE_SOURCES {
            assert!(Version::new(5, 3, 0).is_newer_than(source));
        }
    }
}

//! Online backup and restore through administration agent containers.

use std::fmt;
use std::path::Path;

use graphdock_common::version::V5_0_0;
use graphdock_common::{Edition, HarnessError, HarnessResult, HarnessSettings, OwnerSpec, Setting};

use super::neo4j::{self, BACKUP_PORT, DatabaseContainer};
use super::{ScenarioContext, ScenarioReport};
use crate::database::{Credentials, DatabaseIo, SYSTEM_DATABASE};
use crate::runtime::{self, ContainerState, ContainerSpec, WaitStrategy};

const BACKUP_COMPLETE: &str = "^Backup complete successful.*";
const RESTORE_COMPLETE: &str = "^.*restoreStatus=successful.*";

/// Backup/restore phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupPhase {
    /// Source started and the fixture written.
    PopulateSource,
    /// Backup agent finished.
    Backup,
    /// Source still running and unchanged.
    VerifySourceUnaffected,
    /// Second fixture written.
    MutateSource,
    /// Database stopped through the system database.
    StopSourceDb,
    /// Restore agent finished.
    Restore,
    /// Database started through the system database.
    StartSourceDb,
    /// Second fixture gone, first one present.
    VerifyMutationReverted,
}

impl fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PopulateSource => "populate-source",
            Self::Backup => "backup",
            Self::VerifySourceUnaffected => "verify-source-unaffected",
            Self::MutateSource => "mutate-source",
            Self::StopSourceDb => "stop-source-db",
            Self::Restore => "restore",
            Self::StartSourceDb => "start-source-db",
            Self::VerifyMutationReverted => "verify-mutation-reverted",
        };
        f.write_str(name)
    }
}

/// Variants of the backup/restore scenario.
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Run server and agents as the invoking user instead of the image default.
    pub as_current_user: bool,
    /// Server password; authentication is disabled when `None`.
    pub password: Option<String>,
}

/// Check that the image under test supports online backup.
///
/// # Errors
///
/// Returns [`HarnessError::UnsupportedScenario`] before 5.0 or outside Enterprise.
pub fn check_backup_supported(settings: &HarnessSettings) -> HarnessResult<()> {
    if settings.version.is_older_than(&V5_0_0) {
        return Err(HarnessError::UnsupportedScenario {
            reason: format!("admin images only exist from {V5_0_0}, testing {}", settings.version),
        });
    }
    if settings.edition != Edition::Enterprise {
        return Err(HarnessError::UnsupportedScenario {
            reason: "backup and restore are only available in Enterprise".to_string(),
        });
    }
    Ok(())
}

/// Administration image: the configured one, or the official one for the version.
#[must_use]
pub fn admin_image(settings: &HarnessSettings) -> String {
    settings
        .admin_image
        .clone()
        .unwrap_or_else(|| format!("neo4j/neo4j-admin:{}-enterprise", settings.version))
}

/// Back up a live server, change it, restore the backup and check the change is gone.
///
/// # Errors
///
/// Returns [`HarnessError::UnsupportedScenario`] if the image cannot do
/// backups, a launch or timeout error if a container does not start or an
/// agent does not report completion, or a verification error if the data is
/// wrong after any phase.
pub async fn run_backup_restore(
    ctx: ScenarioContext<'_>,
    options: &BackupOptions,
) -> HarnessResult<ScenarioReport<BackupPhase>> {
    check_backup_supported(ctx.settings)?;
    let settings = ctx.settings;
    let credentials = Credentials::default_user(options.password.as_deref());
    let user = options.as_current_user.then(OwnerSpec::current_user);

    let parent = ctx.resources.create_directory("backupRestore-")?;

    let mut db_spec = neo4j::server_spec(settings, &settings.image, &credentials)
        .with_exposed_ports([BACKUP_PORT]);
    for (setting, value) in [
        (Setting::BackupEnabled, "true".to_string()),
        (Setting::BackupListenAddress, format!("0.0.0.0:{BACKUP_PORT}")),
    ] {
        if let Some(var) = setting.env_var_for(&settings.version) {
            db_spec.env.insert(var, value);
        }
    }
    if let Some(user) = &user {
        db_spec = db_spec.with_user(user);
    }
    let data_dir = ctx
        .resources
        .create_and_bind_in(&mut db_spec, "data-", "/data", &parent.path)?;

    let db = neo4j::start_server(ctx.runtime, &db_spec, &settings.version).await?;
    let mut report = ScenarioReport::new("backup-restore");
    let outcome = backup_phases(
        ctx,
        &db,
        &parent.path,
        &data_dir.path,
        &credentials,
        user.as_ref(),
        &mut report,
    )
    .await;
    if let Err(err) = runtime::shutdown(ctx.runtime, &db.handle).await {
        tracing::warn!(container = %db.handle, error = %err, "Failed to stop database");
    }
    outcome.map(|()| report)
}

#[allow(clippy::too_many_arguments)]
async fn backup_phases(
    ctx: ScenarioContext<'_>,
    db: &DatabaseContainer,
    parent: &Path,
    data_dir: &Path,
    credentials: &Credentials,
    user: Option<&OwnerSpec>,
    report: &mut ScenarioReport<BackupPhase>,
) -> HarnessResult<()> {
    let io = ctx.database_io(db);
    io.put_initial_data(credentials).await?;
    io.verify_initial_data(credentials).await?;
    report.complete(BackupPhase::PopulateSource);

    let backup_from = format!(
        "{}:{}",
        ctx.runtime.host(),
        ctx.runtime.mapped_port(&db.handle, BACKUP_PORT).await?
    );
    let mut backup_spec = agent_spec(ctx.settings, user, BACKUP_COMPLETE)
        .with_network_mode("host")
        .with_command([
            "neo4j-admin".to_string(),
            "database".to_string(),
            "backup-legacy".to_string(),
            "--database=neo4j".to_string(),
            "--backup-dir=/backups".to_string(),
            format!("--from={backup_from}"),
        ]);
    let backup_dir = ctx
        .resources
        .create_and_bind_in(&mut backup_spec, "backup-", "/backups", parent)?;
    let agent = runtime::launch(ctx.runtime, &backup_spec).await?;
    report.complete(BackupPhase::Backup);

    let unaffected = verify_source_unaffected(ctx, db, &io, credentials).await;
    if let Err(err) = runtime::shutdown(ctx.runtime, &agent).await {
        tracing::warn!(container = %agent, error = %err, "Failed to stop backup agent");
    }
    unaffected?;
    report.complete(BackupPhase::VerifySourceUnaffected);

    io.put_more_data(credentials).await?;
    io.verify_more_data(credentials, true).await?;
    report.complete(BackupPhase::MutateSource);

    // The restore agent must not write into a data directory the server has open.
    io.run_query(credentials, "STOP DATABASE neo4j", Some(SYSTEM_DATABASE))
        .await?;
    report.complete(BackupPhase::StopSourceDb);

    let mut restore_spec = agent_spec(ctx.settings, user, RESTORE_COMPLETE).with_command([
        "neo4j-admin",
        "database",
        "restore-legacy",
        "--database=neo4j",
        "--from=/backups/neo4j",
        "--force",
    ]);
    ctx.resources
        .bind_directory(&mut restore_spec, &backup_dir.path, "/backups");
    ctx.resources.bind_directory(&mut restore_spec, data_dir, "/data");
    let agent = runtime::launch(ctx.runtime, &restore_spec).await?;
    if let Err(err) = runtime::shutdown(ctx.runtime, &agent).await {
        tracing::warn!(container = %agent, error = %err, "Failed to stop restore agent");
    }
    report.complete(BackupPhase::Restore);

    io.run_query(credentials, "START DATABASE neo4j", Some(SYSTEM_DATABASE))
        .await?;
    report.complete(BackupPhase::StartSourceDb);

    io.verify_more_data(credentials, false).await?;
    io.verify_initial_data(credentials).await?;
    report.complete(BackupPhase::VerifyMutationReverted);
    Ok(())
}

async fn verify_source_unaffected(
    ctx: ScenarioContext<'_>,
    db: &DatabaseContainer,
    io: &DatabaseIo<'_>,
    credentials: &Credentials,
) -> HarnessResult<()> {
    let state = ctx.runtime.state(&db.handle).await?;
    if state != ContainerState::Running {
        return Err(HarnessError::Verification {
            message: "database container should still be running after backup".to_string(),
            output: Some(format!("{state:?}")),
        });
    }
    io.verify_initial_data(credentials).await
}

fn agent_spec(settings: &HarnessSettings, user: Option<&OwnerSpec>, completion: &str) -> ContainerSpec {
    let spec = ContainerSpec::new(admin_image(settings))
        .with_env("NEO4J_ACCEPT_LICENSE_AGREEMENT", "yes")
        .waiting_for(WaitStrategy::log_message(completion), settings.agent_timeout);
    match user {
        Some(user) => spec.with_user(user),
        None => spec,
    }
}

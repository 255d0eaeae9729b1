//! Multi-phase container workflows.
//!
//! Every phase runs to completion before the next begins. A scenario
//! returns a [`ScenarioReport`] listing the phases it completed; the first
//! failing phase ends the scenario with its error.

mod backup;
mod mounts;
pub mod neo4j;
mod upgrade;

use std::fmt;

use chrono::{DateTime, Utc};
use graphdock_common::HarnessSettings;

use crate::database::{DatabaseIo, GraphConnector};
use crate::filesystem::ResourceManager;
use crate::runtime::ContainerRuntime;

pub use backup::{BackupOptions, BackupPhase, admin_image, check_backup_supported, run_backup_restore};
pub use mounts::{MountProbeOutcome, MountProbePhase, probe_unwritable_mount};
pub use neo4j::DatabaseContainer;
pub use upgrade::{
    PRE5_UPGRADE_SOURCES, StorageKind, UPGRADE_SOURCES, UpgradePhase, check_upgrade_supported,
    run_upgrade, upgradable_versions,
};

/// Collaborators a scenario runs against.
#[derive(Clone, Copy)]
pub struct ScenarioContext<'a> {
    /// Container engine.
    pub runtime: &'a dyn ContainerRuntime,
    /// Database client.
    pub connector: &'a dyn GraphConnector,
    /// Test folder manager.
    pub resources: &'a ResourceManager,
    /// Image under test and timeouts.
    pub settings: &'a HarnessSettings,
}

impl<'a> ScenarioContext<'a> {
    /// Fixture access for a running database container.
    #[must_use]
    pub fn database_io(&self, db: &DatabaseContainer) -> DatabaseIo<'a> {
        DatabaseIo::new(self.connector, db.endpoint.clone(), db.version.clone())
    }
}

/// A phase and when it finished.
#[derive(Debug, Clone)]
pub struct CompletedPhase<P> {
    /// The phase.
    pub phase: P,
    /// Completion time.
    pub finished_at: DateTime<Utc>,
}

/// Phases a scenario completed, in order.
#[derive(Debug, Clone)]
pub struct ScenarioReport<P> {
    /// Scenario name.
    pub scenario: &'static str,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Completed phases.
    pub phases: Vec<CompletedPhase<P>>,
}

impl<P: Copy + fmt::Display> ScenarioReport<P> {
    pub(crate) fn new(scenario: &'static str) -> Self {
        tracing::info!(scenario, "Scenario started");
        Self {
            scenario,
            started_at: Utc::now(),
            phases: Vec::new(),
        }
    }

    pub(crate) fn complete(&mut self, phase: P) {
        tracing::info!(scenario = self.scenario, %phase, "Phase complete");
        self.phases.push(CompletedPhase {
            phase,
            finished_at: Utc::now(),
        });
    }

    /// The completed phases without timestamps.
    #[must_use]
    pub fn completed(&self) -> Vec<P> {
        self.phases.iter().map(|p| p.phase).collect()
    }
}

impl<P: fmt::Display> fmt::Display for ScenarioReport<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} (started {})", self.scenario, self.started_at.to_rfc3339())?;
        for completed in &self.phases {
            writeln!(f, "  {:<28} {}", completed.phase.to_string(), completed.finished_at.to_rfc3339())?;
        }
        Ok(())
    }
}

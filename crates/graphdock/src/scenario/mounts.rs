//! A server must refuse a data mount it cannot write.

use std::fmt;

use graphdock_common::{HarnessError, HarnessResult, OwnerSpec};

use super::neo4j;
use super::{ScenarioContext, ScenarioReport};
use crate::database::Credentials;
use crate::runtime;

const REFUSAL_MARKERS: [&str; 2] = ["not accessible", "permission denied"];

/// Unwritable-mount probe phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountProbePhase {
    /// Data folder created and handed to a foreign owner.
    PrepareMount,
    /// The server refused to start on it.
    ExpectRefusal,
}

impl fmt::Display for MountProbePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrepareMount => write!(f, "prepare-mount"),
            Self::ExpectRefusal => write!(f, "expect-refusal"),
        }
    }
}

/// Result of a probe where the server refused the mount.
#[derive(Debug, Clone)]
pub struct MountProbeOutcome {
    /// Completed phases.
    pub report: ScenarioReport<MountProbePhase>,
    /// What the server printed when it refused.
    pub error_output: String,
}

/// Start a server as a non-root user on a `/data` folder owned by someone else.
///
/// # Errors
///
/// Returns a [`HarnessError::Verification`] if the server starts anyway or
/// fails without reporting a permission problem. Folder and ownership
/// errors are returned as they are.
pub async fn probe_unwritable_mount(ctx: ScenarioContext<'_>) -> HarnessResult<MountProbeOutcome> {
    let current = OwnerSpec::current_user();
    let container_user = if current.is_root() {
        OwnerSpec::Ids { uid: 1000, gid: 1000 }
    } else {
        current
    };
    let owner = foreign_owner(&container_user);

    let mut report = ScenarioReport::new("unwritable-mount");
    let mut spec = neo4j::server_spec(ctx.settings, &ctx.settings.image, &Credentials::None)
        .with_user(&container_user);
    let data = ctx.resources.create_and_bind(&mut spec, "data-", "/data")?;
    ctx.resources.reassign_owner(&owner, &[data.path()]).await?;
    tracing::info!(%owner, user = %container_user, "Mount handed to another owner");
    report.complete(MountProbePhase::PrepareMount);

    match runtime::launch(ctx.runtime, &spec).await {
        Ok(handle) => {
            if let Err(err) = runtime::shutdown(ctx.runtime, &handle).await {
                tracing::warn!(container = %handle, error = %err, "Failed to stop server");
            }
            Err(HarnessError::verification(format!(
                "container started as {container_user} despite /data owned by {owner}"
            )))
        }
        Err(err) => {
            let Some(logs) = err.container_logs() else {
                return Err(err);
            };
            if !is_refusal(logs) {
                return Err(HarnessError::Verification {
                    message: "server failed without a permission error".to_string(),
                    output: Some(logs.to_string()),
                });
            }
            let error_output = logs.to_string();
            report.complete(MountProbePhase::ExpectRefusal);
            Ok(MountProbeOutcome {
                report,
                error_output,
            })
        }
    }
}

// An owner guaranteed to differ from `user`.
fn foreign_owner(user: &OwnerSpec) -> OwnerSpec {
    match user {
        OwnerSpec::Ids { uid, gid } if *user == OwnerSpec::NEO4J => OwnerSpec::Ids {
            uid: uid + 1,
            gid: gid + 1,
        },
        _ => OwnerSpec::NEO4J,
    }
}

fn is_refusal(output: &str) -> bool {
    let output = output.to_lowercase();
    REFUSAL_MARKERS.iter().any(|marker| output.contains(marker))
}

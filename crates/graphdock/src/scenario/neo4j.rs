//! Database server containers.

use graphdock_common::{HarnessResult, HarnessSettings, Version};

use crate::database::{Credentials, Endpoint};
use crate::runtime::{self, ContainerHandle, ContainerRuntime, ContainerSpec, WaitStrategy};

/// HTTP connector port.
pub const HTTP_PORT: u16 = 7474;
/// Bolt connector port.
pub const BOLT_PORT: u16 = 7687;
/// Online backup port.
pub const BACKUP_PORT: u16 = 6362;

/// Line the server logs once it accepts connections.
pub const READY_PATTERN: &str = r"Started\.";

/// A running database server.
#[derive(Debug, Clone)]
pub struct DatabaseContainer {
    /// The container.
    pub handle: ContainerHandle,
    /// Where its HTTP connector is reachable.
    pub endpoint: Endpoint,
    /// Server version.
    pub version: Version,
}

/// Spec for a server container of `image` with the given credentials.
#[must_use]
pub fn server_spec(settings: &HarnessSettings, image: &str, credentials: &Credentials) -> ContainerSpec {
    ContainerSpec::new(image)
        .with_env("NEO4J_AUTH", credentials.auth_env())
        .with_env("NEO4J_ACCEPT_LICENSE_AGREEMENT", "yes")
        .with_exposed_ports([HTTP_PORT, BOLT_PORT])
        .waiting_for(WaitStrategy::log_message(READY_PATTERN), settings.startup_timeout)
}

/// Launch a server container and resolve its endpoint.
///
/// # Errors
///
/// Returns a launch error if the server does not start, or a runtime error
/// if its HTTP port is not published.
pub async fn start_server(
    runtime: &dyn ContainerRuntime,
    spec: &ContainerSpec,
    version: &Version,
) -> HarnessResult<DatabaseContainer> {
    let handle = runtime::launch(runtime, spec).await?;
    let http_port = match runtime.mapped_port(&handle, HTTP_PORT).await {
        Ok(port) => port,
        Err(err) => {
            if let Err(stop) = runtime::shutdown(runtime, &handle).await {
                tracing::warn!(container = %handle, error = %stop, "Failed to stop server");
            }
            return Err(err);
        }
    };
    Ok(DatabaseContainer {
        endpoint: Endpoint {
            host: runtime.host(),
            http_port,
        },
        handle,
        version: version.clone(),
    })
}

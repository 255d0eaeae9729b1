//! # graphdock
//!
//! Verification harness for containerized graph database deployments.
//!
//! The harness starts database servers in containers, binds host folders or
//! named volumes into them, drives data through the server and checks it
//! survives operations such as version upgrades and backup/restore cycles.
//!
//! ## Layers
//!
//! - [`runtime`]: container engine abstraction, Docker backend and readiness waits
//! - [`filesystem`]: test folders, teardown archives and privileged ownership changes
//! - [`database`]: database client abstraction, HTTP client and data fixtures
//! - [`scenario`]: multi-phase workflows built on the layers above
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use graphdock::database::HttpGraphConnector;
//! use graphdock::filesystem::{ContainerOwnershipHelper, ResourceManager};
//! use graphdock::runtime::{ContainerRuntime, DockerRuntime};
//! use graphdock::scenario::{self, ScenarioContext, StorageKind};
//! use graphdock_common::{HarnessSettings, Version};
//!
//! # async fn example() -> graphdock_common::HarnessResult<()> {
//! let settings = HarnessSettings::for_image("neo4j:5.2.0")?;
//! let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect()?);
//! let helper = ContainerOwnershipHelper::new(Arc::clone(&runtime));
//! let resources = ResourceManager::new(&settings.output_root, Arc::new(helper))?;
//! let connector = HttpGraphConnector::new(settings.version.clone());
//!
//! let ctx = ScenarioContext {
//!     runtime: runtime.as_ref(),
//!     connector: &connector,
//!     resources: &resources,
//!     settings: &settings,
//! };
//! let from = Version::new(5, 1, 0);
//! let report = resources
//!     .scoped(scenario::run_upgrade(ctx, &from, StorageKind::FileMounts))
//!     .await?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod database;
pub mod filesystem;
pub mod runtime;
pub mod scenario;

pub use filesystem::ResourceManager;
pub use runtime::{ContainerRuntime, DockerRuntime};

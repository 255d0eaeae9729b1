//! Host folders shared with containers.
//!
//! This module handles:
//! - Creating and registering uniquely named test folders
//! - Archiving them to tar.gz at teardown
//! - Ownership changes through a helper container

pub mod archive;
mod folders;
mod ownership;

pub use archive::{ArchiveOutcome, SkippedEntry, archive_directory};
pub use folders::{
    ManagedDirectory, ResourceManager, TeardownFailure, TeardownReport, TeardownStage,
};
pub use ownership::{ContainerOwnershipHelper, OwnershipAuthority};

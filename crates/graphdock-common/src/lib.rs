//! # graphdock-common
//!
//! Shared types for the graphdock verification harness.
//!
//! This crate provides the pieces every other graphdock crate leans on:
//! - Label-insensitive server version comparison
//! - Harness settings (image under test, edition, output root, timeouts)
//! - File owner specifications for privileged ownership changes
//! - Versioned server configuration keys and their environment encoding
//! - Run ids and the common error type

#![warn(missing_docs)]

pub mod conf;
pub mod error;
pub mod id;
pub mod owner;
pub mod settings;
pub mod version;

pub use conf::Setting;
pub use error::{HarnessError, HarnessResult};
pub use id::RunId;
pub use owner::OwnerSpec;
pub use settings::{Edition, HarnessSettings};
pub use version::Version;

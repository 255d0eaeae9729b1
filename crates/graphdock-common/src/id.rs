//! Harness run ids.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one harness run.
///
/// Every container the harness creates is labelled with the run id so that
/// leftovers from a crashed run can be found with `docker ps --filter label=...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Label key carrying the run id on created containers.
    pub const LABEL: &'static str = "io.graphdock.run";

    /// Generate a new random run id.
    ///
    /// The id is a 12-character hex string derived from a UUID v4.
    #[must_use]
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        Self(hex::encode(&uuid.as_bytes()[..6]))
    }

    /// Get the run id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

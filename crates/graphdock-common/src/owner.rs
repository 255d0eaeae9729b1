//! File owner specifications.

use std::fmt;
use std::str::FromStr;

use crate::error::HarnessError;

/// An owner passed to `chown -R`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OwnerSpec {
    /// Numeric user and group ids.
    Ids {
        /// User id.
        uid: u32,
        /// Group id.
        gid: u32,
    },
    /// A symbolic user (optionally `user:group`) resolved inside the helper container.
    Name(String),
}

impl OwnerSpec {
    /// The uid/gid the database image runs its server process as.
    pub const NEO4J: Self = Self::Ids {
        uid: 7474,
        gid: 7474,
    };

    /// The user running the harness.
    #[must_use]
    pub fn current_user() -> Self {
        Self::Ids {
            uid: rustix::process::getuid().as_raw(),
            gid: rustix::process::getgid().as_raw(),
        }
    }

    /// True if this is the root user.
    #[must_use]
    pub fn is_root(&self) -> bool {
        match self {
            Self::Ids { uid, .. } => *uid == 0,
            Self::Name(name) => name == "root" || name.starts_with("root:"),
        }
    }
}

impl fmt::Display for OwnerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ids { uid, gid } => write!(f, "{uid}:{gid}"),
            Self::Name(name) => write!(f, "{name}"),
        }
    }
}

impl FromStr for OwnerSpec {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(HarnessError::Config {
                message: "owner must not be empty".to_string(),
            });
        }
        if let Some((uid, gid)) = s.split_once(':') {
            if let (Ok(uid), Ok(gid)) = (uid.parse(), gid.parse()) {
                return Ok(Self::Ids { uid, gid });
            }
        }
        Ok(Self::Name(s.to_string()))
    }
}

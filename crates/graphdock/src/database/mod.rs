//! Database client abstraction.
//!
//! Scenarios talk to the server through [`GraphConnector`] and
//! [`GraphSession`]; [`HttpGraphConnector`] is the production client and
//! [`DatabaseIo`] wraps the fixture queries.

mod fixtures;
mod http;

use std::fmt;

use async_trait::async_trait;
use graphdock_common::{HarnessError, HarnessResult};
use serde_json::Value;

pub use fixtures::DatabaseIo;
pub use http::HttpGraphConnector;

/// Database holding system-level administration commands.
pub const SYSTEM_DATABASE: &str = "system";

/// Default user of the server image.
pub const DEFAULT_USER: &str = "neo4j";

/// How to authenticate.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Authentication disabled.
    None,
    /// Basic authentication.
    Basic {
        /// User name.
        user: String,
        /// Password.
        password: String,
    },
}

impl Credentials {
    /// Credentials for the default user, or none when `password` is `None`.
    #[must_use]
    pub fn default_user(password: Option<&str>) -> Self {
        password.map_or(Self::None, |password| Self::Basic {
            user: DEFAULT_USER.to_string(),
            password: password.to_string(),
        })
    }

    /// Value of the server's `NEO4J_AUTH` variable for these credentials.
    #[must_use]
    pub fn auth_env(&self) -> String {
        match self {
            Self::None => "none".to_string(),
            Self::Basic { user, password } => format!("{user}/{password}"),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Basic { user, .. } => write!(f, "Basic({user}, ***)"),
        }
    }
}

/// Where the server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or address.
    pub host: String,
    /// Host port mapped to the server's HTTP connector.
    pub http_port: u16,
}

/// Update counters reported by a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStats {
    /// Nodes created.
    pub nodes_created: u64,
    /// Nodes deleted.
    pub nodes_deleted: u64,
    /// Relationships created.
    pub relationships_created: u64,
}

/// Rows returned by a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Column names.
    pub columns: Vec<String>,
    /// Rows, one value per column.
    pub rows: Vec<Vec<Value>>,
    /// Update counters.
    pub stats: QueryStats,
}

impl QueryResult {
    /// The only value of a single-row, single-column result.
    ///
    /// # Errors
    ///
    /// Returns a verification error if the result has another shape.
    pub fn single(&self) -> HarnessResult<&Value> {
        match self.rows.as_slice() {
            [row] if row.len() == 1 => Ok(&row[0]),
            rows => Err(HarnessError::Verification {
                message: format!("expected a single value, got {} rows", rows.len()),
                output: Some(format!("{:?}", self.rows)),
            }),
        }
    }
}

/// An open connection to the server.
#[async_trait]
pub trait GraphSession: Send + Sync {
    /// Run `query` against `database`, or the default database if `None`.
    async fn run(&self, database: Option<&str>, query: &str) -> HarnessResult<QueryResult>;

    /// Close the session.
    async fn close(&self) -> HarnessResult<()>;
}

/// Opens sessions.
#[async_trait]
pub trait GraphConnector: Send + Sync {
    /// Connect and authenticate.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> HarnessResult<Box<dyn GraphSession>>;
}

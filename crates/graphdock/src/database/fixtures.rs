//! Known data written and read back across container lifecycles.

use graphdock_common::version::V4_0_0;
use graphdock_common::{HarnessError, HarnessResult, Version};
use serde_json::Value;

use super::{Credentials, Endpoint, GraphConnector, QueryResult, SYSTEM_DATABASE};

/// Fixture queries against one server.
///
/// Every call opens its own session, so calls survive server restarts.
pub struct DatabaseIo<'a> {
    connector: &'a dyn GraphConnector,
    endpoint: Endpoint,
    version: Version,
}

impl<'a> DatabaseIo<'a> {
    /// Writes the initial fixture, two dogs, one sniffing the other.
    pub const PUT_INITIAL_DATA: &'static str =
        "CREATE (arne:dog {name:'Arne'})-[:SNIFFS]->(bosse:dog {name:'Bosse'}) RETURN arne.name";
    /// Reads the initial fixture back.
    pub const VERIFY_INITIAL_DATA: &'static str = "MATCH (a:dog)-[:SNIFFS]->(b:dog) RETURN a.name";
    /// Writes the second fixture.
    pub const PUT_MORE_DATA: &'static str = "CREATE (:extra {name:'extra node'})";
    /// Counts second-fixture nodes.
    pub const VERIFY_MORE_DATA: &'static str = "MATCH (n:extra) RETURN count(n)";

    const CREATE_NODE: &'static str = "CREATE (node:createAndDeleteNode {val:1}) RETURN node.val";
    const DELETE_NODE: &'static str =
        "MATCH (node:createAndDeleteNode {val:1}) WITH node LIMIT 2 DETACH DELETE node";

    /// Fixture access for the server at `endpoint`.
    pub fn new(connector: &'a dyn GraphConnector, endpoint: Endpoint, version: Version) -> Self {
        Self {
            connector,
            endpoint,
            version,
        }
    }

    /// Run `query` on `database` (default database if `None`).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the query fails.
    pub async fn run_query(
        &self,
        credentials: &Credentials,
        query: &str,
        database: Option<&str>,
    ) -> HarnessResult<QueryResult> {
        let session = self.connector.connect(&self.endpoint, credentials).await?;
        let result = session.run(database, query).await;
        if let Err(err) = session.close().await {
            tracing::debug!(error = %err, "Closing session failed");
        }
        result
    }

    /// Check that the server accepts the credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be reached or rejects the credentials.
    pub async fn verify_connectivity(&self, credentials: &Credentials) -> HarnessResult<()> {
        let session = self.connector.connect(&self.endpoint, credentials).await?;
        session.close().await
    }

    /// Write the initial fixture.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or returns something unexpected.
    pub async fn put_initial_data(&self, credentials: &Credentials) -> HarnessResult<()> {
        let result = self.run_query(credentials, Self::PUT_INITIAL_DATA, None).await?;
        expect_value(&result, &Value::from("Arne"), "initial data was not written")
    }

    /// Check the initial fixture is present.
    ///
    /// # Errors
    ///
    /// Returns a verification error if it is missing.
    pub async fn verify_initial_data(&self, credentials: &Credentials) -> HarnessResult<()> {
        let result = self.run_query(credentials, Self::VERIFY_INITIAL_DATA, None).await?;
        expect_value(&result, &Value::from("Arne"), "initial data is missing")
    }

    /// Write the second fixture.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn put_more_data(&self, credentials: &Credentials) -> HarnessResult<()> {
        self.run_query(credentials, Self::PUT_MORE_DATA, None).await?;
        Ok(())
    }

    /// Check the second fixture is present (`expected`) or absent.
    ///
    /// # Errors
    ///
    /// Returns a verification error if it is not.
    pub async fn verify_more_data(&self, credentials: &Credentials, expected: bool) -> HarnessResult<()> {
        let result = self.run_query(credentials, Self::VERIFY_MORE_DATA, None).await?;
        let count = u64::from(expected);
        let message = if expected {
            "extra node is missing"
        } else {
            "extra node still present after restore"
        };
        expect_value(&result, &Value::from(count), message)
    }

    /// Create a node and delete it again.
    ///
    /// # Errors
    ///
    /// Returns a verification error if either step reports an unexpected result.
    pub async fn create_and_delete_node(&self, credentials: &Credentials) -> HarnessResult<()> {
        let created = self.run_query(credentials, Self::CREATE_NODE, None).await?;
        expect_value(&created, &Value::from(1), "CREATE did not return the node")?;
        let deleted = self.run_query(credentials, Self::DELETE_NODE, None).await?;
        if deleted.stats.nodes_deleted != 1 {
            return Err(HarnessError::Verification {
                message: format!("expected 1 node deleted, got {}", deleted.stats.nodes_deleted),
                output: None,
            });
        }
        Ok(())
    }

    /// Change the password of the connected user.
    ///
    /// # Errors
    ///
    /// Returns an error if the server rejects the change.
    pub async fn change_password(
        &self,
        user: &str,
        old_password: &str,
        new_password: &str,
    ) -> HarnessResult<()> {
        let credentials = Credentials::Basic {
            user: user.to_string(),
            password: old_password.to_string(),
        };
        let query = change_password_query(&self.version, old_password, new_password);
        let database = self
            .version
            .is_at_least(&V4_0_0)
            .then_some(SYSTEM_DATABASE);
        self.run_query(&credentials, &query, database).await?;
        tracing::info!(user, "Changed password");
        Ok(())
    }
}

fn change_password_query(version: &Version, old_password: &str, new_password: &str) -> String {
    if version.is_at_least(&V4_0_0) {
        format!("ALTER CURRENT USER SET PASSWORD FROM '{old_password}' TO '{new_password}'")
    } else {
        format!("CALL dbms.changePassword('{new_password}')")
    }
}

fn expect_value(result: &QueryResult, expected: &Value, message: &str) -> HarnessResult<()> {
    match result.single() {
        Ok(value) if value == expected => Ok(()),
        _ => Err(HarnessError::Verification {
            message: format!("{message} (expected {expected})"),
            output: Some(format!("{:?}", result.rows)),
        }),
    }
}

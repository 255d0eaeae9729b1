//! Client for the server's transactional HTTP endpoint.

use async_trait::async_trait;
use graphdock_common::version::V4_0_0;
use graphdock_common::{HarnessError, HarnessResult, Version};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{Credentials, Endpoint, GraphConnector, GraphSession, QueryResult, QueryStats};

/// Database used when a query names none.
const DEFAULT_DATABASE: &str = "neo4j";

/// [`GraphConnector`] speaking the transactional HTTP API.
#[derive(Debug, Clone)]
pub struct HttpGraphConnector {
    client: reqwest::Client,
    version: Version,
}

impl HttpGraphConnector {
    /// Connector for a server of the given version.
    #[must_use]
    pub fn new(version: Version) -> Self {
        Self {
            client: reqwest::Client::new(),
            version,
        }
    }
}

#[async_trait]
impl GraphConnector for HttpGraphConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> HarnessResult<Box<dyn GraphSession>> {
        let session = HttpSession {
            client: self.client.clone(),
            base: format!("http://{}:{}", endpoint.host, endpoint.http_port),
            credentials: credentials.clone(),
            version: self.version.clone(),
        };
        session.run(None, "RETURN 1").await?;
        tracing::debug!(base = %session.base, "Connected to database");
        Ok(Box::new(session))
    }
}

struct HttpSession {
    client: reqwest::Client,
    base: String,
    credentials: Credentials,
    version: Version,
}

#[async_trait]
impl GraphSession for HttpSession {
    async fn run(&self, database: Option<&str>, query: &str) -> HarnessResult<QueryResult> {
        let url = format!("{}{}", self.base, commit_path(&self.version, database));
        let body = json!({
            "statements": [{ "statement": query, "includeStats": true }]
        });
        tracing::debug!(%url, query, "Running query");

        let mut request = self.client.post(&url).json(&body);
        if let Credentials::Basic { user, password } = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }
        let response = request.send().await.map_err(database_error)?;
        let status = response.status();
        let text = response.text().await.map_err(database_error)?;
        if !status.is_success() {
            return Err(HarnessError::Database {
                message: format!("{url} returned {status}: {text}"),
            });
        }
        parse_response(&text)
    }

    async fn close(&self) -> HarnessResult<()> {
        Ok(())
    }
}

/// Commit endpoint for a database. Servers before 4.0 have a single database.
fn commit_path(version: &Version, database: Option<&str>) -> String {
    if version.is_at_least(&V4_0_0) {
        format!("/db/{}/tx/commit", database.unwrap_or(DEFAULT_DATABASE))
    } else {
        "/db/data/transaction/commit".to_string()
    }
}

#[derive(Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<TxResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Deserialize)]
struct TxResult {
    columns: Vec<String>,
    data: Vec<TxRow>,
    #[serde(default)]
    stats: Option<TxStats>,
}

#[derive(Deserialize)]
struct TxRow {
    row: Vec<Value>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct TxStats {
    nodes_created: u64,
    nodes_deleted: u64,
    relationships_created: u64,
}

#[derive(Deserialize)]
struct TxError {
    code: String,
    message: String,
}

fn parse_response(body: &str) -> HarnessResult<QueryResult> {
    let response: TxResponse = serde_json::from_str(body)?;
    if let Some(error) = response.errors.first() {
        return Err(HarnessError::Database {
            message: format!("{}: {}", error.code, error.message),
        });
    }
    let Some(result) = response.results.into_iter().next() else {
        return Ok(QueryResult::default());
    };
    let stats = result.stats.unwrap_or_default();
    Ok(QueryResult {
        columns: result.columns,
        rows: result.data.into_iter().map(|r| r.row).collect(),
        stats: QueryStats {
            nodes_created: stats.nodes_created,
            nodes_deleted: stats.nodes_deleted,
            relationships_created: stats.relationships_created,
        },
    })
}

fn database_error(err: reqwest::Error) -> HarnessError {
    HarnessError::Database {
        message: err.to_string(),
    }
}

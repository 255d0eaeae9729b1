//! Readiness conditions for freshly started containers.

use std::fmt;
use std::time::Duration;

use graphdock_common::HarnessResult;
use regex::Regex;

use super::{ContainerHandle, ContainerRuntime, ContainerState};

/// Interval between readiness polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A bounded predicate deciding when a started container is usable.
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// Ready once the container is running.
    Running,
    /// Ready once `times` output lines match `pattern`.
    LogMessage {
        /// Pattern matched against each stdout/stderr line.
        pattern: Regex,
        /// Number of matching lines required.
        times: usize,
    },
    /// Ready once an HTTP GET on the mapped port returns `status`.
    Http {
        /// Container port.
        port: u16,
        /// Request path.
        path: String,
        /// Expected status code.
        status: u16,
    },
    /// Ready once the mapped port accepts TCP connections.
    Port(u16),
    /// Ready once the container has exited with code 0.
    OneShot,
    /// Ready once every inner strategy is.
    All(Vec<WaitStrategy>),
}

/// Outcome of one readiness poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// The condition holds.
    Ready,
    /// Not yet; poll again.
    Pending,
    /// The condition can no longer hold.
    Failed(String),
}

impl WaitStrategy {
    /// Wait for a single log line matching `pattern`.
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is not a valid regex. Patterns are compile-time literals.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn log_message(pattern: &str) -> Self {
        Self::LogMessage {
            pattern: Regex::new(pattern).expect("wait pattern must be a valid regex"),
            times: 1,
        }
    }

    /// Wait for an HTTP 200 on `path`.
    #[must_use]
    pub fn http(port: u16, path: impl Into<String>) -> Self {
        Self::Http {
            port,
            path: path.into(),
            status: 200,
        }
    }

    /// Poll the container once.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be queried.
    pub async fn poll(
        &self,
        runtime: &dyn ContainerRuntime,
        container: &ContainerHandle,
    ) -> HarnessResult<Readiness> {
        match self {
            Self::Running => Ok(match runtime.state(container).await? {
                ContainerState::Running => Readiness::Ready,
                ContainerState::Created => Readiness::Pending,
                ContainerState::Exited(code) => {
                    Readiness::Failed(format!("exited with code {code} before becoming ready"))
                }
            }),
            Self::LogMessage { pattern, times } => {
                let logs = runtime.logs(container).await?;
                let matched = logs.lines().filter(|line| pattern.is_match(line)).count();
                if matched >= *times {
                    return Ok(Readiness::Ready);
                }
                Ok(match runtime.state(container).await? {
                    ContainerState::Exited(code) => Readiness::Failed(format!(
                        "exited with code {code} without logging '{pattern}'"
                    )),
                    _ => Readiness::Pending,
                })
            }
            Self::Http { port, path, status } => {
                if let Some(failed) = exited(runtime, container).await? {
                    return Ok(failed);
                }
                let mapped = runtime.mapped_port(container, *port).await?;
                let url = format!("http://{}:{mapped}{path}", runtime.host());
                Ok(match reqwest::get(&url).await {
                    Ok(response) if response.status().as_u16() == *status => Readiness::Ready,
                    _ => Readiness::Pending,
                })
            }
            Self::Port(port) => {
                if let Some(failed) = exited(runtime, container).await? {
                    return Ok(failed);
                }
                let mapped = runtime.mapped_port(container, *port).await?;
                Ok(
                    match tokio::net::TcpStream::connect((runtime.host(), mapped)).await {
                        Ok(_) => Readiness::Ready,
                        Err(_) => Readiness::Pending,
                    },
                )
            }
            Self::OneShot => Ok(match runtime.state(container).await? {
                ContainerState::Exited(0) => Readiness::Ready,
                ContainerState::Exited(code) => Readiness::Failed(format!("exited with code {code}")),
                _ => Readiness::Pending,
            }),
            Self::All(strategies) => {
                for strategy in strategies {
                    match Box::pin(strategy.poll(runtime, container)).await? {
                        Readiness::Ready => {}
                        other => return Ok(other),
                    }
                }
                Ok(Readiness::Ready)
            }
        }
    }
}

async fn exited(
    runtime: &dyn ContainerRuntime,
    container: &ContainerHandle,
) -> HarnessResult<Option<Readiness>> {
    Ok(match runtime.state(container).await? {
        ContainerState::Exited(code) => Some(Readiness::Failed(format!(
            "exited with code {code} before becoming ready"
        ))),
        _ => None,
    })
}

impl fmt::Display for WaitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "container running"),
            Self::LogMessage { pattern, times: 1 } => write!(f, "log line matching '{pattern}'"),
            Self::LogMessage { pattern, times } => {
                write!(f, "{times} log lines matching '{pattern}'")
            }
            Self::Http { port, path, status } => write!(f, "HTTP {status} from :{port}{path}"),
            Self::Port(port) => write!(f, "port {port} listening"),
            Self::OneShot => write!(f, "successful exit"),
            Self::All(strategies) => {
                let parts: Vec<String> = strategies.iter().map(ToString::to_string).collect();
                write!(f, "{}", parts.join(" and "))
            }
        }
    }
}

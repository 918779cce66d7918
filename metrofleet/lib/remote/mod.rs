//! The remote control plane.
//!
//! [`ControlPlane`] is the seam between lifecycle policy and infrastructure. The production
//! implementation, [`RemoteControlClient`], drives a GraphQL control-plane API and absorbs
//! transient failures with retries and backoff.

mod client;
mod graphql;
mod retry;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use client::*;
pub use retry::*;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    models::{ResourceUsage, SandboxStatus},
    FleetResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What to provision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerConfig {
    /// The task the sandbox previews.
    pub task_id: String,

    /// The user that owns the task.
    pub user_id: String,

    /// The name of the remote project. Derived from the task id when absent.
    pub project_name: Option<String>,

    /// Extra environment variables for the bundler.
    pub env_vars: BTreeMap<String, String>,
}

/// A freshly provisioned container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedContainer {
    /// The composite handle, `{projectId}:{serviceId}`.
    pub container_id: String,

    /// The public endpoint of the bundler.
    pub metro_url: String,

    /// The remote project id.
    pub project_id: String,

    /// The remote service id.
    pub service_id: String,
}

/// The remote view of a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    /// The mapped status.
    pub status: SandboxStatus,

    /// Resource usage, when the control plane reports it.
    pub resource_usage: Option<ResourceUsage>,

    /// Seconds since the running deployment was created.
    pub uptime_seconds: Option<u64>,
}

/// Severity of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSeverity {
    /// An error.
    Error,

    /// A warning.
    Warn,

    /// Debug output.
    Debug,

    /// Everything else.
    Info,
}

/// A line of bundler output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the line was emitted.
    pub timestamp: DateTime<Utc>,

    /// The line itself.
    pub message: String,

    /// How severe the line is.
    pub severity: LogSeverity,
}

/// Which logs to fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogQuery {
    /// Maximum number of lines.
    pub limit: Option<u32>,

    /// Resume after this cursor.
    pub cursor: Option<String>,
}

/// A page of logs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPage {
    /// The lines, oldest first.
    pub logs: Vec<LogEntry>,

    /// Whether more lines may be available.
    pub has_more: bool,

    /// Cursor for the next page.
    pub cursor: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Operations on remote sandboxes.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Provisions a new container running the bundler.
    async fn create_container(&self, config: &ContainerConfig) -> FleetResult<CreatedContainer>;

    /// Redeploys a container. Returns [`SandboxStatus::Starting`].
    async fn start_container(&self, container_id: &str) -> FleetResult<SandboxStatus>;

    /// Tears down a container's service. Returns [`SandboxStatus::Stopped`], even when the
    /// service is already gone.
    async fn stop_container(&self, container_id: &str) -> FleetResult<SandboxStatus>;

    /// Deletes everything behind a container. Returns `true`, even when it is already gone.
    async fn delete_container(&self, container_id: &str) -> FleetResult<bool>;

    /// The remote status of a container. Unknown containers are reported as stopped.
    async fn get_container_status(&self, container_id: &str) -> FleetResult<ContainerStatus>;

    /// Recent logs of a container. Empty when nothing has been deployed yet.
    async fn get_container_logs(&self, container_id: &str, query: &LogQuery)
        -> FleetResult<LogPage>;
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Maps a remote deployment status onto [`SandboxStatus`].
pub fn map_deployment_status(status: &str) -> SandboxStatus {
    match status.to_ascii_lowercase().as_str() {
        "success" | "active" | "running" => SandboxStatus::Running,
        "building" | "deploying" | "initializing" | "waiting" => SandboxStatus::Starting,
        "failed" | "crashed" | "error" => SandboxStatus::Error,
        _ => SandboxStatus::Stopped,
    }
}

/// Maps a remote log severity onto [`LogSeverity`].
pub fn map_log_severity(severity: Option<&str>) -> LogSeverity {
    match severity.map(str::to_ascii_lowercase).as_deref() {
        Some("error" | "err" | "fatal" | "critical") => LogSeverity::Error,
        Some("warn" | "warning") => LogSeverity::Warn,
        Some("debug" | "trace") => LogSeverity::Debug,
        _ => LogSeverity::Info,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_deployment_status() {
        for (remote, expected) in [
            ("SUCCESS", SandboxStatus::Running),
            ("active", SandboxStatus::Running),
            ("BUILDING", SandboxStatus::Starting),
            ("DEPLOYING", SandboxStatus::Starting),
            ("INITIALIZING", SandboxStatus::Starting),
            ("WAITING", SandboxStatus::Starting),
            ("FAILED", SandboxStatus::Error),
            ("CRASHED", SandboxStatus::Error),
            ("REMOVED", SandboxStatus::Stopped),
            ("SLEEPING", SandboxStatus::Stopped),
            ("", SandboxStatus::Stopped),
        ] {
            assert_eq!(map_deployment_status(remote), expected, "status: {remote}");
        }
    }

    #[test]
    fn test_map_log_severity() {
        assert_eq!(map_log_severity(Some("ERROR")), LogSeverity::Error);
        assert_eq!(map_log_severity(Some("warning")), LogSeverity::Warn);
        assert_eq!(map_log_severity(Some("debug")), LogSeverity::Debug);
        assert_eq!(map_log_severity(Some("info")), LogSeverity::Info);
        assert_eq!(map_log_severity(None), LogSeverity::Info);
    }
}

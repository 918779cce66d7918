//! Data models shared across the fleet.
//!
//! [`SandboxRecord`] is the durable view of a sandbox and is only ever written by the
//! [`LifecycleService`](crate::lifecycle::LifecycleService). [`RemoteMetadata`] is the
//! in-process decomposition of a container id into control-plane identifiers.

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{FleetError, FleetResult};

//--------------------------------------------------------------------------------------------------
// Types: Sandbox
//--------------------------------------------------------------------------------------------------

/// The status of a sandbox.
///
/// Valid transitions are `starting -> running`, `running -> stopped`,
/// `running | starting -> error` and `error -> starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    /// The sandbox is being deployed.
    Starting,

    /// The bundler is up and serving.
    Running,

    /// The sandbox has been reclaimed.
    Stopped,

    /// The sandbox failed and will not be restarted automatically.
    Error,
}

/// A point-in-time snapshot of the resources a sandbox uses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU usage as a percentage of the allocated vCPUs.
    pub cpu_percent: f64,

    /// Memory in use, in megabytes.
    pub memory_mb: f64,

    /// Network bytes received.
    pub network_rx_bytes: u64,

    /// Network bytes transmitted.
    pub network_tx_bytes: u64,
}

/// A sandbox as persisted in the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxRecord {
    /// The internal record key.
    pub id: String,

    /// The task the sandbox previews.
    pub task_id: String,

    /// The user that owns the task.
    pub user_id: String,

    /// The opaque control-plane handle, `{projectId}:{serviceId}`.
    pub container_id: String,

    /// The public endpoint of the bundler.
    pub metro_url: String,

    /// The current status.
    pub status: SandboxStatus,

    /// The last observed resource usage.
    pub resource_usage: Option<ResourceUsage>,

    /// Why the sandbox failed, kept while the status is `error`.
    pub error_message: Option<String>,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last modified.
    pub updated_at: DateTime<Utc>,

    /// When the sandbox was last known to be in use.
    pub last_activity_at: DateTime<Utc>,
}

/// The fields needed to persist a newly provisioned sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSandbox {
    /// The task the sandbox previews.
    pub task_id: String,

    /// The user that owns the task.
    pub user_id: String,

    /// The control-plane handle.
    pub container_id: String,

    /// The public endpoint of the bundler.
    pub metro_url: String,
}

//--------------------------------------------------------------------------------------------------
// Types: Remote
//--------------------------------------------------------------------------------------------------

/// Control-plane identifiers behind a container id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMetadata {
    /// The project that owns the service.
    pub project_id: String,

    /// The service running the bundler image.
    pub service_id: String,

    /// The environment the service is deployed into.
    pub environment_id: String,

    /// The latest known deployment, if any.
    pub deployment_id: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Types: Events
//--------------------------------------------------------------------------------------------------

/// An event emitted by the lifecycle service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// A sandbox was provisioned.
    Created {
        /// The container id.
        container_id: String,

        /// The bundler endpoint.
        metro_url: String,
    },

    /// A sandbox was (re)started.
    Started {
        /// The container id.
        container_id: String,
    },

    /// A sandbox was stopped.
    Stopped {
        /// The container id.
        container_id: String,

        /// Why it was stopped.
        reason: Option<String>,
    },

    /// A sandbox was marked as failed.
    Error {
        /// The container id.
        container_id: String,

        /// The failure reason.
        error: String,
    },

    /// A sandbox was checked.
    HealthCheck {
        /// The container id.
        container_id: String,

        /// Whether the sandbox was found running.
        healthy: bool,
    },

    /// A sandbox was reported as in use.
    Activity {
        /// The container id.
        container_id: String,

        /// When the activity was recorded.
        timestamp: DateTime<Utc>,
    },
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxStatus {
    /// Returns the status as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Starting => "starting",
            SandboxStatus::Running => "running",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Error => "error",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Staying in the same status is always allowed.
    pub fn can_transition_to(&self, next: SandboxStatus) -> bool {
        use SandboxStatus::*;

        *self == next
            || matches!(
                (self, next),
                (Starting, Running)
                    | (Running, Stopped)
                    | (Running, Error)
                    | (Starting, Error)
                    | (Error, Starting)
            )
    }
}

impl SandboxRecord {
    /// Moves the record to `next`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, next: SandboxStatus) -> FleetResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(FleetError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        if next != SandboxStatus::Error {
            self.error_message = None;
        }

        self.status = next;
        Ok(())
    }

    /// Records activity at `now`. `last_activity_at` never moves backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = self.last_activity_at.max(now);
        self.updated_at = self.updated_at.max(now);
    }
}

impl RemoteMetadata {
    /// The public container id for these identifiers.
    pub fn container_id(&self) -> String {
        format!("{}:{}", self.project_id, self.service_id)
    }
}

impl LifecycleEvent {
    /// The container the event is about.
    pub fn container_id(&self) -> &str {
        match self {
            LifecycleEvent::Created { container_id, .. }
            | LifecycleEvent::Started { container_id }
            | LifecycleEvent::Stopped { container_id, .. }
            | LifecycleEvent::Error { container_id, .. }
            | LifecycleEvent::HealthCheck { container_id, .. }
            | LifecycleEvent::Activity { container_id, .. } => container_id,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Splits a container id into its `(projectId, serviceId)` parts.
pub fn split_container_id(container_id: &str) -> FleetResult<(&str, &str)> {
    match container_id.split_once(':') {
        Some((project, service)) if !project.is_empty() && !service.is_empty() => {
            Ok((project, service))
        }
        _ => Err(FleetError::InvalidContainerId(container_id.to_string())),
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SandboxStatus {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(SandboxStatus::Starting),
            "running" => Ok(SandboxStatus::Running),
            "stopped" => Ok(SandboxStatus::Stopped),
            "error" => Ok(SandboxStatus::Error),
            other => Err(FleetError::custom(anyhow::anyhow!(
                "unknown sandbox status: {other}"
            ))),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn record(status: SandboxStatus) -> SandboxRecord {
        let now = Utc::now();
        SandboxRecord {
            id: "r1".into(),
            task_id: "t1".into(),
            user_id: "u1".into(),
            container_id: "p1:s1".into(),
            metro_url: "https://metro.example.com".into(),
            status,
            resource_usage: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            last_activity_at: now,
        }
    }

    #[test]
    fn test_state_machine_transitions() {
        use SandboxStatus::*;

        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Error));
        assert!(Starting.can_transition_to(Error));
        assert!(Error.can_transition_to(Starting));
        assert!(Running.can_transition_to(Running));

        assert!(!Stopped.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Starting));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Error.can_transition_to(Running));
        assert!(!Starting.can_transition_to(Stopped));
    }

    #[test]
    fn test_transition_rejects_invalid_moves() {
        let mut rec = record(SandboxStatus::Stopped);
        let err = rec.transition(SandboxStatus::Running).unwrap_err();
        assert!(matches!(err, FleetError::InvalidTransition { .. }));
        assert_eq!(rec.status, SandboxStatus::Stopped);
    }

    #[test]
    fn test_transition_clears_error_message_on_restart() {
        let mut rec = record(SandboxStatus::Error);
        rec.error_message = Some("crashed".into());
        rec.transition(SandboxStatus::Starting).unwrap();
        assert_eq!(rec.error_message, None);
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut rec = record(SandboxStatus::Running);
        let before = rec.last_activity_at;
        rec.touch(before - Duration::minutes(5));
        assert_eq!(rec.last_activity_at, before);

        rec.touch(before + Duration::minutes(5));
        assert_eq!(rec.last_activity_at, before + Duration::minutes(5));
    }

    #[test]
    fn test_split_container_id() {
        assert_eq!(split_container_id("p1:s1").unwrap(), ("p1", "s1"));
        assert!(split_container_id("p1").is_err());
        assert!(split_container_id(":s1").is_err());
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = LifecycleEvent::Stopped {
            container_id: "p1:s1".into(),
            reason: Some("inactivity".into()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stopped");
        assert_eq!(json["reason"], "inactivity");
    }
}

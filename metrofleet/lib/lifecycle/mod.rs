//! Sandbox lifecycle policy.
//!
//! [`LifecycleService`] is the only writer of sandbox records. It provisions sandboxes through
//! a [`ControlPlane`](crate::remote::ControlPlane), reclaims idle ones, and decides whether a
//! failing sandbox is restarted or marked as failed.

mod events;
mod recovery;
mod service;
mod watch;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use events::*;
pub use recovery::*;
pub use service::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{health::LogFailure, models::{ResourceUsage, SandboxStatus}};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A freshly provisioned sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedSandbox {
    /// The control-plane handle.
    pub container_id: String,

    /// The public endpoint of the bundler.
    pub metro_url: String,

    /// The id of the persisted record.
    pub record_id: String,
}

/// The outcome of a monitoring pass over one sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorReport {
    /// The status stored after the pass.
    pub status: SandboxStatus,

    /// The resource usage reported by the control plane.
    pub resource_usage: Option<ResourceUsage>,

    /// The activity timestamp stored after the pass.
    pub last_activity_at: DateTime<Utc>,
}

/// The outcome of an inactivity sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Sandboxes stopped by the sweep.
    pub stopped_count: usize,

    /// Sandboxes the sweep failed to stop.
    pub errors: Vec<CleanupFailure>,
}

/// A sandbox an inactivity sweep could not stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupFailure {
    /// The container that could not be stopped.
    pub container_id: String,

    /// Why it could not be stopped.
    pub error: String,
}

/// What a log inspection found and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogInspection {
    /// The classified failure, if the logs show one.
    pub failure: Option<LogFailure>,

    /// How the failure was handled.
    pub outcome: Option<RecoveryOutcome>,
}

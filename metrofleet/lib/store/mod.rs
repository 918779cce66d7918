//! Storage backends.
//!
//! Two kinds of state live here: the durable sandbox records (see [`SandboxStore`]) and the
//! small in-process maps the fleet components keep (see [`KeyValueStore`]). Both are injected
//! so a deployment can swap the in-memory defaults for shared backends.

mod kv;
mod memory;
mod sqlite;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use kv::*;
pub use memory::*;
pub use sqlite::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    models::{NewSandbox, SandboxRecord, SandboxStatus},
    FleetResult,
};

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Durable storage for sandbox records.
#[async_trait]
pub trait SandboxStore: Send + Sync {
    /// Persists a new record with status `starting` and activity set to `now`.
    async fn insert(&self, sandbox: NewSandbox, now: DateTime<Utc>) -> FleetResult<SandboxRecord>;

    /// Gets a record by its id.
    async fn get(&self, id: &str) -> FleetResult<Option<SandboxRecord>>;

    /// Gets a record by its container id.
    async fn get_by_container_id(&self, container_id: &str) -> FleetResult<Option<SandboxRecord>>;

    /// Gets the most recently created record for a task.
    async fn get_by_task_id(&self, task_id: &str) -> FleetResult<Option<SandboxRecord>>;

    /// Writes every mutable field of `record` back to the store.
    ///
    /// `last_activity_at` is never moved backwards by an update.
    async fn update(&self, record: &SandboxRecord) -> FleetResult<()>;

    /// Records with `status` whose last activity is strictly older than `cutoff`.
    async fn find_inactive(
        &self,
        status: SandboxStatus,
        cutoff: DateTime<Utc>,
    ) -> FleetResult<Vec<SandboxRecord>>;

    /// Every record, oldest first.
    async fn list(&self) -> FleetResult<Vec<SandboxRecord>>;
}

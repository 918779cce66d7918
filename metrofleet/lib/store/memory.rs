use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    models::{NewSandbox, SandboxRecord, SandboxStatus},
    FleetError, FleetResult,
};

use super::SandboxStore;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`SandboxStore`] that keeps records in process memory.
#[derive(Debug, Default)]
pub struct MemorySandboxStore {
    records: RwLock<HashMap<String, SandboxRecord>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MemorySandboxStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a fully formed record, replacing any record with the same id.
    pub async fn put(&self, record: SandboxRecord) {
        self.records.write().await.insert(record.id.clone(), record);
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl SandboxStore for MemorySandboxStore {
    async fn insert(&self, sandbox: NewSandbox, now: DateTime<Utc>) -> FleetResult<SandboxRecord> {
        let mut records = self.records.write().await;
        if records
            .values()
            .any(|r| r.container_id == sandbox.container_id)
        {
            return Err(FleetError::custom(anyhow::anyhow!(
                "container id already recorded: {}",
                sandbox.container_id
            )));
        }

        let record = SandboxRecord {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: sandbox.task_id,
            user_id: sandbox.user_id,
            container_id: sandbox.container_id,
            metro_url: sandbox.metro_url,
            status: SandboxStatus::Starting,
            resource_usage: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            last_activity_at: now,
        };

        records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, id: &str) -> FleetResult<Option<SandboxRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn get_by_container_id(&self, container_id: &str) -> FleetResult<Option<SandboxRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.container_id == container_id)
            .cloned())
    }

    async fn get_by_task_id(&self, task_id: &str) -> FleetResult<Option<SandboxRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.task_id == task_id)
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn update(&self, record: &SandboxRecord) -> FleetResult<()> {
        let mut records = self.records.write().await;
        let Some(existing) = records.get_mut(&record.id) else {
            return Err(FleetError::SandboxNotFound(record.container_id.clone()));
        };

        let last_activity_at = existing.last_activity_at.max(record.last_activity_at);
        *existing = record.clone();
        existing.last_activity_at = last_activity_at;

        Ok(())
    }

    async fn find_inactive(
        &self,
        status: SandboxStatus,
        cutoff: DateTime<Utc>,
    ) -> FleetResult<Vec<SandboxRecord>> {
        let mut matches: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.status == status && r.last_activity_at < cutoff)
            .cloned()
            .collect();

        matches.sort_by_key(|r| r.last_activity_at);
        Ok(matches)
    }

    async fn list(&self) -> FleetResult<Vec<SandboxRecord>> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    health::{HealthCallbacks, HealthState},
    models::{LifecycleEvent, SandboxStatus},
    FleetError, FleetResult,
};

use super::{service::ServiceInner, LifecycleService};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Feeds health monitoring ticks of one sandbox back into the lifecycle.
struct LifecycleCallbacks {
    service: Weak<ServiceInner>,
    container_id: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LifecycleService {
    /// Starts health monitoring a sandbox.
    ///
    /// A healthy check moves a starting sandbox to running. Recovery resets its restart budget
    /// and repeated failures go through [`handle_container_error`](Self::handle_container_error).
    pub async fn watch_container(&self, container_id: &str, metro_url: &str) -> FleetResult<()> {
        let Some(monitor) = &self.inner.monitor else {
            return Err(FleetError::Config("health monitoring is disabled".to_string()));
        };

        let callbacks = Arc::new(LifecycleCallbacks {
            service: Arc::downgrade(&self.inner),
            container_id: container_id.to_string(),
        });

        monitor
            .start_monitoring(container_id, metro_url, callbacks, None)
            .await;

        Ok(())
    }

    /// Applies a health check to the sandbox record.
    async fn observe_health(&self, container_id: &str, healthy: bool) -> FleetResult<()> {
        if healthy {
            let mut record = self.load_record(container_id).await?;
            if record.status == SandboxStatus::Starting {
                record.transition(SandboxStatus::Running)?;
                record.updated_at = Utc::now();
                self.inner.store.update(&record).await?;
                tracing::info!(container_id, "sandbox is running");
            }
        }

        self.emit(LifecycleEvent::HealthCheck {
            container_id: container_id.to_string(),
            healthy,
        });

        Ok(())
    }
}

impl LifecycleCallbacks {
    fn service(&self) -> Option<LifecycleService> {
        self.service
            .upgrade()
            .map(|inner| LifecycleService { inner })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl HealthCallbacks for LifecycleCallbacks {
    async fn on_health_check(&self, state: &HealthState) {
        let Some(service) = self.service() else { return };
        if let Err(e) = service
            .observe_health(&self.container_id, state.healthy)
            .await
        {
            tracing::warn!(container_id = %self.container_id, error = %e, "failed to record health check");
        }
    }

    async fn on_recovery(&self) {
        let Some(service) = self.service() else { return };
        service.inner.restarts.delete(&self.container_id).await;
    }

    async fn on_error(&self, message: &str) {
        let Some(service) = self.service() else { return };

        // A stopped sandbox cannot be recovered, only forgotten.
        if let Ok(record) = service.load_record(&self.container_id).await {
            if record.status == SandboxStatus::Stopped {
                tracing::info!(container_id = %self.container_id, "sandbox is stopped, no longer watching");
                service.unwatch(&self.container_id).await;
                return;
            }
        }

        match service
            .handle_container_error(&self.container_id, FleetError::Unhealthy(message.to_string()))
            .await
        {
            Ok(outcome) => tracing::info!(
                container_id = %self.container_id,
                action = ?outcome.action,
                "handled unhealthy sandbox"
            ),
            Err(e) => tracing::error!(
                container_id = %self.container_id,
                error = %e,
                "failed to handle unhealthy sandbox"
            ),
        }
    }
}

use std::sync::Arc;

use chrono::Utc;
use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::LifecycleConfig,
    health::{classify_logs, HealthMonitor},
    models::{LifecycleEvent, NewSandbox, SandboxRecord, SandboxStatus},
    remote::{ContainerConfig, ControlPlane, LogQuery},
    store::{KeyValueStore, MemoryStore, SandboxStore},
    FleetError, FleetResult,
};

use super::{
    CleanupFailure, CleanupReport, EventBus, LogInspection, MonitorReport, ProvisionedSandbox,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Log lines inspected when looking for a failure.
const INSPECTED_LOG_LINES: u32 = 200;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Owns the business policy of a sandbox's life.
///
/// The service is cheap to clone. Clones share the same collaborators, restart counters and
/// listeners.
#[derive(Clone)]
pub struct LifecycleService {
    pub(super) inner: Arc<ServiceInner>,
}

pub(super) struct ServiceInner {
    pub(super) control: Arc<dyn ControlPlane>,
    pub(super) store: Arc<dyn SandboxStore>,
    pub(super) monitor: Option<HealthMonitor>,
    pub(super) config: LifecycleConfig,
    pub(super) restarts: Arc<dyn KeyValueStore<u32>>,
    pub(super) events: EventBus,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LifecycleService {
    /// Creates a service without health monitoring.
    pub fn new(
        control: Arc<dyn ControlPlane>,
        store: Arc<dyn SandboxStore>,
        config: LifecycleConfig,
    ) -> Self {
        Self::from_parts(control, store, None, MemoryStore::shared(), config)
    }

    /// Creates a service that health monitors the sandboxes it provisions.
    pub fn with_monitor(
        control: Arc<dyn ControlPlane>,
        store: Arc<dyn SandboxStore>,
        monitor: HealthMonitor,
        config: LifecycleConfig,
    ) -> Self {
        Self::from_parts(control, store, Some(monitor), MemoryStore::shared(), config)
    }

    /// Creates a service from every collaborator, including the restart counter backend.
    pub fn from_parts(
        control: Arc<dyn ControlPlane>,
        store: Arc<dyn SandboxStore>,
        monitor: Option<HealthMonitor>,
        restarts: Arc<dyn KeyValueStore<u32>>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                control,
                store,
                monitor,
                config,
                restarts,
                events: EventBus::new(),
            }),
        }
    }

    /// The health monitor, if monitoring is enabled.
    pub fn monitor(&self) -> Option<&HealthMonitor> {
        self.inner.monitor.as_ref()
    }

    /// Registers an event listener. See [`EventBus`] for the delivery guarantees.
    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener);
    }

    /// Provisions a sandbox for a task.
    ///
    /// Creation is attempted up to `provision_max_attempts` times with exponential backoff. A
    /// non-retryable failure is returned right away.
    pub async fn provision_container(
        &self,
        task_id: &str,
        user_id: &str,
    ) -> FleetResult<ProvisionedSandbox> {
        let config = ContainerConfig {
            task_id: task_id.to_string(),
            user_id: user_id.to_string(),
            ..Default::default()
        };
        let max_attempts = *self.inner.config.get_provision_max_attempts();
        let base_delay = self.inner.config.provision_base_delay();

        let mut attempt = 0;
        let created = loop {
            match self.inner.control.create_container(&config).await {
                Ok(created) => break created,
                Err(e) if !e.is_retryable() || attempt + 1 >= max_attempts => {
                    tracing::error!(task_id, attempt = attempt + 1, error = %e, "provisioning failed");
                    return Err(e);
                }
                Err(e) => {
                    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                    let delay = base_delay.saturating_mul(factor);
                    tracing::warn!(
                        task_id,
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "provisioning attempt failed, retrying"
                    );
                    time::sleep(delay).await;
                    attempt += 1;
                }
            }
        };

        let record = self
            .inner
            .store
            .insert(
                NewSandbox {
                    task_id: task_id.to_string(),
                    user_id: user_id.to_string(),
                    container_id: created.container_id.clone(),
                    metro_url: created.metro_url.clone(),
                },
                Utc::now(),
            )
            .await?;

        tracing::info!(
            task_id,
            container_id = %created.container_id,
            record_id = %record.id,
            "sandbox provisioned"
        );
        self.emit(LifecycleEvent::Created {
            container_id: created.container_id.clone(),
            metro_url: created.metro_url.clone(),
        });

        if *self.inner.config.get_auto_monitor() && self.inner.monitor.is_some() {
            self.watch_container(&created.container_id, &created.metro_url)
                .await?;
        }

        Ok(ProvisionedSandbox {
            container_id: created.container_id,
            metro_url: created.metro_url,
            record_id: record.id,
        })
    }

    /// Refreshes a sandbox record from the control plane.
    ///
    /// The observed status is applied only when the state machine allows it. The activity
    /// timestamp is bumped either way.
    pub async fn monitor_container(&self, container_id: &str) -> FleetResult<MonitorReport> {
        let mut record = self.load_record(container_id).await?;
        let remote = self.inner.control.get_container_status(container_id).await?;

        let mut stopped_remotely = false;
        if record.status != remote.status {
            match record.transition(remote.status) {
                Ok(()) => {
                    tracing::info!(container_id, status = %remote.status, "sandbox status changed");
                    match remote.status {
                        SandboxStatus::Error => {
                            record.error_message = Some("deployment failed".to_string());
                        }
                        SandboxStatus::Stopped => stopped_remotely = true,
                        _ => {}
                    }
                }
                Err(e) => tracing::debug!(container_id, error = %e, "ignoring observed status"),
            }
        }

        record.resource_usage = remote.resource_usage;
        record.touch(Utc::now());
        self.inner.store.update(&record).await?;

        self.emit(LifecycleEvent::HealthCheck {
            container_id: container_id.to_string(),
            healthy: remote.status == SandboxStatus::Running,
        });

        if stopped_remotely {
            self.unwatch(container_id).await;
            self.inner.restarts.delete(container_id).await;
            self.emit(LifecycleEvent::Stopped {
                container_id: container_id.to_string(),
                reason: Some("remote".to_string()),
            });
        }

        Ok(MonitorReport {
            status: record.status,
            resource_usage: record.resource_usage,
            last_activity_at: record.last_activity_at,
        })
    }

    /// Stops every running sandbox that has been idle for longer than the inactivity
    /// threshold.
    ///
    /// A sandbox that cannot be stopped is reported and skipped.
    pub async fn cleanup_inactive_containers(&self) -> FleetResult<CleanupReport> {
        let threshold = chrono::Duration::from_std(self.inner.config.inactivity_threshold())
            .map_err(|e| FleetError::Config(format!("invalid inactivity threshold: {e}")))?;
        let cutoff = Utc::now() - threshold;

        let idle = self
            .inner
            .store
            .find_inactive(SandboxStatus::Running, cutoff)
            .await?;

        let mut report = CleanupReport::default();
        for record in idle {
            match self.reclaim(record, "inactivity").await {
                Ok(()) => report.stopped_count += 1,
                Err((container_id, e)) => {
                    tracing::warn!(%container_id, error = %e, "failed to stop idle sandbox");
                    report.errors.push(CleanupFailure {
                        container_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        if report.stopped_count > 0 || !report.errors.is_empty() {
            tracing::info!(
                stopped = report.stopped_count,
                failed = report.errors.len(),
                "inactivity sweep finished"
            );
        }

        Ok(report)
    }

    /// Records that a sandbox is in use, keeping it from being reclaimed.
    pub async fn update_activity(&self, container_id: &str) -> FleetResult<()> {
        let mut record = self.load_record(container_id).await?;
        let now = Utc::now();
        record.touch(now);
        self.inner.store.update(&record).await?;

        self.emit(LifecycleEvent::Activity {
            container_id: container_id.to_string(),
            timestamp: now,
        });

        Ok(())
    }

    /// The most recent sandbox record of a task.
    pub async fn get_container_by_task_id(
        &self,
        task_id: &str,
    ) -> FleetResult<Option<SandboxRecord>> {
        self.inner.store.get_by_task_id(task_id).await
    }

    /// Stops a running sandbox on request.
    pub async fn stop_container(&self, container_id: &str) -> FleetResult<()> {
        let record = self.load_record(container_id).await?;
        if !record.status.can_transition_to(SandboxStatus::Stopped) {
            return Err(FleetError::InvalidTransition {
                from: record.status,
                to: SandboxStatus::Stopped,
            });
        }

        self.reclaim(record, "manual").await.map_err(|(_, e)| e)
    }

    /// Deletes everything behind a sandbox. The record is kept.
    pub async fn delete_container(&self, container_id: &str) -> FleetResult<bool> {
        let mut record = self.load_record(container_id).await?;
        let deleted = self.inner.control.delete_container(container_id).await?;

        self.unwatch(container_id).await;
        self.inner.restarts.delete(container_id).await;

        if record.status != SandboxStatus::Stopped
            && record.status.can_transition_to(SandboxStatus::Stopped)
        {
            record.transition(SandboxStatus::Stopped)?;
            record.updated_at = Utc::now();
            self.inner.store.update(&record).await?;

            self.emit(LifecycleEvent::Stopped {
                container_id: container_id.to_string(),
                reason: Some("deleted".to_string()),
            });
        } else if record.status != SandboxStatus::Error
            && record.status.can_transition_to(SandboxStatus::Error)
        {
            // A starting sandbox cannot stop, so it ends up failed instead.
            record.transition(SandboxStatus::Error)?;
            record.error_message = Some("deleted".to_string());
            record.updated_at = Utc::now();
            self.inner.store.update(&record).await?;

            self.emit(LifecycleEvent::Error {
                container_id: container_id.to_string(),
                error: "deleted".to_string(),
            });
        }

        tracing::info!(container_id, "sandbox deleted");
        Ok(deleted)
    }

    /// Looks for a failure in a sandbox's recent logs and handles it like any other error.
    pub async fn inspect_logs(&self, container_id: &str) -> FleetResult<LogInspection> {
        let page = self
            .inner
            .control
            .get_container_logs(
                container_id,
                &LogQuery {
                    limit: Some(INSPECTED_LOG_LINES),
                    cursor: None,
                },
            )
            .await?;

        let text = page
            .logs
            .iter()
            .map(|log| log.message.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let Some(failure) = classify_logs(&text) else {
            return Ok(LogInspection {
                failure: None,
                outcome: None,
            });
        };

        tracing::warn!(container_id, kind = %failure.kind, line = %failure.line, "failure found in logs");
        let outcome = self
            .handle_container_error(
                container_id,
                FleetError::Application {
                    kind: failure.kind,
                    message: failure.line.clone(),
                },
            )
            .await?;

        Ok(LogInspection {
            failure: Some(failure),
            outcome: Some(outcome),
        })
    }

    /// Runs the inactivity sweep every `cleanup_interval` until `cancel` fires.
    pub fn spawn_cleanup_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        let interval = self.inner.config.cleanup_interval();

        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = service.cleanup_inactive_containers().await {
                            tracing::error!(error = %e, "inactivity sweep failed");
                        }
                    }
                }
            }

            tracing::debug!("cleanup loop exited");
        })
    }

    /// Stops every health monitor.
    pub async fn shutdown(&self) {
        if let Some(monitor) = &self.inner.monitor {
            monitor.stop_all().await;
        }
        tracing::info!("lifecycle service shut down");
    }

    pub(super) async fn load_record(&self, container_id: &str) -> FleetResult<SandboxRecord> {
        self.inner
            .store
            .get_by_container_id(container_id)
            .await?
            .ok_or_else(|| FleetError::SandboxNotFound(container_id.to_string()))
    }

    pub(super) fn emit(&self, event: LifecycleEvent) {
        self.inner.events.emit(&event);
    }

    pub(super) async fn unwatch(&self, container_id: &str) {
        if let Some(monitor) = &self.inner.monitor {
            monitor.stop_monitoring(container_id).await;
        }
    }

    /// Stops a sandbox and records it as stopped.
    async fn reclaim(
        &self,
        mut record: SandboxRecord,
        reason: &str,
    ) -> Result<(), (String, FleetError)> {
        let container_id = record.container_id.clone();
        let result = async {
            self.inner.control.stop_container(&container_id).await?;
            record.transition(SandboxStatus::Stopped)?;
            record.updated_at = Utc::now();
            self.inner.store.update(&record).await
        }
        .await;

        if let Err(e) = result {
            return Err((container_id, e));
        }

        self.unwatch(&container_id).await;
        self.inner.restarts.delete(&container_id).await;
        tracing::info!(%container_id, reason, "sandbox stopped");

        self.emit(LifecycleEvent::Stopped {
            container_id,
            reason: Some(reason.to_string()),
        });

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

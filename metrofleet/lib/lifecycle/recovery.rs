use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    models::{LifecycleEvent, SandboxStatus},
    FleetError, FleetResult,
};

use super::LifecycleService;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What error handling did to a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// The sandbox was redeployed.
    Restarted,

    /// The sandbox was given up on.
    MarkedFailed,
}

/// The outcome of [`LifecycleService::handle_container_error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    /// What was done.
    pub action: RecoveryAction,

    /// A human readable summary.
    pub message: String,
}

/// A step of the recovery state machine.
enum Step {
    /// Decide what to do about an error.
    Assess(FleetError),

    /// Redeploy the sandbox.
    Restart(String),

    /// Recovery is over.
    Done(RecoveryOutcome),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LifecycleService {
    /// Decides whether a failing sandbox is restarted or marked as failed.
    ///
    /// Non-retryable errors mark the sandbox as failed right away. Retryable ones count
    /// against a per-container budget of `max_restart_attempts`; a restart that itself fails
    /// is assessed again against the same budget, so this always terminates.
    pub async fn handle_container_error(
        &self,
        container_id: &str,
        error: FleetError,
    ) -> FleetResult<RecoveryOutcome> {
        let max_attempts = *self.inner.config.get_max_restart_attempts();
        let mut step = Step::Assess(error);

        loop {
            step = match step {
                Step::Assess(error) if !error.is_retryable() => {
                    tracing::warn!(container_id, error = %error, "non-retryable sandbox failure");
                    Step::Done(self.mark_failed(container_id, &error.to_string()).await?)
                }
                Step::Assess(error) => {
                    let attempts = self.inner.restarts.get(container_id).await.unwrap_or(0) + 1;
                    self.inner.restarts.set(container_id, attempts).await;

                    if attempts >= max_attempts {
                        let reason = format!("gave up after {attempts} failures: {error}");
                        Step::Done(self.mark_failed(container_id, &reason).await?)
                    } else {
                        tracing::info!(
                            container_id,
                            attempt = attempts,
                            max_attempts,
                            error = %error,
                            "restarting sandbox"
                        );
                        Step::Restart(error.to_string())
                    }
                }
                Step::Restart(reason) => match self.restart(container_id, &reason).await {
                    Ok(()) => Step::Done(RecoveryOutcome {
                        action: RecoveryAction::Restarted,
                        message: format!("restarted after: {reason}"),
                    }),
                    Err(e) => {
                        tracing::warn!(container_id, error = %e, "restart failed");
                        Step::Assess(e)
                    }
                },
                Step::Done(outcome) => return Ok(outcome),
            };
        }
    }

    /// Moves a sandbox to `error`, stops watching it and forgets its restart budget.
    async fn mark_failed(&self, container_id: &str, reason: &str) -> FleetResult<RecoveryOutcome> {
        let mut record = self.load_record(container_id).await?;
        record.transition(SandboxStatus::Error)?;
        record.error_message = Some(reason.to_string());
        record.updated_at = Utc::now();
        self.inner.store.update(&record).await?;

        self.inner.restarts.delete(container_id).await;
        self.unwatch(container_id).await;

        tracing::error!(container_id, reason, "sandbox marked as failed");
        self.emit(LifecycleEvent::Error {
            container_id: container_id.to_string(),
            error: reason.to_string(),
        });

        Ok(RecoveryOutcome {
            action: RecoveryAction::MarkedFailed,
            message: reason.to_string(),
        })
    }

    /// Redeploys a sandbox, passing through `error` on the way back to `starting`.
    async fn restart(&self, container_id: &str, reason: &str) -> FleetResult<()> {
        let mut record = self.load_record(container_id).await?;
        if record.status != SandboxStatus::Error {
            record.transition(SandboxStatus::Error)?;
            record.error_message = Some(reason.to_string());
            record.updated_at = Utc::now();
            self.inner.store.update(&record).await?;
        }

        self.inner.control.start_container(container_id).await?;

        record.transition(SandboxStatus::Starting)?;
        record.updated_at = Utc::now();
        self.inner.store.update(&record).await?;

        self.emit(LifecycleEvent::Started {
            container_id: container_id.to_string(),
        });

        Ok(())
    }
}

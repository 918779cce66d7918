//! The metrofleet configuration file.

use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use getset::Getters;
use serde::{Deserialize, Serialize};
use tokio::fs;
use typed_builder::TypedBuilder;

use crate::{FleetError, FleetResult};

use super::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The metrofleet configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct FleetConfig {
    /// How the control plane is reached.
    #[builder(default)]
    pub(super) control_plane: ControlPlaneConfig,

    /// How sandboxes are probed.
    #[builder(default)]
    pub(super) health: HealthConfig,

    /// Lifecycle policy.
    #[builder(default)]
    pub(super) lifecycle: LifecycleConfig,

    /// Connection artifact settings.
    #[builder(default)]
    pub(super) artifacts: ArtifactConfig,

    /// Where sandbox records are persisted.
    #[builder(default)]
    pub(super) store: StoreConfig,
}

/// Settings for the remote control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// The GraphQL endpoint.
    #[builder(default = DEFAULT_CONTROL_PLANE_ENDPOINT.to_string(), setter(into))]
    pub(super) endpoint: String,

    /// The bearer token. Usually provided through the environment.
    #[builder(default, setter(into))]
    pub(super) api_token: String,

    /// The image run by every bundler service.
    #[builder(default = DEFAULT_BUNDLER_IMAGE.to_string(), setter(into))]
    pub(super) bundler_image: String,

    /// Additional attempts for a retryable failure.
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub(super) max_retries: u32,

    /// The base backoff delay in milliseconds.
    #[builder(default = DEFAULT_BASE_DELAY_MS)]
    pub(super) base_delay_ms: u64,

    /// The maximum backoff delay in milliseconds.
    #[builder(default = DEFAULT_MAX_DELAY_MS)]
    pub(super) max_delay_ms: u64,

    /// The deadline of a single request in seconds.
    #[builder(default = DEFAULT_REQUEST_TIMEOUT_SECS)]
    pub(super) request_timeout_secs: u64,
}

/// Settings for the health monitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct HealthConfig {
    /// Seconds between two checks of the same sandbox.
    #[builder(default = DEFAULT_HEALTH_INTERVAL_SECS)]
    pub(super) interval_secs: u64,

    /// The deadline of a single probe in seconds.
    #[builder(default = DEFAULT_PROBE_TIMEOUT_SECS)]
    pub(super) probe_timeout_secs: u64,

    /// Consecutive failures before `on_error` fires.
    #[builder(default = DEFAULT_MAX_CONSECUTIVE_FAILURES)]
    pub(super) max_consecutive_failures: u32,

    /// Candidate paths, probed in order.
    #[builder(default = DEFAULT_HEALTH_PATHS.iter().map(|p| p.to_string()).collect())]
    pub(super) paths: Vec<String>,
}

/// Lifecycle policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct LifecycleConfig {
    /// Idle seconds after which a running sandbox is reclaimed.
    #[builder(default = DEFAULT_INACTIVITY_THRESHOLD_SECS)]
    pub(super) inactivity_threshold_secs: u64,

    /// Total provisioning attempts.
    #[builder(default = DEFAULT_PROVISION_MAX_ATTEMPTS)]
    pub(super) provision_max_attempts: u32,

    /// Base delay between provisioning attempts in milliseconds.
    #[builder(default = DEFAULT_PROVISION_BASE_DELAY_MS)]
    pub(super) provision_base_delay_ms: u64,

    /// Failures tolerated per sandbox before it is marked as failed.
    #[builder(default = DEFAULT_MAX_RESTART_ATTEMPTS)]
    pub(super) max_restart_attempts: u32,

    /// Seconds between two inactivity sweeps.
    #[builder(default = DEFAULT_CLEANUP_INTERVAL_SECS)]
    pub(super) cleanup_interval_secs: u64,

    /// Whether provisioned sandboxes are health monitored right away.
    #[builder(default = true)]
    pub(super) auto_monitor: bool,
}

/// Connection artifact settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct ArtifactConfig {
    /// Seconds a generated artifact stays cached.
    #[builder(default = DEFAULT_ARTIFACT_TTL_SECS)]
    pub(super) ttl_secs: u64,

    /// The side of generated codes in pixels.
    #[builder(default = DEFAULT_QR_SIZE)]
    pub(super) size: u32,

    /// The quiet zone of generated codes in modules.
    #[builder(default = DEFAULT_QR_MARGIN)]
    pub(super) margin: u32,
}

/// Record store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct StoreConfig {
    /// The SQLite database holding sandbox records.
    #[builder(default = DEFAULT_DATABASE_PATH.clone(), setter(into))]
    pub(super) database_path: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FleetConfig {
    /// Loads the configuration from `path`, falling back to defaults when the file does not
    /// exist. Values from a `.env` file and the process environment override the file.
    pub async fn load(path: impl AsRef<Path>) -> FleetResult<Self> {
        let path = path.as_ref();

        let mut config = if fs::try_exists(path).await? {
            let contents = fs::read_to_string(path).await?;
            toml::from_str::<FleetConfig>(&contents)?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            FleetConfig::default()
        };

        if let Err(e) = dotenvy::dotenv() {
            tracing::trace!(error = %e, "no .env file loaded");
        }

        config.apply_env();
        config.validate()?;

        Ok(config)
    }

    /// Applies overrides from the process environment.
    pub fn apply_env(&mut self) {
        if let Ok(token) = env::var(API_TOKEN_ENV_VAR) {
            self.control_plane.api_token = token;
        }

        if let Ok(endpoint) = env::var(API_ENDPOINT_ENV_VAR) {
            self.control_plane.endpoint = endpoint;
        }

        if let Ok(path) = env::var(DATABASE_ENV_VAR) {
            self.store.database_path = PathBuf::from(path);
        }
    }

    /// Checks that the configured values can be used.
    pub fn validate(&self) -> FleetResult<()> {
        if self.control_plane.endpoint.is_empty() {
            return Err(FleetError::Config("control_plane.endpoint is empty".into()));
        }

        if self.control_plane.base_delay_ms > self.control_plane.max_delay_ms {
            return Err(FleetError::Config(
                "control_plane.base_delay_ms exceeds control_plane.max_delay_ms".into(),
            ));
        }

        if self.health.interval_secs == 0 {
            return Err(FleetError::Config("health.interval_secs must be > 0".into()));
        }

        if self.health.max_consecutive_failures == 0 {
            return Err(FleetError::Config(
                "health.max_consecutive_failures must be > 0".into(),
            ));
        }

        if self.health.paths.is_empty() {
            return Err(FleetError::Config("health.paths is empty".into()));
        }

        if self.lifecycle.provision_max_attempts == 0 {
            return Err(FleetError::Config(
                "lifecycle.provision_max_attempts must be > 0".into(),
            ));
        }

        if self.lifecycle.max_restart_attempts == 0 {
            return Err(FleetError::Config(
                "lifecycle.max_restart_attempts must be > 0".into(),
            ));
        }

        if self.lifecycle.cleanup_interval_secs == 0 {
            return Err(FleetError::Config(
                "lifecycle.cleanup_interval_secs must be > 0".into(),
            ));
        }

        Ok(())
    }
}

impl ControlPlaneConfig {
    /// The deadline of a single request.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl HealthConfig {
    /// The interval between checks.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// The deadline of a single probe.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl LifecycleConfig {
    /// Idle time after which a running sandbox is reclaimed.
    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_secs(self.inactivity_threshold_secs)
    }

    /// Base delay between provisioning attempts.
    pub fn provision_base_delay(&self) -> Duration {
        Duration::from_millis(self.provision_base_delay_ms)
    }

    /// Time between two inactivity sweeps.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl ArtifactConfig {
    /// How long a generated artifact stays cached.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_policy() {
        let config = FleetConfig::default();

        assert_eq!(config.get_control_plane().get_max_retries(), &3);
        assert_eq!(config.get_control_plane().get_base_delay_ms(), &1_000);
        assert_eq!(config.get_control_plane().get_max_delay_ms(), &10_000);
        assert_eq!(config.get_health().interval(), Duration::from_secs(30));
        assert_eq!(config.get_health().probe_timeout(), Duration::from_secs(10));
        assert_eq!(config.get_health().get_max_consecutive_failures(), &3);
        assert_eq!(
            config.get_lifecycle().inactivity_threshold(),
            Duration::from_secs(30 * 60)
        );
        assert_eq!(config.get_artifacts().ttl(), Duration::from_secs(3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() -> anyhow::Result<()> {
        let config: FleetConfig = toml::from_str(
            r#"
            [health]
            interval_secs = 5

            [lifecycle]
            auto_monitor = false
            "#,
        )?;

        assert_eq!(config.get_health().get_interval_secs(), &5);
        assert_eq!(config.get_health().get_paths().len(), 3);
        assert!(!config.get_lifecycle().get_auto_monitor());
        assert_eq!(config.get_lifecycle().get_provision_max_attempts(), &3);

        Ok(())
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = FleetConfig::builder()
            .health(HealthConfig::builder().interval_secs(0).build())
            .build();

        assert!(matches!(config.validate(), Err(FleetError::Config(_))));
    }

    #[tokio::test]
    async fn test_load_missing_file_uses_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = FleetConfig::load(dir.path().join("missing.toml")).await?;
        assert_eq!(config.get_lifecycle().get_max_restart_attempts(), &3);

        Ok(())
    }

    #[tokio::test]
    async fn test_load_reads_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(METROFLEET_CONFIG_FILENAME);
        fs::write(
            &path,
            r#"
            [control_plane]
            bundler_image = "example/metro:1"
            max_retries = 5
            "#,
        )
        .await?;

        let config = FleetConfig::load(&path).await?;
        assert_eq!(
            config.get_control_plane().get_bundler_image(),
            "example/metro:1"
        );
        assert_eq!(config.get_control_plane().get_max_retries(), &5);

        Ok(())
    }
}

use std::{path::PathBuf, sync::LazyLock};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The GraphQL endpoint of the control plane.
pub const DEFAULT_CONTROL_PLANE_ENDPOINT: &str = "https://backboard.railway.app/graphql/v2";

/// The container image every sandbox service runs.
pub const DEFAULT_BUNDLER_IMAGE: &str = "ghcr.io/expo/metro-sandbox:latest";

/// The name given to the bundler service inside a sandbox project.
pub const DEFAULT_SERVICE_NAME: &str = "metro";

/// The domain suffix used when a public domain cannot be resolved.
pub const DEFAULT_DOMAIN_SUFFIX: &str = "up.railway.app";

/// Environment variables every bundler service is created with.
pub const BUNDLER_ENV_VARS: &[(&str, &str)] = &[
    ("EXPO_DEVTOOLS_LISTEN_ADDRESS", "0.0.0.0"),
    ("REACT_NATIVE_PACKAGER_HOSTNAME", "0.0.0.0"),
];

/// Additional attempts made for a retryable control-plane failure.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// The base delay of the control-plane backoff, in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;

/// The ceiling of the control-plane backoff, in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 10_000;

/// The deadline of a single control-plane request, in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// How often a monitored sandbox is probed, in seconds.
pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;

/// The deadline of a single health probe, in seconds.
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;

/// Consecutive failed checks before a sandbox is reported as failing.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// The paths probed, in order, to decide whether the bundler is alive.
pub const DEFAULT_HEALTH_PATHS: &[&str] = &["/status", "/healthz", "/"];

/// How long a running sandbox may sit idle before it is reclaimed, in seconds.
pub const DEFAULT_INACTIVITY_THRESHOLD_SECS: u64 = 30 * 60;

/// Total attempts made to provision a sandbox.
pub const DEFAULT_PROVISION_MAX_ATTEMPTS: u32 = 3;

/// The base delay between provisioning attempts, in milliseconds.
pub const DEFAULT_PROVISION_BASE_DELAY_MS: u64 = 2_000;

/// Failures tolerated for one sandbox before it is marked as failed.
pub const DEFAULT_MAX_RESTART_ATTEMPTS: u32 = 3;

/// How often the inactivity sweep runs, in seconds.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 5 * 60;

/// How long a generated artifact stays cached, in seconds.
pub const DEFAULT_ARTIFACT_TTL_SECS: u64 = 60 * 60;

/// The side of a generated QR code, in pixels.
pub const DEFAULT_QR_SIZE: u32 = 300;

/// The quiet zone around a generated QR code, in modules.
pub const DEFAULT_QR_MARGIN: u32 = 4;

/// The name of the metrofleet home directory.
pub const METROFLEET_HOME_DIR: &str = ".metrofleet";

/// The name of the sandbox database file.
pub const SANDBOX_DB_FILENAME: &str = "sandboxes.db";

/// The default configuration filename.
pub const METROFLEET_CONFIG_FILENAME: &str = "metrofleet.toml";

/// Environment variable holding the control-plane API token.
pub const API_TOKEN_ENV_VAR: &str = "METROFLEET_API_TOKEN";

/// Environment variable overriding the control-plane endpoint.
pub const API_ENDPOINT_ENV_VAR: &str = "METROFLEET_API_ENDPOINT";

/// Environment variable overriding the sandbox database path.
pub const DATABASE_ENV_VAR: &str = "METROFLEET_DATABASE";

/// The default sandbox database path.
pub static DEFAULT_DATABASE_PATH: LazyLock<PathBuf> = LazyLock::new(|| {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(METROFLEET_HOME_DIR)
        .join(SANDBOX_DB_FILENAME)
});

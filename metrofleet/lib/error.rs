use std::{
    error::Error,
    fmt::{self, Display},
};
use thiserror::Error;

use crate::{health::FailureKind, models::SandboxStatus};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a metrofleet-related operation.
pub type FleetResult<T> = Result<T, FleetError>;

/// An error that occurred while operating the sandbox fleet.
#[derive(Debug, Error)]
pub enum FleetError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// A classified failure returned by the remote control plane.
    #[error("control plane error: {0}")]
    Remote(#[from] RemoteError),

    /// A remote resource no longer exists.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// No persisted sandbox record exists for the container.
    #[error("sandbox not found: {0}")]
    SandboxNotFound(String),

    /// A status change that the sandbox state machine does not allow.
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        /// The current status.
        from: SandboxStatus,

        /// The requested status.
        to: SandboxStatus,
    },

    /// A container id that is not of the form `{projectId}:{serviceId}`.
    #[error("invalid container id: {0}")]
    InvalidContainerId(String),

    /// The sandbox failed its health checks.
    #[error("sandbox unhealthy: {0}")]
    Unhealthy(String),

    /// The bundler process inside the sandbox failed.
    #[error("{kind} failure: {message}")]
    Application {
        /// The classified kind of failure.
        kind: FailureKind,

        /// The log line that triggered the classification.
        message: String,
    },

    /// The connection artifact could not be generated.
    #[error("artifact generation error: {0}")]
    Artifact(String),

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An error that occurred during a database operation.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An error that occurred while running database migrations.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// An error that occurred while (de)serializing JSON.
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// An error that occurred while parsing a TOML configuration file.
    #[error("toml error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

/// A failure reported by the control plane, classified for retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct RemoteError {
    /// Human readable description of the failure.
    pub message: String,

    /// The HTTP status code, when the failure came from an HTTP response.
    pub status_code: Option<u16>,

    /// Whether the call may succeed if attempted again.
    pub retryable: bool,
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FleetError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> FleetError {
        FleetError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Whether recovery by restarting the sandbox is worth attempting.
    pub fn is_retryable(&self) -> bool {
        match self {
            FleetError::Remote(e) => e.retryable,
            FleetError::Application { kind, .. } => kind.is_recoverable(),
            FleetError::Unhealthy(_) | FleetError::Io(_) | FleetError::JoinError(_) => true,
            _ => false,
        }
    }

    /// The HTTP status code behind this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            FleetError::Remote(e) => e.status_code,
            _ => None,
        }
    }
}

impl RemoteError {
    /// A failure that may succeed on a later attempt.
    pub fn transient(message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self {
            message: message.into(),
            status_code,
            retryable: true,
        }
    }

    /// A failure that will not succeed no matter how often it is attempted.
    pub fn permanent(message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self {
            message: message.into(),
            status_code,
            retryable: false,
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (status {code})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(FleetError::Remote(RemoteError::transient("boom", Some(503))).is_retryable());
        assert!(!FleetError::Remote(RemoteError::permanent("nope", Some(404))).is_retryable());
        assert!(!FleetError::NotFound("project p1".into()).is_retryable());
        assert!(FleetError::Unhealthy("3 failed probes".into()).is_retryable());
        assert!(FleetError::Application {
            kind: FailureKind::Network,
            message: "ECONNREFUSED".into(),
        }
        .is_retryable());
        assert!(!FleetError::Application {
            kind: FailureKind::Oom,
            message: "out of memory".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_remote_error_display() {
        let err = RemoteError::transient("service unavailable", Some(503));
        assert_eq!(err.to_string(), "service unavailable (status 503)");
        assert_eq!(FleetError::from(err).status_code(), Some(503));
    }
}

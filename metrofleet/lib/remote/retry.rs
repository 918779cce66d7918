use std::time::Duration;

use rand::Rng;
use reqwest::{header::RETRY_AFTER, Response, StatusCode};
use reqwest_retry::{default_on_request_failure, Retryable, RetryableStrategy};

use crate::config::ControlPlaneConfig;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The largest share of a backoff delay added as random jitter.
const MAX_JITTER_RATIO: f64 = 0.25;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Exponential backoff for control-plane calls.
///
/// The delay before retry `n` (starting at 0) is `min(base * 2^n, max)` plus up to 25% jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub max_retries: u32,

    /// The delay before the first retry.
    pub base_delay: Duration,

    /// The ceiling of the exponential part of the delay.
    pub max_delay: Duration,
}

/// Decides which control-plane responses are worth retrying.
///
/// 5xx and 429 responses and network-layer failures are transient. Every other 4xx is fatal.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlPlaneRetryStrategy;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RetryPolicy {
    /// Creates a policy from the control-plane configuration.
    pub fn from_config(config: &ControlPlaneConfig) -> Self {
        Self {
            max_retries: *config.get_max_retries(),
            base_delay: Duration::from_millis(*config.get_base_delay_ms()),
            max_delay: Duration::from_millis(*config.get_max_delay_ms()),
        }
    }

    /// The delay before retry `attempt` without jitter.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// The delay before retry `attempt`, jitter included.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.base_backoff(attempt);
        let jitter = rand::thread_rng().gen_range(0.0..=MAX_JITTER_RATIO);
        delay + delay.mul_f64(jitter)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Reads a `Retry-After` header expressed in seconds.
pub fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Classifies an HTTP status code. `None` means success.
pub fn classify_status(status: StatusCode) -> Option<Retryable> {
    if status.is_success() {
        None
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Some(Retryable::Transient)
    } else {
        Some(Retryable::Fatal)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ControlPlaneConfig::default())
    }
}

impl RetryableStrategy for ControlPlaneRetryStrategy {
    fn handle(
        &self,
        res: &Result<Response, reqwest_middleware::Error>,
    ) -> Option<Retryable> {
        match res {
            Ok(response) => classify_status(response.status()),
            Err(error) => default_on_request_failure(error),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

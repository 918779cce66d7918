use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::Mutex,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::HealthConfig,
    store::{KeyValueStore, MemoryStore},
};

use super::{HealthProbe, HttpProbe};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The outcome of the latest health check of a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthState {
    /// Whether one of the candidate paths answered with a 2xx.
    pub healthy: bool,

    /// When the check finished.
    pub last_check: DateTime<Utc>,

    /// How long the check took, in milliseconds.
    pub response_time_ms: u64,

    /// Failed checks in a row for the probed URL.
    pub consecutive_failures: u32,

    /// The last failure observed, when unhealthy.
    pub error: Option<String>,
}

/// Per-container monitoring settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Time between two checks.
    pub interval: Duration,

    /// Consecutive failures from which `on_error` fires on every check.
    pub max_consecutive_failures: u32,
}

/// Polls sandbox health endpoints on a fixed interval.
///
/// Each monitored container gets its own tokio task. Ticks of one container are serialized:
/// a tick starts only after the previous one (callbacks included) has finished.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    probe: Arc<dyn HealthProbe>,
    paths: Vec<String>,
    probe_timeout: Duration,
    defaults: MonitorConfig,
    failures: Arc<dyn KeyValueStore<u32>>,
    states: Arc<dyn KeyValueStore<HealthState>>,
    monitors: Mutex<HashMap<String, MonitorHandle>>,
}

struct MonitorHandle {
    url: String,
    cancel: CancellationToken,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Receives the outcome of every monitoring tick.
#[async_trait]
pub trait HealthCallbacks: Send + Sync {
    /// Called after every check.
    async fn on_health_check(&self, _state: &HealthState) {}

    /// Called when a check succeeds after one or more failures.
    async fn on_recovery(&self) {}

    /// Called on every check once the failure threshold has been reached.
    async fn on_error(&self, _message: &str) {}
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HealthMonitor {
    /// Creates a monitor that probes over HTTP and keeps its state in memory.
    pub fn new(config: &HealthConfig) -> Self {
        Self::with_probe(config, Arc::new(HttpProbe::new()))
    }

    /// Creates a monitor using a custom probe.
    pub fn with_probe(config: &HealthConfig, probe: Arc<dyn HealthProbe>) -> Self {
        Self::with_stores(config, probe, MemoryStore::shared(), MemoryStore::shared())
    }

    /// Creates a monitor using a custom probe and state backends.
    ///
    /// `failures` is keyed by URL, `states` by container id.
    pub fn with_stores(
        config: &HealthConfig,
        probe: Arc<dyn HealthProbe>,
        failures: Arc<dyn KeyValueStore<u32>>,
        states: Arc<dyn KeyValueStore<HealthState>>,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                probe,
                paths: config.get_paths().clone(),
                probe_timeout: config.probe_timeout(),
                defaults: MonitorConfig {
                    interval: config.interval(),
                    max_consecutive_failures: *config.get_max_consecutive_failures(),
                },
                failures,
                states,
                monitors: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The settings used when `start_monitoring` is not given any.
    pub fn default_config(&self) -> MonitorConfig {
        self.inner.defaults
    }

    /// Checks `url` once.
    ///
    /// Candidate paths are tried in order and the first 2xx wins. The failure counter of `url`
    /// is reset on success and incremented by exactly one when every candidate fails.
    pub async fn check_health(&self, url: &str) -> HealthState {
        let base = url.trim_end_matches('/');
        let started = Instant::now();
        let mut last_error = None;

        for path in &self.inner.paths {
            let target = format!("{base}{path}");
            match self.inner.probe.probe(&target, self.inner.probe_timeout).await {
                Ok(()) => {
                    self.inner.failures.set(url, 0).await;
                    return HealthState {
                        healthy: true,
                        last_check: Utc::now(),
                        response_time_ms: elapsed_ms(started),
                        consecutive_failures: 0,
                        error: None,
                    };
                }
                Err(e) => {
                    tracing::debug!(url = %target, error = %e, "health probe failed");
                    last_error = Some(e);
                }
            }
        }

        let failures = self.inner.failures.get(url).await.unwrap_or(0) + 1;
        self.inner.failures.set(url, failures).await;

        HealthState {
            healthy: false,
            last_check: Utc::now(),
            response_time_ms: elapsed_ms(started),
            consecutive_failures: failures,
            error: Some(last_error.unwrap_or_else(|| "no health paths configured".to_string())),
        }
    }

    /// Starts checking `url` on behalf of `container_id`.
    ///
    /// The first check happens one interval from now. A container that is already monitored
    /// has its previous monitor stopped first.
    pub async fn start_monitoring(
        &self,
        container_id: &str,
        url: &str,
        callbacks: Arc<dyn HealthCallbacks>,
        config: Option<MonitorConfig>,
    ) {
        let config = config.unwrap_or(self.inner.defaults);
        let cancel = CancellationToken::new();

        {
            let mut monitors = self.inner.monitors.lock().await;
            if let Some(previous) = monitors.insert(
                container_id.to_string(),
                MonitorHandle {
                    url: url.to_string(),
                    cancel: cancel.clone(),
                },
            ) {
                previous.cancel.cancel();
                tracing::debug!(container_id, "replaced existing health monitor");
            }
        }

        tracing::info!(
            container_id,
            url,
            interval_secs = config.interval.as_secs(),
            "starting health monitor"
        );

        tokio::spawn(run_monitor(
            Arc::downgrade(&self.inner),
            container_id.to_string(),
            url.to_string(),
            callbacks,
            config,
            cancel,
        ));
    }

    /// Stops monitoring `container_id` and drops its state. Unknown ids are ignored.
    ///
    /// A check already in flight is allowed to finish but its result is discarded.
    pub async fn stop_monitoring(&self, container_id: &str) {
        let handle = self.inner.monitors.lock().await.remove(container_id);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            self.inner.states.delete(container_id).await;
            self.inner.failures.delete(&handle.url).await;
            tracing::info!(container_id, "stopped health monitor");
        }
    }

    /// Stops every monitor.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.inner.monitors.lock().await.keys().cloned().collect();
        for id in ids {
            self.stop_monitoring(&id).await;
        }
    }

    /// The latest recorded state of a monitored container.
    pub async fn get_status(&self, container_id: &str) -> Option<HealthState> {
        self.inner.states.get(container_id).await
    }

    /// Whether `container_id` is currently monitored.
    pub async fn is_monitoring(&self, container_id: &str) -> bool {
        self.inner.monitors.lock().await.contains_key(container_id)
    }

    async fn tick(
        &self,
        container_id: &str,
        url: &str,
        callbacks: &dyn HealthCallbacks,
        config: &MonitorConfig,
        cancel: &CancellationToken,
    ) {
        let previous = self.inner.states.get(container_id).await;
        let state = self.check_health(url).await;

        if cancel.is_cancelled() {
            // The counter was already cleared by `stop_monitoring`; undo this check's write
            // unless a live monitor still owns the url.
            let owned = self
                .inner
                .monitors
                .lock()
                .await
                .values()
                .any(|handle| handle.url == url);
            if !owned {
                self.inner.failures.delete(url).await;
            }
            return;
        }

        self.inner.states.set(container_id, state.clone()).await;
        callbacks.on_health_check(&state).await;

        if state.healthy && previous.is_some_and(|p| p.consecutive_failures > 0) {
            tracing::info!(container_id, "sandbox recovered");
            callbacks.on_recovery().await;
        }

        if state.consecutive_failures >= config.max_consecutive_failures {
            let message = format!(
                "health check failed {} consecutive times: {}",
                state.consecutive_failures,
                state.error.as_deref().unwrap_or("unknown error")
            );
            tracing::warn!(container_id, url, "{message}");
            callbacks.on_error(&message).await;
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn run_monitor(
    inner: Weak<MonitorInner>,
    container_id: String,
    url: String,
    callbacks: Arc<dyn HealthCallbacks>,
    config: MonitorConfig,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                let monitor = HealthMonitor { inner };
                monitor
                    .tick(&container_id, &url, callbacks.as_ref(), &config, &cancel)
                    .await;
            }
        }
    }

    tracing::debug!(container_id, "health monitor task exited");
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

    use super::*;

    /// Fails every request while `healthy` is false.
    #[derive(Default)]
    struct ScriptedProbe {
        healthy: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, url: &str, _timeout: Duration) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) && url.ends_with("/healthz") {
                Ok(())
            } else {
                Err("HTTP 502 Bad Gateway".to_string())
            }
        }
    }

    #[derive(Default)]
    struct Counting {
        checks: AtomicU32,
        recoveries: AtomicU32,
        errors: AtomicU32,
        first_error_at_check: AtomicU32,
    }

    #[async_trait]
    impl HealthCallbacks for Counting {
        async fn on_health_check(&self, _state: &HealthState) {
            self.checks.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_recovery(&self) {
            self.recoveries.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_error(&self, _message: &str) {
            if self.errors.fetch_add(1, Ordering::SeqCst) == 0 {
                self.first_error_at_check
                    .store(self.checks.load(Ordering::SeqCst), Ordering::SeqCst);
            }
        }
    }

    fn monitor(probe: Arc<ScriptedProbe>) -> HealthMonitor {
        HealthMonitor::with_probe(&HealthConfig::default(), probe)
    }

    #[tokio::test]
    async fn test_check_health_counts_one_failure_per_check() {
        let probe = Arc::new(ScriptedProbe::default());
        let monitor = monitor(probe.clone());
        let url = "https://metro.example.com";

        let first = monitor.check_health(url).await;
        assert!(!first.healthy);
        assert_eq!(first.consecutive_failures, 1);
        assert_eq!(first.error.as_deref(), Some("HTTP 502 Bad Gateway"));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);

        let second = monitor.check_health(url).await;
        assert_eq!(second.consecutive_failures, 2);

        probe.healthy.store(true, Ordering::SeqCst);
        let third = monitor.check_health(url).await;
        assert!(third.healthy);
        assert_eq!(third.consecutive_failures, 0);
        assert_eq!(third.error, None);

        probe.healthy.store(false, Ordering::SeqCst);
        assert_eq!(monitor.check_health(url).await.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_failure_counters_are_per_url() {
        let probe = Arc::new(ScriptedProbe::default());
        let monitor = monitor(probe);

        monitor.check_health("https://a.example.com").await;
        monitor.check_health("https://a.example.com").await;
        let b = monitor.check_health("https://b.example.com").await;
        assert_eq!(b.consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_error_fires_on_every_tick_past_threshold() {
        let probe = Arc::new(ScriptedProbe::default());
        let monitor = monitor(probe);
        let callbacks = Arc::new(Counting::default());
        let config = MonitorConfig {
            interval: Duration::from_secs(30),
            max_consecutive_failures: 3,
        };

        monitor
            .start_monitoring(
                "p1:s1",
                "https://metro.example.com",
                callbacks.clone(),
                Some(config),
            )
            .await;
        assert!(monitor.is_monitoring("p1:s1").await);

        time::sleep(Duration::from_secs(5 * 30 + 5)).await;

        assert_eq!(callbacks.checks.load(Ordering::SeqCst), 5);
        assert_eq!(callbacks.errors.load(Ordering::SeqCst), 3);
        assert_eq!(callbacks.first_error_at_check.load(Ordering::SeqCst), 3);
        assert_eq!(callbacks.recoveries.load(Ordering::SeqCst), 0);

        let state = monitor.get_status("p1:s1").await.unwrap();
        assert_eq!(state.consecutive_failures, 5);

        monitor.stop_monitoring("p1:s1").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_callback_after_failures() {
        let probe = Arc::new(ScriptedProbe::default());
        let monitor = monitor(probe.clone());
        let callbacks = Arc::new(Counting::default());

        monitor
            .start_monitoring("p1:s1", "https://metro.example.com", callbacks.clone(), None)
            .await;

        time::sleep(Duration::from_secs(65)).await;
        assert_eq!(callbacks.checks.load(Ordering::SeqCst), 2);

        probe.healthy.store(true, Ordering::SeqCst);
        time::sleep(Duration::from_secs(60)).await;

        assert_eq!(callbacks.checks.load(Ordering::SeqCst), 4);
        assert_eq!(callbacks.recoveries.load(Ordering::SeqCst), 1);
        assert_eq!(callbacks.errors.load(Ordering::SeqCst), 0);
        assert!(monitor.get_status("p1:s1").await.unwrap().healthy);

        monitor.stop_monitoring("p1:s1").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_monitoring_cancels_future_ticks() {
        let probe = Arc::new(ScriptedProbe::default());
        let monitor = monitor(probe);
        let callbacks = Arc::new(Counting::default());

        monitor
            .start_monitoring("p1:s1", "https://metro.example.com", callbacks.clone(), None)
            .await;
        time::sleep(Duration::from_secs(35)).await;
        assert_eq!(callbacks.checks.load(Ordering::SeqCst), 1);

        monitor.stop_monitoring("p1:s1").await;
        assert!(!monitor.is_monitoring("p1:s1").await);
        assert_eq!(monitor.get_status("p1:s1").await, None);

        time::sleep(Duration::from_secs(120)).await;
        assert_eq!(callbacks.checks.load(Ordering::SeqCst), 1);

        // Unknown ids are a no-op.
        monitor.stop_monitoring("unknown").await;
    }

    /// Fails every request after a delay.
    struct SlowEndpoint;

    #[async_trait]
    impl HealthProbe for SlowEndpoint {
        async fn probe(&self, _url: &str, _timeout: Duration) -> Result<(), String> {
            time::sleep(Duration::from_secs(10)).await;
            Err("connection failed".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_in_flight_at_stop_leaves_no_failure_count() {
        let failures: Arc<MemoryStore<u32>> = MemoryStore::shared();
        let monitor = HealthMonitor::with_stores(
            &HealthConfig::default(),
            Arc::new(SlowEndpoint),
            failures.clone(),
            MemoryStore::shared(),
        );
        let callbacks = Arc::new(Counting::default());
        let url = "https://metro.example.com";

        monitor
            .start_monitoring("p1:s1", url, callbacks.clone(), None)
            .await;

        // The first check starts at 30s and is still waiting on its first path.
        time::sleep(Duration::from_secs(35)).await;
        monitor.stop_monitoring("p1:s1").await;
        assert_eq!(failures.get(url).await, None);

        time::sleep(Duration::from_secs(120)).await;
        assert_eq!(failures.get(url).await, None);
        assert_eq!(monitor.get_status("p1:s1").await, None);
        assert_eq!(callbacks.checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarting_monitor_does_not_duplicate_ticks() {
        let probe = Arc::new(ScriptedProbe::default());
        let monitor = monitor(probe);
        let callbacks = Arc::new(Counting::default());

        for _ in 0..3 {
            monitor
                .start_monitoring("p1:s1", "https://metro.example.com", callbacks.clone(), None)
                .await;
        }

        time::sleep(Duration::from_secs(95)).await;
        assert_eq!(callbacks.checks.load(Ordering::SeqCst), 3);

        monitor.stop_all().await;
        assert!(!monitor.is_monitoring("p1:s1").await);
    }
}

//! Per-host failure tracking with a half-open retry window.
//!
//! Why: stop dialing a host that keeps failing, but keep probing it.
//! - Consecutive failures up to a threshold flip the tracker unhealthy.
//! - While unhealthy, one attempt is allowed per check interval; the window
//!   slides on every reported failure.
//! - Any success is a full recovery. No gradual half-measures.
use crate::metrics::{MetricEvent, MetricsSink, NoopMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

#[derive(Debug)]
struct Inner {
    consecutive_failures: u32,
    last_failure: Option<std::time::Instant>,
    state: HealthState,
}

/// Tracks one host's recent behavior and gates new connection attempts.
pub struct ServerHealthTracker {
    error_threshold: u32,
    check_interval: std::time::Duration,
    inner: std::sync::Mutex<Inner>,
    // Mirror of `inner.state` so `is_healthy` never takes the lock.
    healthy: std::sync::atomic::AtomicBool,
    metrics: std::sync::Arc<dyn MetricsSink>,
}

impl ServerHealthTracker {
    pub fn new(error_threshold: u32, check_interval: std::time::Duration) -> Self {
        Self::with_metrics(error_threshold, check_interval, std::sync::Arc::new(NoopMetrics))
    }

    pub fn with_metrics(
        error_threshold: u32,
        check_interval: std::time::Duration,
        metrics: std::sync::Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            error_threshold: error_threshold.max(1),
            check_interval,
            inner: std::sync::Mutex::new(Inner {
                consecutive_failures: 0,
                last_failure: None,
                state: HealthState::Healthy,
            }),
            healthy: std::sync::atomic::AtomicBool::new(true),
            metrics,
        }
    }

    /// Record one failed attempt against this host.
    ///
    /// The failure timestamp is updated even while already unhealthy so the
    /// retry window keeps sliding behind an actively failing host.
    pub fn report_failure(&self) {
        let mut inner = self.lock();
        inner.last_failure = Some(std::time::Instant::now());

        if inner.state == HealthState::Healthy {
            inner.consecutive_failures += 1;
            if inner.consecutive_failures >= self.error_threshold {
                inner.state = HealthState::Unhealthy;
                self.healthy
                    .store(false, std::sync::atomic::Ordering::Release);
                tracing::warn!(
                    failures = inner.consecutive_failures,
                    "server marked unhealthy"
                );
                self.metrics
                    .record(MetricEvent::HealthChanged { healthy: false });
            }
        }
    }

    /// Record one successful interaction; unconditionally recovers.
    pub fn report_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        if inner.state == HealthState::Unhealthy {
            inner.state = HealthState::Healthy;
            self.healthy
                .store(true, std::sync::atomic::Ordering::Release);
            tracing::info!("server recovered");
            self.metrics
                .record(MetricEvent::HealthChanged { healthy: true });
        }
    }

    /// Whether a new connection attempt is worth making right now.
    ///
    /// Healthy: always. Unhealthy: only once the check interval has elapsed
    /// since the last failure (a probe).
    pub fn should_try_connection(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            HealthState::Healthy => true,
            HealthState::Unhealthy => match inner.last_failure {
                Some(at) => at.elapsed() >= self.check_interval,
                None => true,
            },
        }
    }

    /// Lock-free view, consistent with the last completed transition.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(std::sync::atomic::Ordering::Acquire)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for ServerHealthTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHealthTracker")
            .field("healthy", &self.is_healthy())
            .field("error_threshold", &self.error_threshold)
            .field("check_interval", &self.check_interval)
            .finish()
    }
}

//! Metric events emitted by the engine.
//!
//! Events are fire-and-forget: producers record and move on, never waiting
//! on the sink. The default sink discards everything, so instrumentation
//! costs nothing unless wired up.

/// Events the engine reports while running.
#[derive(Debug, Clone)]
pub enum MetricEvent {
    /// A host's health tracker changed state.
    HealthChanged { healthy: bool },
    /// A new transport was dialed successfully.
    ConnectionOpened,
    /// An idle pooled connection was handed out again.
    ConnectionReused,
    /// A connection left the pool for good.
    ConnectionClosed { reason: CloseReason },
    /// A `get` gave up waiting for pool capacity.
    PoolExhausted,
    /// A batch accumulator closed and was handed to an executor.
    BatchCompleted { size: usize, trigger: BatchTrigger },
    /// One job finished, with the handler's wall-clock duration.
    JobFinished {
        outcome: OutcomeKind,
        duration: std::time::Duration,
    },
    /// Time a job spent waiting for an executor permit.
    ExecutorWait { duration: std::time::Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Connection outlived its configured max age.
    Expired,
    /// Returned with an error, or drained after a health flip.
    Errored,
    /// The pool was disposed.
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchTrigger {
    Size,
    Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Complete,
    TransientFailure,
    PermanentFailure,
}

impl From<&crate::job::JobOutcome> for OutcomeKind {
    fn from(outcome: &crate::job::JobOutcome) -> Self {
        match outcome {
            crate::job::JobOutcome::Complete(_) => OutcomeKind::Complete,
            crate::job::JobOutcome::TransientFailure => OutcomeKind::TransientFailure,
            crate::job::JobOutcome::PermanentFailure => OutcomeKind::PermanentFailure,
        }
    }
}

/// Where metric events land.
///
/// Implementations must be cheap and non-blocking; the engine calls this
/// from hot paths.
pub trait MetricsSink: Send + Sync + 'static {
    fn record(&self, event: MetricEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _event: MetricEvent) {}
}

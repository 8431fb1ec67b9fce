//! Time/size-windowed batch accumulation, optionally partitioned by key.
//!
//! Why: group bursts of small jobs into one handler call without holding any
//! job hostage.
//! - An accumulator closes when it reaches the configured size or when its
//!   window elapses, whichever comes first.
//! - A poll with no job still sweeps the timers, so a lone job never waits
//!   past its window.
//! - Closed accumulators are recycled through a free list; no allocation per
//!   batch in steady state.
use crate::job::{ConnectionId, JobAssignment};
use crate::metrics::{BatchTrigger, MetricEvent, MetricsSink, NoopMetrics};

/// Batching rules for one function.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    function: String,
    size: usize,
    time_limit: std::time::Duration,
    keyed: bool,
}

impl BatchOptions {
    pub fn new(
        function: impl Into<String>,
        size: usize,
        time_limit: std::time::Duration,
    ) -> Self {
        Self {
            function: function.into(),
            size: size.max(1),
            time_limit,
            keyed: false,
        }
    }

    /// Partition accumulators by the job's batch key.
    pub fn keyed(self, keyed: bool) -> Self {
        Self { keyed, ..self }
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn time_limit(&self) -> std::time::Duration {
        self.time_limit
    }
}

/// One closed accumulator, ready for execution as a unit.
///
/// Jobs keep arrival order and each remembers its originating connection so
/// outcomes can be routed back individually.
#[derive(Debug)]
pub struct BatchJob {
    pub function: String,
    pub batch_key: Option<String>,
    pub jobs: Vec<(ConnectionId, JobAssignment)>,
}

#[derive(Debug)]
struct BatchData {
    batch_key: Option<String>,
    jobs: Vec<(ConnectionId, JobAssignment)>,
    created_at: std::time::Instant,
}

impl BatchData {
    fn empty(now: std::time::Instant) -> Self {
        Self {
            batch_key: None,
            jobs: Vec::new(),
            created_at: now,
        }
    }

    fn reset(&mut self, batch_key: Option<String>, now: std::time::Instant) {
        self.batch_key = batch_key;
        self.jobs.clear();
        self.created_at = now;
    }
}

#[derive(Debug, Default)]
struct State {
    pending: Vec<BatchData>,
    free: Vec<BatchData>,
}

/// Per-function accumulator set.
///
/// All mutation happens under one mutex; `try_get_jobs` never awaits while
/// holding it.
pub struct BatchJobManager {
    options: BatchOptions,
    state: std::sync::Mutex<State>,
    metrics: std::sync::Arc<dyn MetricsSink>,
}

impl BatchJobManager {
    pub fn new(options: BatchOptions) -> Self {
        Self::with_metrics(options, std::sync::Arc::new(NoopMetrics))
    }

    pub fn with_metrics(
        options: BatchOptions,
        metrics: std::sync::Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            options,
            state: std::sync::Mutex::new(State::default()),
            metrics,
        }
    }

    pub fn function(&self) -> &str {
        &self.options.function
    }

    /// Feed one poll result through the accumulators.
    ///
    /// `job` may be `None` ("no new job, just check timers"). Returns the
    /// wake-up hint for the earliest open window (never more than the
    /// configured limit, `None` when nothing is pending) plus every batch
    /// that closed during this call.
    pub fn try_get_jobs(
        &self,
        connection: ConnectionId,
        job: Option<JobAssignment>,
    ) -> (Option<std::time::Duration>, Vec<BatchJob>) {
        let now = std::time::Instant::now();
        let mut pending_job = job.filter(|j| j.function() == self.options.function);
        let mut state = self.lock();

        // A job for this function joins the newest open accumulator whose
        // key matches (any accumulator when unkeyed).
        if let Some(candidate) = pending_job.as_ref() {
            let wanted = candidate.batch_key().map(str::to_owned);
            let target = state.pending.iter_mut().rev().find(|acc| {
                !self.options.keyed || acc.batch_key.as_deref() == wanted.as_deref()
            });
            if let Some(acc) = target {
                if let Some(candidate) = pending_job.take() {
                    acc.jobs.push((connection, candidate));
                }
            }
        }

        // Sweep every open accumulator: close the full and the expired ones,
        // remember the tightest remaining window among the rest.
        let mut closed = Vec::new();
        let mut min_remaining: Option<std::time::Duration> = None;
        let mut index = state.pending.len();
        while index > 0 {
            index -= 1;
            let elapsed = now.saturating_duration_since(state.pending[index].created_at);
            let by_size = state.pending[index].jobs.len() >= self.options.size;
            if by_size || elapsed >= self.options.time_limit {
                let trigger = if by_size {
                    BatchTrigger::Size
                } else {
                    BatchTrigger::Time
                };
                closed.push((state.pending.remove(index), trigger));
            } else {
                let remaining = self.options.time_limit - elapsed;
                min_remaining = Some(min_remaining.map_or(remaining, |m| m.min(remaining)));
            }
        }

        // A job that matched nothing seeds a fresh accumulator.
        if let Some(candidate) = pending_job.take() {
            let key = if self.options.keyed {
                candidate.batch_key().map(str::to_owned)
            } else {
                None
            };
            let mut data = match state.free.pop() {
                Some(data) => data,
                None => BatchData::empty(now),
            };
            data.reset(key, now);
            data.jobs.push((connection, candidate));
            state.pending.push(data);
        }

        let timeout = if state.pending.is_empty() {
            None
        } else {
            Some(
                min_remaining
                    .unwrap_or(self.options.time_limit)
                    .min(self.options.time_limit),
            )
        };

        let mut batches = Vec::with_capacity(closed.len());
        for (mut data, trigger) in closed {
            let jobs = std::mem::take(&mut data.jobs);
            let batch_key = data.batch_key.take();
            self.metrics.record(MetricEvent::BatchCompleted {
                size: jobs.len(),
                trigger,
            });
            state.free.push(data);
            batches.push(BatchJob {
                function: self.options.function.clone(),
                batch_key,
                jobs,
            });
        }

        (timeout, batches)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for BatchJobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchJobManager")
            .field("options", &self.options)
            .finish()
    }
}

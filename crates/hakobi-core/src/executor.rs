//! Synchronous and asynchronous job execution.
//!
//! Why: one place owns completion.
//! - Whatever happens inside a handler (success, partial answer, panic), the
//!   job's originating connection hears back exactly once.
//! - The asynchronous executor caps in-flight work with a semaphore whose
//!   permit lives inside the spawned task; it cannot leak.
//! - `wait_all` takes a snapshot: it drains what was running when called,
//!   not work submitted afterwards.
use futures::FutureExt as _;

use crate::handler::HandlerLease;
use crate::job::{ConnectionId, ExecutionResult, JobAssignment, JobCompletion, JobOutcome};
use crate::metrics::{MetricEvent, MetricsSink, NoopMetrics};

/// Per-connection completion callback. Must be cheap; the executor calls it
/// from its own tasks.
pub type ResultCallback = std::sync::Arc<dyn Fn(JobCompletion) + Send + Sync>;

/// Work ready to run: one job or one closed batch, with its resolved handler.
pub struct JobContext {
    lease: HandlerLease,
    kind: ContextKind,
}

enum ContextKind {
    Single {
        connection: ConnectionId,
        job: JobAssignment,
    },
    Batch {
        jobs: Vec<(ConnectionId, JobAssignment)>,
    },
}

impl JobContext {
    pub fn single(lease: HandlerLease, connection: ConnectionId, job: JobAssignment) -> Self {
        Self {
            lease,
            kind: ContextKind::Single { connection, job },
        }
    }

    /// Batch context; each job keeps its originating connection so outcomes
    /// route back individually.
    pub fn batch(lease: HandlerLease, jobs: Vec<(ConnectionId, JobAssignment)>) -> Self {
        Self {
            lease,
            kind: ContextKind::Batch { jobs },
        }
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ContextKind::Single { connection, job } => f
                .debug_struct("JobContext")
                .field("connection", connection)
                .field("handle", &job.handle())
                .finish(),
            ContextKind::Batch { jobs } => f
                .debug_struct("JobContext")
                .field("batch_len", &jobs.len())
                .finish(),
        }
    }
}

/// How execution futures are launched.
///
/// Implementations must start the future and let it run to completion even
/// if the returned handle is dropped; the handle is for observation only.
pub trait JobSpawner: Send + Sync + 'static {
    type Handle: Future<Output = ()> + Send + 'static;

    fn spawn<Fut>(fut: Fut) -> Self::Handle
    where
        Fut: Future<Output = ()> + Send + 'static;
}

/// Shared executor contract.
#[trait_variant::make(JobExecutor: Send)]
pub trait LocalJobExecutor {
    /// Run or launch `context`. A resolved result means the caller reports
    /// it; `Pending` means completion is (or was) delivered through the
    /// callback registry.
    #[allow(unused)]
    async fn execute(&self, context: JobContext) -> ExecutionResult;

    /// Route completions for `connection` through `callback`. Re-registering
    /// replaces the previous callback: last registration wins.
    fn register_result_callback(&self, connection: ConnectionId, callback: ResultCallback);

    /// Drop the callback for a connection that no longer exists. Later
    /// completions for it are logged and discarded.
    fn unregister_result_callback(&self, connection: ConnectionId);

    /// Wait for every execution active at call time to finish.
    #[allow(unused)]
    async fn wait_all(&self);
}

#[derive(Default)]
struct CallbackRegistry {
    callbacks: std::sync::Mutex<std::collections::HashMap<ConnectionId, ResultCallback>>,
}

impl CallbackRegistry {
    fn register(&self, connection: ConnectionId, callback: ResultCallback) {
        self.lock().insert(connection, callback);
    }

    fn unregister(&self, connection: ConnectionId) {
        self.lock().remove(&connection);
    }

    fn deliver(&self, connection: ConnectionId, completion: JobCompletion) {
        let callback = self.lock().get(&connection).cloned();
        match callback {
            Some(callback) => callback(completion),
            None => tracing::warn!(
                connection,
                handle = %completion.handle,
                "dropping completion: no result callback for connection"
            ),
        }
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, std::collections::HashMap<ConnectionId, ResultCallback>> {
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Drive a single-job handler future, converting panics into a permanent
/// failure.
async fn guarded_single(fut: futures::future::BoxFuture<'static, JobOutcome>) -> JobOutcome {
    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(_) => {
            tracing::error!("job handler panicked");
            JobOutcome::PermanentFailure
        }
    }
}

async fn guarded_batch(
    fut: futures::future::BoxFuture<'static, Vec<JobOutcome>>,
    len: usize,
) -> Vec<JobOutcome> {
    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(outcomes) => outcomes,
        Err(_) => {
            tracing::error!("batch handler panicked");
            vec![JobOutcome::PermanentFailure; len]
        }
    }
}

fn deliver_batch(
    callbacks: &CallbackRegistry,
    jobs: Vec<(ConnectionId, JobAssignment)>,
    outcomes: Vec<JobOutcome>,
    metrics: &dyn MetricsSink,
    duration: std::time::Duration,
) {
    let mut outcomes = outcomes.into_iter();
    for (connection, job) in jobs {
        // A handler that answered short fails the remainder closed.
        let outcome = outcomes.next().unwrap_or(JobOutcome::PermanentFailure);
        metrics.record(MetricEvent::JobFinished {
            outcome: (&outcome).into(),
            duration,
        });
        callbacks.deliver(
            connection,
            JobCompletion {
                handle: job.handle().to_owned(),
                function: job.function().to_owned(),
                outcome,
            },
        );
    }
}

/// Runs handlers inline on the calling task.
///
/// Single jobs come back as a resolved result; batches are delivered through
/// the callback registry because their jobs may belong to other connections.
#[derive(Clone)]
pub struct SyncExecutor {
    callbacks: std::sync::Arc<CallbackRegistry>,
    metrics: std::sync::Arc<dyn MetricsSink>,
}

impl SyncExecutor {
    pub fn new() -> Self {
        Self::with_metrics(std::sync::Arc::new(NoopMetrics))
    }

    pub fn with_metrics(metrics: std::sync::Arc<dyn MetricsSink>) -> Self {
        Self {
            callbacks: std::sync::Arc::new(CallbackRegistry::default()),
            metrics,
        }
    }
}

impl Default for SyncExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl JobExecutor for SyncExecutor {
    async fn execute(&self, context: JobContext) -> ExecutionResult {
        let JobContext { lease, kind } = context;
        let started = std::time::Instant::now();
        match kind {
            ContextKind::Single { connection: _, job } => {
                let outcome = guarded_single(lease.call_single(job.payload().to_vec())).await;
                self.metrics.record(MetricEvent::JobFinished {
                    outcome: (&outcome).into(),
                    duration: started.elapsed(),
                });
                ExecutionResult::Resolved(outcome)
            }
            ContextKind::Batch { jobs } => {
                let payloads = jobs.iter().map(|(_, job)| job.payload().to_vec()).collect();
                let outcomes = guarded_batch(lease.call_batch(payloads), jobs.len()).await;
                deliver_batch(
                    &self.callbacks,
                    jobs,
                    outcomes,
                    self.metrics.as_ref(),
                    started.elapsed(),
                );
                ExecutionResult::Pending
            }
        }
    }

    fn register_result_callback(&self, connection: ConnectionId, callback: ResultCallback) {
        self.callbacks.register(connection, callback);
    }

    fn unregister_result_callback(&self, connection: ConnectionId) {
        self.callbacks.unregister(connection);
    }

    async fn wait_all(&self) {}
}

type DoneSignal = futures::future::Shared<futures::channel::oneshot::Receiver<()>>;

/// Launches handlers on spawned tasks under a concurrency cap.
pub struct AsyncExecutor<Sp>
where
    Sp: JobSpawner,
{
    semaphore: std::sync::Arc<tokio::sync::Semaphore>,
    callbacks: std::sync::Arc<CallbackRegistry>,
    active: std::sync::Arc<std::sync::Mutex<std::collections::HashMap<u64, DoneSignal>>>,
    next_execution: std::sync::Arc<std::sync::atomic::AtomicU64>,
    metrics: std::sync::Arc<dyn MetricsSink>,
    marker: std::marker::PhantomData<fn() -> Sp>,
}

impl<Sp> Clone for AsyncExecutor<Sp>
where
    Sp: JobSpawner,
{
    fn clone(&self) -> Self {
        Self {
            semaphore: self.semaphore.clone(),
            callbacks: self.callbacks.clone(),
            active: self.active.clone(),
            next_execution: self.next_execution.clone(),
            metrics: self.metrics.clone(),
            marker: std::marker::PhantomData,
        }
    }
}

impl<Sp> AsyncExecutor<Sp>
where
    Sp: JobSpawner,
{
    pub fn new(max_concurrency: usize) -> Self {
        Self::with_metrics(max_concurrency, std::sync::Arc::new(NoopMetrics))
    }

    pub fn with_metrics(
        max_concurrency: usize,
        metrics: std::sync::Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            semaphore: std::sync::Arc::new(tokio::sync::Semaphore::new(max_concurrency.max(1))),
            callbacks: std::sync::Arc::new(CallbackRegistry::default()),
            active: std::sync::Arc::new(std::sync::Mutex::new(std::collections::HashMap::new())),
            next_execution: std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0)),
            metrics,
            marker: std::marker::PhantomData,
        }
    }

    /// Executions currently tracked (waiting tasks excluded).
    pub fn active_executions(&self) -> usize {
        self.lock_active().len()
    }

    fn lock_active(
        &self,
    ) -> std::sync::MutexGuard<'_, std::collections::HashMap<u64, DoneSignal>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<Sp> JobExecutor for AsyncExecutor<Sp>
where
    Sp: JobSpawner,
{
    async fn execute(&self, context: JobContext) -> ExecutionResult {
        let waiting = std::time::Instant::now();
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore closed unexpectedly");
        self.metrics.record(MetricEvent::ExecutorWait {
            duration: waiting.elapsed(),
        });

        let execution = self
            .next_execution
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (done_tx, done_rx) = futures::channel::oneshot::channel::<()>();
        self.lock_active().insert(execution, done_rx.shared());

        let callbacks = self.callbacks.clone();
        let active = self.active.clone();
        let metrics = self.metrics.clone();
        let JobContext { lease, kind } = context;

        let _handle = Sp::spawn(async move {
            let started = std::time::Instant::now();
            match kind {
                ContextKind::Single { connection, job } => {
                    let outcome =
                        guarded_single(lease.call_single(job.payload().to_vec())).await;
                    metrics.record(MetricEvent::JobFinished {
                        outcome: (&outcome).into(),
                        duration: started.elapsed(),
                    });
                    callbacks.deliver(
                        connection,
                        JobCompletion {
                            handle: job.handle().to_owned(),
                            function: job.function().to_owned(),
                            outcome,
                        },
                    );
                }
                ContextKind::Batch { jobs } => {
                    let payloads = jobs.iter().map(|(_, job)| job.payload().to_vec()).collect();
                    let outcomes = guarded_batch(lease.call_batch(payloads), jobs.len()).await;
                    deliver_batch(
                        &callbacks,
                        jobs,
                        outcomes,
                        metrics.as_ref(),
                        started.elapsed(),
                    );
                }
            }
            drop(lease);
            active
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&execution);
            drop(permit);
            let _ = done_tx.send(());
        });

        ExecutionResult::Pending
    }

    fn register_result_callback(&self, connection: ConnectionId, callback: ResultCallback) {
        self.callbacks.register(connection, callback);
    }

    fn unregister_result_callback(&self, connection: ConnectionId) {
        self.callbacks.unregister(connection);
    }

    async fn wait_all(&self) {
        let snapshot: Vec<_> = self.lock_active().values().cloned().collect();
        for done in snapshot {
            let _ = done.await;
        }
    }
}

impl<Sp> std::fmt::Debug for AsyncExecutor<Sp>
where
    Sp: JobSpawner,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncExecutor")
            .field("active", &self.active_executions())
            .field("free_permits", &self.semaphore.available_permits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerRegistry;
    use crate::handler::JobData;

    fn lease_for(registry: &HandlerRegistry, function: &str) -> HandlerLease {
        HandlerLease::shared(registry.get(function).expect("handler registered"))
    }

    fn assignment(handle: &str, function: &str, payload: &[u8]) -> JobAssignment {
        JobAssignment::new(handle, function, payload.to_vec())
    }

    fn recording_callback() -> (
        ResultCallback,
        std::sync::Arc<std::sync::Mutex<Vec<JobCompletion>>>,
    ) {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let callback = {
            let seen = seen.clone();
            std::sync::Arc::new(move |completion: JobCompletion| {
                seen.lock().unwrap().push(completion);
            }) as ResultCallback
        };
        (callback, seen)
    }

    async fn double(JobData(n): JobData<u64>) -> JobOutcome {
        JobOutcome::Complete((n * 2).to_string().into_bytes())
    }

    #[tokio::test]
    async fn sync_executor_resolves_single_jobs_inline() {
        let mut registry = HandlerRegistry::new();
        registry.register("double", double, ());
        let executor = SyncExecutor::new();

        let context = JobContext::single(
            lease_for(&registry, "double"),
            1,
            assignment("h1", "double", b"21"),
        );
        let result = JobExecutor::execute(&executor, context).await;
        assert_eq!(
            result,
            ExecutionResult::Resolved(JobOutcome::Complete(b"42".to_vec()))
        );
    }

    #[tokio::test]
    async fn sync_executor_delivers_batches_per_connection() {
        let mut registry = HandlerRegistry::new();
        registry.register("double", double, ());
        let executor = SyncExecutor::new();

        let (cb_a, seen_a) = recording_callback();
        let (cb_b, seen_b) = recording_callback();
        JobExecutor::register_result_callback(&executor,1, cb_a);
        JobExecutor::register_result_callback(&executor,2, cb_b);

        let context = JobContext::batch(
            lease_for(&registry, "double"),
            vec![
                (1, assignment("h1", "double", b"1")),
                (2, assignment("h2", "double", b"2")),
            ],
        );
        let result = JobExecutor::execute(&executor, context).await;
        assert_eq!(result, ExecutionResult::Pending);

        let a = seen_a.lock().unwrap();
        let b = seen_b.lock().unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].handle, "h1");
        assert_eq!(a[0].outcome, JobOutcome::Complete(b"2".to_vec()));
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].handle, "h2");
        assert_eq!(b[0].outcome, JobOutcome::Complete(b"4".to_vec()));
    }

    #[cfg(feature = "rt-tokio")]
    mod spawned {
        use super::*;
        use crate::TokioSpawner;

        async fn nap(JobData(()): JobData<()>) -> JobOutcome {
            crate::utils::sleep(std::time::Duration::from_millis(50)).await;
            JobOutcome::Complete(Vec::new())
        }

        #[tokio::test]
        async fn concurrency_cap_serializes_excess_jobs() {
            let mut registry = HandlerRegistry::new();
            registry.register("nap", nap, ());
            let executor = AsyncExecutor::<TokioSpawner>::new(2);

            let (callback, seen) = recording_callback();
            JobExecutor::register_result_callback(&executor,1, callback);

            let started = std::time::Instant::now();
            for n in 0..4 {
                let context = JobContext::single(
                    lease_for(&registry, "nap"),
                    1,
                    assignment(&format!("h{n}"), "nap", b"null"),
                );
                JobExecutor::execute(&executor, context).await;
            }
            JobExecutor::wait_all(&executor).await;
            let elapsed = started.elapsed();

            // Four 50ms jobs over two permits need two waves, not four.
            assert!(
                elapsed >= std::time::Duration::from_millis(95),
                "elapsed {elapsed:?}"
            );
            assert!(
                elapsed < std::time::Duration::from_millis(180),
                "jobs ran serially: {elapsed:?}"
            );

            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 4);
            let mut handles: Vec<_> = seen.iter().map(|c| c.handle.clone()).collect();
            handles.sort();
            assert_eq!(handles, ["h0", "h1", "h2", "h3"]);
        }

        #[tokio::test]
        async fn panicking_handler_still_reports_exactly_once() {
            async fn explode(JobData(()): JobData<()>) -> JobOutcome {
                panic!("boom");
            }

            let mut registry = HandlerRegistry::new();
            registry.register("explode", explode, ());
            let executor = AsyncExecutor::<TokioSpawner>::new(1);

            let (callback, seen) = recording_callback();
            JobExecutor::register_result_callback(&executor,9, callback);

            let context = JobContext::single(
                lease_for(&registry, "explode"),
                9,
                assignment("h1", "explode", b"null"),
            );
            JobExecutor::execute(&executor, context).await;
            JobExecutor::wait_all(&executor).await;

            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].outcome, JobOutcome::PermanentFailure);
            assert_eq!(executor.active_executions(), 0);
        }

        #[tokio::test]
        async fn batch_callbacks_fire_once_per_sub_job() {
            async fn sum_batch(JobData(items): JobData<Vec<u64>>) -> Vec<JobOutcome> {
                let total: u64 = items.iter().sum();
                items
                    .iter()
                    .map(|_| JobOutcome::Complete(total.to_string().into_bytes()))
                    .collect()
            }

            let mut registry = HandlerRegistry::new();
            registry.register_batch("sum", sum_batch, ());
            let executor = AsyncExecutor::<TokioSpawner>::new(4);

            let (cb_a, seen_a) = recording_callback();
            let (cb_b, seen_b) = recording_callback();
            JobExecutor::register_result_callback(&executor,1, cb_a);
            JobExecutor::register_result_callback(&executor,2, cb_b);

            let context = JobContext::batch(
                lease_for(&registry, "sum"),
                vec![
                    (1, assignment("h1", "sum", b"20")),
                    (2, assignment("h2", "sum", b"22")),
                ],
            );
            JobExecutor::execute(&executor, context).await;
            JobExecutor::wait_all(&executor).await;

            assert_eq!(seen_a.lock().unwrap().len(), 1);
            assert_eq!(seen_b.lock().unwrap().len(), 1);
            assert_eq!(
                seen_a.lock().unwrap()[0].outcome,
                JobOutcome::Complete(b"42".to_vec())
            );
        }

        #[tokio::test]
        async fn last_callback_registration_wins() {
            let mut registry = HandlerRegistry::new();
            registry.register("double", double, ());
            let executor = AsyncExecutor::<TokioSpawner>::new(1);

            let (stale, seen_stale) = recording_callback();
            let (fresh, seen_fresh) = recording_callback();
            JobExecutor::register_result_callback(&executor,1, stale);
            JobExecutor::register_result_callback(&executor,1, fresh);

            let context = JobContext::single(
                lease_for(&registry, "double"),
                1,
                assignment("h1", "double", b"3"),
            );
            JobExecutor::execute(&executor, context).await;
            JobExecutor::wait_all(&executor).await;

            assert!(seen_stale.lock().unwrap().is_empty());
            assert_eq!(seen_fresh.lock().unwrap().len(), 1);
        }
    }
}

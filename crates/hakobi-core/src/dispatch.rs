//! Routes each poll result to a batch manager, an executor, or a wake-up
//! hint.
//!
//! Why: the connection loop should not know about batching or concurrency.
//! It hands every poll here and obeys the answer: report an outcome, keep
//! going, or sleep for at most the returned window.
use crate::batch::BatchJobManager;
use crate::executor::{JobContext, JobExecutor};
use crate::handler::{HandlerLease, HandlerProvider};
use crate::job::{ConnectionId, ExecutionResult, JobAssignment, JobOutcome};

/// Shared coordinator for a group of connections.
///
/// Batch managers and the handler provider are fixed at construction; only
/// their interiors are synchronized.
pub struct JobManager<E>
where
    E: JobExecutor,
{
    batch_managers: Vec<BatchJobManager>,
    provider: std::sync::Arc<dyn HandlerProvider>,
    executor: E,
}

impl<E> JobManager<E>
where
    E: JobExecutor + Sync,
{
    pub fn new(
        provider: std::sync::Arc<dyn HandlerProvider>,
        executor: E,
        batch_managers: Vec<BatchJobManager>,
    ) -> Self {
        Self {
            batch_managers,
            provider,
            executor,
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Route one poll result.
    ///
    /// A job whose function is owned by a batch manager is absorbed there
    /// and never double-dispatched. Completed batches go to the executor
    /// fire-and-forget; the executor owns their completion. A plain job with
    /// no registered handler resolves permanently failed without touching
    /// the executor.
    pub async fn arrange_execution(
        &self,
        connection: ConnectionId,
        job: Option<JobAssignment>,
    ) -> ExecutionResult {
        let mut job = job;
        let mut min_timeout: Option<std::time::Duration> = None;
        let mut completed = Vec::new();

        for manager in &self.batch_managers {
            let owned = job
                .as_ref()
                .is_some_and(|j| j.function() == manager.function());
            let offer = if owned { job.take() } else { None };
            let (timeout, mut batches) = manager.try_get_jobs(connection, offer);
            if let Some(timeout) = timeout {
                min_timeout = Some(min_timeout.map_or(timeout, |m| m.min(timeout)));
            }
            completed.append(&mut batches);
        }

        for batch in completed {
            let lease = match self.provider.resolve(&batch.function) {
                Some(lease) => lease,
                None => {
                    tracing::warn!(
                        function = %batch.function,
                        "no handler for batched function; failing batch closed"
                    );
                    HandlerLease::fail_closed()
                }
            };
            self.executor
                .execute(JobContext::batch(lease, batch.jobs))
                .await;
        }

        let Some(job) = job else {
            return match min_timeout {
                Some(timeout) => ExecutionResult::Sleep(timeout),
                None => ExecutionResult::Pending,
            };
        };

        match self.provider.resolve(job.function()) {
            None => {
                tracing::warn!(
                    function = %job.function(),
                    handle = %job.handle(),
                    "unknown function; failing job permanently"
                );
                ExecutionResult::Resolved(JobOutcome::PermanentFailure)
            }
            Some(lease) => {
                let result = self
                    .executor
                    .execute(JobContext::single(lease, connection, job))
                    .await;
                result.fold_sleep(min_timeout)
            }
        }
    }
}

impl<E> std::fmt::Debug for JobManager<E>
where
    E: JobExecutor,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("batch_managers", &self.batch_managers.len())
            .finish()
    }
}

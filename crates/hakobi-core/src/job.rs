//! Job data model: assignments, outcomes, and the dispatch result contract.

/// Stable numeric identity of one transport connection.
///
/// Completions are routed back through the callback registered under this id,
/// so it must stay stable for the lifetime of the connection.
pub type ConnectionId = u64;

/// One job assignment as issued by the server.
///
/// Immutable once decoded from the wire. The `correlation_id`/`batch_key`
/// pair comes from the composite unique-id field when the submitter used it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobAssignment {
    handle: String,
    function: String,
    payload: Vec<u8>,
    correlation_id: Option<String>,
    batch_key: Option<String>,
}

impl JobAssignment {
    pub fn new(
        handle: impl Into<String>,
        function: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            handle: handle.into(),
            function: function.into(),
            payload,
            correlation_id: None,
            batch_key: None,
        }
    }

    /// Attach the decoded (correlation id, batch key) pair.
    pub fn with_correlation(
        self,
        correlation_id: impl Into<String>,
        batch_key: Option<String>,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            batch_key,
            ..self
        }
    }

    /// Opaque per-assignment handle used when reporting the outcome.
    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Partition key for keyed batching, when present.
    pub fn batch_key(&self) -> Option<&str> {
        self.batch_key.as_deref()
    }
}

/// Outcome a handler wants reported for one job.
///
/// Why: force explicitness. `TransientFailure` and `PermanentFailure` are
/// both failures on the wire; the distinction drives logging and metrics,
/// not local retries (redelivery is the server's call).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Finished; `Vec<u8>` is the response payload sent back to the server.
    Complete(Vec<u8>),
    /// Failed in a way that may succeed on redelivery.
    TransientFailure,
    /// Failed for good; also the fail-closed default for unset results and
    /// handler panics.
    PermanentFailure,
}

/// One finished job, as delivered to the per-connection result callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCompletion {
    pub handle: String,
    pub function: String,
    pub outcome: JobOutcome,
}

/// What a dispatch call has to say back to the connection loop.
///
/// An explicit sum type: either nothing (job is running elsewhere, or there
/// was nothing to do), a resolved outcome to report now, or a hint to wake
/// again once the earliest pending batch window closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// Nothing to report; the job (if any) runs asynchronously.
    Pending,
    /// The job finished inline; report this outcome now.
    Resolved(JobOutcome),
    /// Poll again after at most this long; a batch window is open.
    Sleep(std::time::Duration),
}

impl ExecutionResult {
    /// Smallest wake-up hint of the two results, preferring concrete
    /// outcomes over hints.
    pub(crate) fn fold_sleep(self, other: Option<std::time::Duration>) -> ExecutionResult {
        match (self, other) {
            (ExecutionResult::Pending, Some(timeout)) => ExecutionResult::Sleep(timeout),
            (ExecutionResult::Sleep(a), Some(b)) => ExecutionResult::Sleep(a.min(b)),
            (res, _) => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_sleep_prefers_shorter_window() {
        let res = ExecutionResult::Sleep(std::time::Duration::from_millis(500));
        let folded = res.fold_sleep(Some(std::time::Duration::from_millis(100)));
        assert_eq!(
            folded,
            ExecutionResult::Sleep(std::time::Duration::from_millis(100))
        );
    }

    #[test]
    fn fold_sleep_keeps_resolved_outcomes() {
        let res = ExecutionResult::Resolved(JobOutcome::PermanentFailure);
        let folded = res.fold_sleep(Some(std::time::Duration::from_millis(100)));
        assert_eq!(folded, ExecutionResult::Resolved(JobOutcome::PermanentFailure));
    }

    #[test]
    fn fold_sleep_pending_without_hint_stays_pending() {
        assert_eq!(
            ExecutionResult::Pending.fold_sleep(None),
            ExecutionResult::Pending
        );
    }
}

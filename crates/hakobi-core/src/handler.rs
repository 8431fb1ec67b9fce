//! Handler traits, the erased registry, and scoped resolution.
//!
//! Why: keep handler signatures honest and lookup explicit.
//! - The `M` marker decides which of [`JobData`] and [`WorkerContext`] a
//!   handler receives; dependencies stay visible in the signature.
//! - The registry is built once at startup and maps function names to
//!   type-erased handlers; no runtime introspection.
//! - [`HandlerProvider`] separates "which handler" from "how it is scoped";
//!   a scoped lease runs its release hook on drop, unconditionally.
use futures::FutureExt as _;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;

use crate::job::JobOutcome;

/// Trait implemented by functions that process one job.
///
/// Payloads are JSON; the associated [`Data`](JobHandler::Data) type is
/// decoded from the assignment's payload bytes before the call.
pub trait JobHandler<M>: Send + Sync + Clone + 'static {
    /// The payload type this handler expects.
    type Data: DeserializeOwned + Send + 'static;
    /// Shared context cloned into every call.
    type Context: Send + 'static;

    /// Future returned by the handler.
    type Future: Future<Output = JobOutcome> + Send + 'static;

    fn call(self, data: Self::Data, context: Self::Context) -> Self::Future;
}

/// Trait implemented by functions that process a closed batch as a unit.
///
/// Jobs arrive in arrival order. The returned vector pairs up with the input
/// by position; any job left unanswered fails closed.
pub trait BatchJobHandler<M>: Send + Sync + Clone + 'static {
    type Data: DeserializeOwned + Send + 'static;
    type Context: Send + 'static;
    type Future: Future<Output = Vec<JobOutcome>> + Send + 'static;

    fn call(self, data: Vec<Self::Data>, context: Self::Context) -> Self::Future;
}

/// Explicitly opt in to receive the payload.
pub struct JobData<T>(pub T);

/// Explicitly opt in to receive shared context (pools, config, ...).
pub struct WorkerContext<S>(pub S);

impl<F, Fut> JobHandler<()> for F
where
    F: FnOnce() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = JobOutcome> + Send + 'static,
{
    type Data = serde_json::Value;
    type Context = ();
    type Future = Fut;

    fn call(self, _data: Self::Data, _context: Self::Context) -> Self::Future {
        self()
    }
}

impl<F, Fut, T> JobHandler<JobData<T>> for F
where
    T: DeserializeOwned + Send + 'static,
    F: FnOnce(JobData<T>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = JobOutcome> + Send + 'static,
{
    type Data = T;
    type Context = ();
    type Future = Fut;

    fn call(self, data: Self::Data, _context: Self::Context) -> Self::Future {
        self(JobData(data))
    }
}

impl<F, Fut, S> JobHandler<WorkerContext<S>> for F
where
    S: Send + 'static,
    F: FnOnce(WorkerContext<S>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = JobOutcome> + Send + 'static,
{
    type Data = serde_json::Value;
    type Context = S;
    type Future = Fut;

    fn call(self, _data: Self::Data, context: Self::Context) -> Self::Future {
        self(WorkerContext(context))
    }
}

impl<F, Fut, T, S> JobHandler<(JobData<T>, WorkerContext<S>)> for F
where
    T: DeserializeOwned + Send + 'static,
    S: Send + 'static,
    F: FnOnce(JobData<T>, WorkerContext<S>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = JobOutcome> + Send + 'static,
{
    type Data = T;
    type Context = S;
    type Future = Fut;

    fn call(self, data: Self::Data, context: Self::Context) -> Self::Future {
        self(JobData(data), WorkerContext(context))
    }
}

impl<F, Fut, T> BatchJobHandler<JobData<T>> for F
where
    T: DeserializeOwned + Send + 'static,
    F: FnOnce(JobData<Vec<T>>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Vec<JobOutcome>> + Send + 'static,
{
    type Data = T;
    type Context = ();
    type Future = Fut;

    fn call(self, data: Vec<Self::Data>, _context: Self::Context) -> Self::Future {
        self(JobData(data))
    }
}

impl<F, Fut, T, S> BatchJobHandler<(JobData<T>, WorkerContext<S>)> for F
where
    T: DeserializeOwned + Send + 'static,
    S: Send + 'static,
    F: FnOnce(JobData<Vec<T>>, WorkerContext<S>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Vec<JobOutcome>> + Send + 'static,
{
    type Data = T;
    type Context = S;
    type Future = Fut;

    fn call(self, data: Vec<Self::Data>, context: Self::Context) -> Self::Future {
        self(JobData(data), WorkerContext(context))
    }
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, serde_json::Error> {
    // An absent payload decodes like JSON null so `()` and `Option<_>`
    // handlers accept empty jobs.
    if payload.is_empty() {
        serde_json::from_slice(b"null")
    } else {
        serde_json::from_slice(payload)
    }
}

/// Type-erased handler as stored in the registry.
pub trait ErasedJobHandler: Send + Sync + 'static {
    fn call_single(&self, payload: Vec<u8>) -> BoxFuture<'static, JobOutcome>;
    fn call_batch(&self, payloads: Vec<Vec<u8>>) -> BoxFuture<'static, Vec<JobOutcome>>;
}

struct SingleEntry<F, M>
where
    F: JobHandler<M>,
{
    handler: F,
    context: F::Context,
    marker: std::marker::PhantomData<fn() -> M>,
}

impl<F, M> ErasedJobHandler for SingleEntry<F, M>
where
    F: JobHandler<M>,
    F::Context: Clone + Send + Sync,
    M: 'static,
{
    fn call_single(&self, payload: Vec<u8>) -> BoxFuture<'static, JobOutcome> {
        match decode::<F::Data>(&payload) {
            Ok(data) => self.handler.clone().call(data, self.context.clone()).boxed(),
            Err(error) => {
                tracing::warn!(error = %error, "cannot decode job payload");
                futures::future::ready(JobOutcome::PermanentFailure).boxed()
            }
        }
    }

    fn call_batch(&self, payloads: Vec<Vec<u8>>) -> BoxFuture<'static, Vec<JobOutcome>> {
        // A plain handler asked to take a batch: run the jobs one by one,
        // keeping order.
        let calls: Vec<_> = payloads
            .into_iter()
            .map(|payload| self.call_single(payload))
            .collect();
        async move {
            let mut outcomes = Vec::with_capacity(calls.len());
            for call in calls {
                outcomes.push(call.await);
            }
            outcomes
        }
        .boxed()
    }
}

struct BatchEntry<F, M>
where
    F: BatchJobHandler<M>,
{
    handler: F,
    context: F::Context,
    marker: std::marker::PhantomData<fn() -> M>,
}

impl<F, M> ErasedJobHandler for BatchEntry<F, M>
where
    F: BatchJobHandler<M>,
    F::Context: Clone + Send + Sync,
    M: 'static,
{
    fn call_single(&self, payload: Vec<u8>) -> BoxFuture<'static, JobOutcome> {
        let fut = self.call_batch(vec![payload]);
        async move {
            fut.await
                .into_iter()
                .next()
                .unwrap_or(JobOutcome::PermanentFailure)
        }
        .boxed()
    }

    fn call_batch(&self, payloads: Vec<Vec<u8>>) -> BoxFuture<'static, Vec<JobOutcome>> {
        let mut outcomes = vec![JobOutcome::PermanentFailure; payloads.len()];
        let mut slots = Vec::with_capacity(payloads.len());
        let mut decoded = Vec::with_capacity(payloads.len());
        for (index, payload) in payloads.iter().enumerate() {
            match decode::<F::Data>(payload) {
                Ok(data) => {
                    slots.push(index);
                    decoded.push(data);
                }
                Err(error) => {
                    tracing::warn!(error = %error, "cannot decode job payload");
                }
            }
        }

        if decoded.is_empty() {
            return futures::future::ready(outcomes).boxed();
        }

        let fut = self.handler.clone().call(decoded, self.context.clone());
        async move {
            let results = fut.await;
            // Positional pairing; whatever the handler left unanswered stays
            // a permanent failure.
            for (slot, outcome) in slots.into_iter().zip(results) {
                outcomes[slot] = outcome;
            }
            outcomes
        }
        .boxed()
    }
}

/// Built once at startup: function name to erased handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: std::collections::HashMap<String, std::sync::Arc<dyn ErasedJobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a per-job handler for `function`.
    pub fn register<F, M>(
        &mut self,
        function: impl Into<String>,
        handler: F,
        context: F::Context,
    ) -> &mut Self
    where
        F: JobHandler<M>,
        F::Context: Clone + Send + Sync,
        M: 'static,
    {
        self.handlers.insert(
            function.into(),
            std::sync::Arc::new(SingleEntry {
                handler,
                context,
                marker: std::marker::PhantomData,
            }),
        );
        self
    }

    /// Register a whole-batch handler for `function`.
    pub fn register_batch<F, M>(
        &mut self,
        function: impl Into<String>,
        handler: F,
        context: F::Context,
    ) -> &mut Self
    where
        F: BatchJobHandler<M>,
        F::Context: Clone + Send + Sync,
        M: 'static,
    {
        self.handlers.insert(
            function.into(),
            std::sync::Arc::new(BatchEntry {
                handler,
                context,
                marker: std::marker::PhantomData,
            }),
        );
        self
    }

    pub fn get(&self, function: &str) -> Option<std::sync::Arc<dyn ErasedJobHandler>> {
        self.handlers.get(function).cloned()
    }

    /// Registered function names, for worker registration.
    pub fn functions(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("functions", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A resolved handler plus its scope.
///
/// Dropping the lease runs the release hook (if any), mirroring scoped
/// disposal without a container.
pub struct HandlerLease {
    handler: std::sync::Arc<dyn ErasedJobHandler>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl HandlerLease {
    /// Lease over a shared, unscoped handler.
    pub fn shared(handler: std::sync::Arc<dyn ErasedJobHandler>) -> Self {
        Self {
            handler,
            release: None,
        }
    }

    /// Lease that runs `release` once the job is done with the handler.
    pub fn scoped(
        handler: std::sync::Arc<dyn ErasedJobHandler>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            handler,
            release: Some(Box::new(release)),
        }
    }

    /// Lease whose handler fails every job permanently. Used where a result
    /// must still be delivered but no handler exists.
    pub(crate) fn fail_closed() -> Self {
        struct FailClosed;
        impl ErasedJobHandler for FailClosed {
            fn call_single(&self, _payload: Vec<u8>) -> BoxFuture<'static, JobOutcome> {
                futures::future::ready(JobOutcome::PermanentFailure).boxed()
            }
            fn call_batch(&self, payloads: Vec<Vec<u8>>) -> BoxFuture<'static, Vec<JobOutcome>> {
                futures::future::ready(vec![JobOutcome::PermanentFailure; payloads.len()]).boxed()
            }
        }
        Self::shared(std::sync::Arc::new(FailClosed))
    }

    pub(crate) fn call_single(&self, payload: Vec<u8>) -> BoxFuture<'static, JobOutcome> {
        self.handler.call_single(payload)
    }

    pub(crate) fn call_batch(&self, payloads: Vec<Vec<u8>>) -> BoxFuture<'static, Vec<JobOutcome>> {
        self.handler.call_batch(payloads)
    }
}

impl Drop for HandlerLease {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for HandlerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerLease")
            .field("scoped", &self.release.is_some())
            .finish()
    }
}

/// Maps a function name to a handler lease for one job.
pub trait HandlerProvider: Send + Sync + 'static {
    fn resolve(&self, function: &str) -> Option<HandlerLease>;
}

/// Shared handlers straight out of a registry; no per-job scope.
#[derive(Debug, Clone)]
pub struct SharedProvider {
    registry: std::sync::Arc<HandlerRegistry>,
}

impl SharedProvider {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry: std::sync::Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }
}

impl HandlerProvider for SharedProvider {
    fn resolve(&self, function: &str) -> Option<HandlerLease> {
        self.registry.get(function).map(HandlerLease::shared)
    }
}

/// Builds a fresh lease per job; the factory decides scope and release.
pub struct ScopedProvider<Fac> {
    factory: Fac,
}

impl<Fac> ScopedProvider<Fac>
where
    Fac: Fn(&str) -> Option<HandlerLease> + Send + Sync + 'static,
{
    pub fn new(factory: Fac) -> Self {
        Self { factory }
    }
}

impl<Fac> HandlerProvider for ScopedProvider<Fac>
where
    Fac: Fn(&str) -> Option<HandlerLease> + Send + Sync + 'static,
{
    fn resolve(&self, function: &str) -> Option<HandlerLease> {
        (self.factory)(function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn double(JobData(n): JobData<u64>) -> JobOutcome {
        JobOutcome::Complete((n * 2).to_string().into_bytes())
    }

    #[test]
    fn registry_decodes_and_calls_typed_handler() {
        let mut registry = HandlerRegistry::new();
        registry.register("double", double, ());

        let handler = registry.get("double").expect("registered");
        let outcome = futures::executor::block_on(handler.call_single(b"21".to_vec()));
        assert_eq!(outcome, JobOutcome::Complete(b"42".to_vec()));
    }

    #[test]
    fn undecodable_payload_fails_closed() {
        let mut registry = HandlerRegistry::new();
        registry.register("double", double, ());

        let handler = registry.get("double").expect("registered");
        let outcome = futures::executor::block_on(handler.call_single(b"not a number".to_vec()));
        assert_eq!(outcome, JobOutcome::PermanentFailure);
    }

    #[test]
    fn context_is_cloned_into_every_call() {
        async fn with_ctx(
            JobData(n): JobData<u64>,
            WorkerContext(base): WorkerContext<u64>,
        ) -> JobOutcome {
            JobOutcome::Complete((base + n).to_string().into_bytes())
        }

        let mut registry = HandlerRegistry::new();
        registry.register("add", with_ctx, 40u64);

        let handler = registry.get("add").expect("registered");
        let outcome = futures::executor::block_on(handler.call_single(b"2".to_vec()));
        assert_eq!(outcome, JobOutcome::Complete(b"42".to_vec()));
    }

    #[test]
    fn batch_handler_sees_whole_batch_in_order() {
        async fn sum_batch(JobData(items): JobData<Vec<u64>>) -> Vec<JobOutcome> {
            let total: u64 = items.iter().sum();
            items
                .iter()
                .map(|_| JobOutcome::Complete(total.to_string().into_bytes()))
                .collect()
        }

        let mut registry = HandlerRegistry::new();
        registry.register_batch("sum", sum_batch, ());

        let handler = registry.get("sum").expect("registered");
        let outcomes = futures::executor::block_on(
            handler.call_batch(vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]),
        );
        assert_eq!(outcomes, vec![JobOutcome::Complete(b"6".to_vec()); 3]);
    }

    #[test]
    fn short_batch_answer_fails_the_rest_closed() {
        async fn answer_one(JobData(items): JobData<Vec<u64>>) -> Vec<JobOutcome> {
            items
                .into_iter()
                .take(1)
                .map(|_| JobOutcome::Complete(Vec::new()))
                .collect()
        }

        let mut registry = HandlerRegistry::new();
        registry.register_batch("partial", answer_one, ());

        let handler = registry.get("partial").expect("registered");
        let outcomes =
            futures::executor::block_on(handler.call_batch(vec![b"1".to_vec(), b"2".to_vec()]));
        assert_eq!(
            outcomes,
            vec![JobOutcome::Complete(Vec::new()), JobOutcome::PermanentFailure]
        );
    }

    #[test]
    fn single_handler_runs_batches_job_by_job() {
        let mut registry = HandlerRegistry::new();
        registry.register("double", double, ());

        let handler = registry.get("double").expect("registered");
        let outcomes =
            futures::executor::block_on(handler.call_batch(vec![b"1".to_vec(), b"2".to_vec()]));
        assert_eq!(
            outcomes,
            vec![
                JobOutcome::Complete(b"2".to_vec()),
                JobOutcome::Complete(b"4".to_vec())
            ]
        );
    }

    #[test]
    fn scoped_lease_always_releases() {
        let released = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let registry = {
            let mut r = HandlerRegistry::new();
            r.register("double", double, ());
            std::sync::Arc::new(r)
        };

        let provider = ScopedProvider::new({
            let released = released.clone();
            move |function: &str| {
                let released = released.clone();
                registry
                    .get(function)
                    .map(|h| HandlerLease::scoped(h, move || {
                        released.store(true, std::sync::atomic::Ordering::SeqCst)
                    }))
            }
        });

        let lease = provider.resolve("double").expect("resolved");
        assert!(!released.load(std::sync::atomic::Ordering::SeqCst));
        drop(lease);
        assert!(released.load(std::sync::atomic::Ordering::SeqCst));
    }
}

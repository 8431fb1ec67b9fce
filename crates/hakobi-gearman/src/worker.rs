//! Worker engine: per-connection loops over the job-server protocol.
//!
//! Each configured connection runs "grab job, dispatch, sleep" forever:
//! results flow back through the executor's per-connection callback and are
//! written by the loop that owns the socket. Transport failures tear one
//! connection down and reconnect it on a fixed backoff, gated by the host's
//! health tracker; handler failures never do.
use futures::{FutureExt as _, StreamExt as _};

use crate::config::HostEndpoint;
use crate::protocol::{Packet, PacketType, UniqueId};
use crate::transport::{self, Transport};
use hakobi_core::batch::{BatchJobManager, BatchOptions};
use hakobi_core::dispatch::JobManager;
use hakobi_core::executor::{AsyncExecutor, JobExecutor, SyncExecutor};
use hakobi_core::handler::{BatchJobHandler, HandlerRegistry, JobHandler, SharedProvider};
use hakobi_core::health::ServerHealthTracker;
use hakobi_core::job::{ExecutionResult, JobAssignment, JobCompletion, JobOutcome};
use hakobi_core::metrics::{CloseReason, MetricEvent, MetricsSink, NoopMetrics};
use hakobi_core::TokioSpawner;

/// Builder for configuring and constructing [`Worker`] instances.
pub struct WorkerBuilder {
    endpoints: Vec<HostEndpoint>,
    connections_per_endpoint: usize,
    poll_delay: std::time::Duration,
    reconnect_timeout: std::time::Duration,
    max_concurrency: usize,
    health_error_threshold: u32,
    health_check_interval: std::time::Duration,
    registry: HandlerRegistry,
    batches: Vec<BatchOptions>,
    metrics: std::sync::Arc<dyn MetricsSink>,
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self {
            endpoints: Vec::new(),
            connections_per_endpoint: 1,
            poll_delay: std::time::Duration::from_millis(500),
            reconnect_timeout: std::time::Duration::from_secs(5),
            max_concurrency: 8,
            health_error_threshold: 5,
            health_check_interval: std::time::Duration::from_secs(10),
            registry: HandlerRegistry::new(),
            batches: Vec::new(),
            metrics: std::sync::Arc::new(NoopMetrics),
        }
    }

    /// Add one job server to poll.
    pub fn endpoint(mut self, endpoint: HostEndpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Concurrent connections per server.
    pub fn connections(self, connections_per_endpoint: usize) -> Self {
        Self {
            connections_per_endpoint: connections_per_endpoint.max(1),
            ..self
        }
    }

    /// Idle wait between polls when the server has nothing for us.
    pub fn poll_delay(self, poll_delay: std::time::Duration) -> Self {
        Self { poll_delay, ..self }
    }

    /// Fixed backoff between reconnect attempts.
    pub fn reconnect_timeout(self, reconnect_timeout: std::time::Duration) -> Self {
        Self {
            reconnect_timeout,
            ..self
        }
    }

    /// Maximum jobs in flight on the asynchronous executor.
    pub fn max_concurrency(self, max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            ..self
        }
    }

    /// Consecutive transport failures before a host is marked unhealthy.
    pub fn health_error_threshold(self, health_error_threshold: u32) -> Self {
        Self {
            health_error_threshold,
            ..self
        }
    }

    /// Probe window for an unhealthy host.
    pub fn health_check_interval(self, health_check_interval: std::time::Duration) -> Self {
        Self {
            health_check_interval,
            ..self
        }
    }

    pub fn metrics(self, metrics: std::sync::Arc<dyn MetricsSink>) -> Self {
        Self { metrics, ..self }
    }

    /// Register a per-job handler for `function`.
    pub fn handler<F, M>(mut self, function: &str, handler: F, context: F::Context) -> Self
    where
        F: JobHandler<M>,
        F::Context: Clone + Send + Sync,
        M: 'static,
    {
        self.registry.register(function, handler, context);
        self
    }

    /// Register a whole-batch handler and the batching rules that feed it.
    pub fn batch_handler<F, M>(
        mut self,
        options: BatchOptions,
        handler: F,
        context: F::Context,
    ) -> Self
    where
        F: BatchJobHandler<M>,
        F::Context: Clone + Send + Sync,
        M: 'static,
    {
        self.registry
            .register_batch(options.function(), handler, context);
        self.batches.push(options);
        self
    }

    /// Finalize with the spawning executor (the default).
    pub fn build(self) -> Worker<AsyncExecutor<TokioSpawner>> {
        let executor =
            AsyncExecutor::<TokioSpawner>::with_metrics(self.max_concurrency, self.metrics.clone());
        self.build_with_executor(executor)
    }

    /// Finalize with the inline executor: handlers run on the connection's
    /// own task, one at a time.
    pub fn build_inline(self) -> Worker<SyncExecutor> {
        let executor = SyncExecutor::with_metrics(self.metrics.clone());
        self.build_with_executor(executor)
    }

    pub fn build_with_executor<E>(self, executor: E) -> Worker<E>
    where
        E: JobExecutor + Clone + Send + Sync + 'static,
    {
        let functions: Vec<String> = self.registry.functions().map(str::to_owned).collect();
        if functions.is_empty() {
            tracing::warn!("worker built with no registered functions");
        }
        let provider = std::sync::Arc::new(SharedProvider::new(self.registry));
        let batch_managers = self
            .batches
            .into_iter()
            .map(|options| BatchJobManager::with_metrics(options, self.metrics.clone()))
            .collect();
        let manager = std::sync::Arc::new(JobManager::new(
            provider,
            executor.clone(),
            batch_managers,
        ));

        Worker {
            endpoints: self.endpoints,
            connections_per_endpoint: self.connections_per_endpoint,
            poll_delay: self.poll_delay,
            reconnect_timeout: self.reconnect_timeout,
            health_error_threshold: self.health_error_threshold,
            health_check_interval: self.health_check_interval,
            functions,
            manager,
            executor,
            metrics: self.metrics,
        }
    }
}

/// Polls job servers and executes assignments with registered handlers.
pub struct Worker<E>
where
    E: JobExecutor,
{
    endpoints: Vec<HostEndpoint>,
    connections_per_endpoint: usize,
    poll_delay: std::time::Duration,
    reconnect_timeout: std::time::Duration,
    health_error_threshold: u32,
    health_check_interval: std::time::Duration,
    functions: Vec<String>,
    manager: std::sync::Arc<JobManager<E>>,
    executor: E,
    metrics: std::sync::Arc<dyn MetricsSink>,
}

impl<E> Worker<E>
where
    E: JobExecutor + Clone + Send + Sync + 'static,
{
    /// Add a shutdown signal; in-flight jobs drain before `run` returns.
    pub fn with_graceful_shutdown<Signal>(
        self,
        signal: Signal,
    ) -> WorkerWithGracefulShutdown<E, Signal>
    where
        Signal: Future<Output = ()> + Send,
    {
        WorkerWithGracefulShutdown {
            worker: self,
            signal,
        }
    }

    /// Run every connection loop forever.
    pub async fn run(self) {
        self.run_until(std::future::pending::<()>()).await
    }

    async fn run_until<Signal>(self, signal: Signal)
    where
        Signal: Future<Output = ()> + Send,
    {
        let signal = signal.shared();
        let mut loops = Vec::new();
        for endpoint in &self.endpoints {
            let health = std::sync::Arc::new(ServerHealthTracker::with_metrics(
                self.health_error_threshold,
                self.health_check_interval,
                self.metrics.clone(),
            ));
            for _ in 0..self.connections_per_endpoint {
                loops.push(connection_loop(ConnectionSeat {
                    endpoint: endpoint.clone(),
                    health: health.clone(),
                    functions: self.functions.clone(),
                    manager: self.manager.clone(),
                    executor: self.executor.clone(),
                    poll_delay: self.poll_delay,
                    reconnect_timeout: self.reconnect_timeout,
                    metrics: self.metrics.clone(),
                    shutdown: signal.clone(),
                }));
            }
        }

        futures::future::join_all(loops).await;
        // Let already-dispatched asynchronous jobs finish.
        self.executor.wait_all().await;
    }
}

/// Worker variant that reacts to a shutdown signal and drains its executor.
pub struct WorkerWithGracefulShutdown<E, Signal>
where
    E: JobExecutor,
    Signal: Future<Output = ()> + Send,
{
    worker: Worker<E>,
    signal: Signal,
}

impl<E, Signal> WorkerWithGracefulShutdown<E, Signal>
where
    E: JobExecutor + Clone + Send + Sync + 'static,
    Signal: Future<Output = ()> + Send,
{
    pub async fn run(self) {
        self.worker.run_until(self.signal).await
    }
}

/// Everything one connection loop needs.
struct ConnectionSeat<E, Signal>
where
    E: JobExecutor,
    Signal: Future<Output = ()>,
{
    endpoint: HostEndpoint,
    health: std::sync::Arc<ServerHealthTracker>,
    functions: Vec<String>,
    manager: std::sync::Arc<JobManager<E>>,
    executor: E,
    poll_delay: std::time::Duration,
    reconnect_timeout: std::time::Duration,
    metrics: std::sync::Arc<dyn MetricsSink>,
    shutdown: futures::future::Shared<Signal>,
}

async fn connection_loop<E, Signal>(seat: ConnectionSeat<E, Signal>)
where
    E: JobExecutor + Clone + Send + Sync,
    Signal: Future<Output = ()>,
{
    loop {
        if seat.shutdown.clone().now_or_never().is_some() {
            return;
        }
        if !seat.health.should_try_connection() {
            if wait_or_shutdown(seat.reconnect_timeout, &seat.shutdown).await {
                return;
            }
            continue;
        }

        let mut transport = match Transport::connect(&seat.endpoint).await {
            Ok(transport) => transport,
            Err(error) => {
                seat.health.report_failure();
                tracing::warn!(
                    error = %error,
                    host = %seat.endpoint.host,
                    port = seat.endpoint.port,
                    "failed to connect to job server"
                );
                if wait_or_shutdown(seat.reconnect_timeout, &seat.shutdown).await {
                    return;
                }
                continue;
            }
        };
        seat.health.report_success();
        seat.metrics.record(MetricEvent::ConnectionOpened);

        let connection = transport.id();
        let (tx, mut completions) = futures::channel::mpsc::unbounded::<JobCompletion>();
        seat.executor.register_result_callback(
            connection,
            std::sync::Arc::new(move |completion| {
                let _ = tx.unbounded_send(completion);
            }),
        );

        let outcome = drive(
            &mut transport,
            &mut completions,
            &seat.functions,
            &seat.manager,
            seat.poll_delay,
            &seat.shutdown,
        )
        .await;
        seat.executor.unregister_result_callback(connection);

        match outcome {
            Ok(()) => return,
            Err(error) => {
                if error.is_transport() {
                    seat.health.report_failure();
                }
                seat.metrics.record(MetricEvent::ConnectionClosed {
                    reason: CloseReason::Errored,
                });
                tracing::warn!(
                    error = %error,
                    connection,
                    host = %seat.endpoint.host,
                    "connection failed; reconnecting"
                );
                if wait_or_shutdown(seat.reconnect_timeout, &seat.shutdown).await {
                    return;
                }
            }
        }
    }
}

/// Poll-dispatch loop over one live connection. `Ok(())` means shutdown was
/// observed; errors mean the transport is unusable.
async fn drive<E, Signal>(
    transport: &mut Transport,
    completions: &mut futures::channel::mpsc::UnboundedReceiver<JobCompletion>,
    functions: &[String],
    manager: &JobManager<E>,
    poll_delay: std::time::Duration,
    shutdown: &futures::future::Shared<Signal>,
) -> Result<(), transport::Error>
where
    E: JobExecutor + Sync,
    Signal: Future<Output = ()>,
{
    for function in functions {
        transport
            .send(&Packet::new(
                PacketType::CanDo,
                vec![function.as_bytes().to_vec()],
            ))
            .await?;
    }
    let connection = transport.id();

    loop {
        // Finished asynchronous work goes out before we ask for more.
        while let Ok(Some(completion)) = completions.try_next() {
            report(transport, completion).await?;
        }
        if shutdown.clone().now_or_never().is_some() {
            return Ok(());
        }

        transport
            .send(&Packet::new(PacketType::GrabJobUniq, Vec::new()))
            .await?;
        let reply = match transport.recv().await {
            Ok(reply) => reply,
            Err(error) if !error.is_transport() => {
                tracing::warn!(error = %error, connection, "bad frame; treating as no job");
                if wait_or_shutdown(poll_delay, shutdown).await {
                    return Ok(());
                }
                continue;
            }
            Err(error) => return Err(error),
        };

        match reply.kind {
            PacketType::JobAssign | PacketType::JobAssignUniq | PacketType::JobAssignAll => {
                let assignment = decode_assignment(&reply);
                let handle = assignment.handle().to_owned();
                let function = assignment.function().to_owned();
                match manager.arrange_execution(connection, Some(assignment)).await {
                    ExecutionResult::Resolved(outcome) => {
                        report(
                            transport,
                            JobCompletion {
                                handle,
                                function,
                                outcome,
                            },
                        )
                        .await?;
                    }
                    // Pending or a batch window hint: grab again right away;
                    // the hint matters only once the server runs dry.
                    ExecutionResult::Pending | ExecutionResult::Sleep(_) => {}
                }
            }
            PacketType::NoJob => {
                let hint = manager.arrange_execution(connection, None).await;
                let wait = match hint {
                    ExecutionResult::Sleep(window) => window.min(poll_delay),
                    _ => poll_delay,
                };
                transport
                    .send(&Packet::new(PacketType::PreSleep, Vec::new()))
                    .await?;

                // Doze until the server wakes us, finished work needs
                // reporting, shutdown fires, or the window closes.
                let finished = {
                    let wake = transport.recv_deadline(wait).fuse();
                    futures::pin_mut!(wake);
                    let mut stop = shutdown.clone().fuse();
                    let mut finished = None;
                    futures::select! {
                        woke = wake => match woke? {
                            Some(packet) if packet.kind == PacketType::Noop => {}
                            Some(packet) => {
                                tracing::debug!(kind = ?packet.kind, "unexpected packet while sleeping");
                            }
                            None => {}
                        },
                        completion = completions.next() => finished = completion,
                        _ = stop => return Ok(()),
                    }
                    finished
                };
                if let Some(completion) = finished {
                    report(transport, completion).await?;
                }
            }
            PacketType::Noop => {}
            PacketType::Error => {
                tracing::warn!(
                    code = %String::from_utf8_lossy(reply.arg(0)),
                    text = %String::from_utf8_lossy(reply.arg(1)),
                    "server reported an error"
                );
            }
            other => {
                tracing::warn!(kind = ?other, connection, "unexpected packet; ignoring");
            }
        }
    }
}

async fn report(
    transport: &mut Transport,
    completion: JobCompletion,
) -> Result<(), transport::Error> {
    let packet = match completion.outcome {
        JobOutcome::Complete(payload) => Packet::new(
            PacketType::WorkComplete,
            vec![completion.handle.into_bytes(), payload],
        ),
        JobOutcome::TransientFailure | JobOutcome::PermanentFailure => {
            Packet::new(PacketType::WorkFail, vec![completion.handle.into_bytes()])
        }
    };
    transport.send(&packet).await
}

fn decode_assignment(packet: &Packet) -> JobAssignment {
    let handle = String::from_utf8_lossy(packet.arg(0)).into_owned();
    let function = String::from_utf8_lossy(packet.arg(1)).into_owned();
    let (unique, payload) = match packet.kind {
        PacketType::JobAssignUniq => (Some(packet.arg(2)), packet.arg(3)),
        // JOB_ASSIGN_ALL carries a reducer field we do not use.
        PacketType::JobAssignAll => (Some(packet.arg(2)), packet.arg(4)),
        _ => (None, packet.arg(2)),
    };

    let assignment = JobAssignment::new(handle, function, payload.to_vec());
    match unique {
        Some(raw) if !raw.is_empty() => {
            let id = UniqueId::decode(&String::from_utf8_lossy(raw));
            assignment.with_correlation(id.correlation, id.batch_key)
        }
        _ => assignment,
    }
}

/// Sleep for `duration` unless shutdown fires first; true means shutdown.
async fn wait_or_shutdown<Signal>(
    duration: std::time::Duration,
    shutdown: &futures::future::Shared<Signal>,
) -> bool
where
    Signal: Future<Output = ()>,
{
    let nap = hakobi_core::utils::sleep(duration).fuse();
    futures::pin_mut!(nap);
    let mut stop = shutdown.clone().fuse();
    futures::select! {
        _ = nap => false,
        _ = stop => true,
    }
}

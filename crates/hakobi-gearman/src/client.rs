//! Client utilities for submitting jobs to one or more job servers.

use rand::Rng as _;
use serde::Serialize;

use crate::config::{HostEndpoint, ParseError, ServerConfig};
use crate::protocol::{Packet, PacketType, UniqueId};
use crate::transport::{TcpConnector, Transport};
use hakobi_core::pool::{self, ConnectionPool, PoolConfig, PooledConnection};

/// How the client spreads submissions across servers.
///
/// Unhealthy servers are deprioritized under every strategy; they stay last
/// in line so a probe can still reach them when nothing else is left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionStrategy {
    RoundRobin,
    Random,
    /// Always the first configured server, walking down the list on failure.
    PrimaryFailover,
}

/// Priority lane for a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    High,
    Low,
}

/// Configuration for one job submission.
///
/// The generic `T` is the payload, serialized as JSON before it goes on the
/// wire.
#[derive(Debug, Clone)]
pub struct SubmitJob<T> {
    data: T,
    correlation_id: Option<String>,
    batch_key: Option<String>,
    background: bool,
    priority: Priority,
}

impl<T> SubmitJob<T> {
    pub const fn new(data: T) -> Self {
        Self {
            data,
            correlation_id: None,
            batch_key: None,
            background: false,
            priority: Priority::Normal,
        }
    }

    /// Attach a client-side correlation id, carried in the unique-id field.
    pub fn correlation_id(self, correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..self
        }
    }

    /// Group this job with others sharing the key when the worker batches
    /// this function.
    pub fn batch_key(self, batch_key: impl Into<String>) -> Self {
        Self {
            batch_key: Some(batch_key.into()),
            ..self
        }
    }

    /// Detach from the result; the server queues and forgets us.
    pub fn background(self, background: bool) -> Self {
        Self { background, ..self }
    }

    pub fn priority(self, priority: Priority) -> Self {
        Self { priority, ..self }
    }

    pub fn into_inner(self) -> T {
        self.data
    }
}

impl<T> From<T> for SubmitJob<T> {
    fn from(value: T) -> Self {
        SubmitJob::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Categories of errors that can occur when submitting a job.
pub enum ErrorKind {
    /// Serialization of the job payload failed.
    Encode,
    /// No connection could be checked out of the pool.
    Pool,
    /// The exchange with the server failed mid-flight.
    Transport,
    /// The server answered, but not with `JOB_CREATED`.
    Server,
    /// The client was built with no endpoints.
    NoEndpoints,
}

#[derive(Debug)]
/// Error type returned by [`Client`] operations.
pub struct Error {
    kind: ErrorKind,
    inner: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn pool(error: pool::Error<crate::transport::Error>) -> Self {
        Self {
            kind: ErrorKind::Pool,
            inner: Box::new(error),
        }
    }

    fn transport(error: crate::transport::Error) -> Self {
        Self {
            kind: ErrorKind::Transport,
            inner: Box::new(error),
        }
    }

    fn server(inner: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            kind: ErrorKind::Server,
            inner: Box::new(inner),
        }
    }

    fn no_endpoints() -> Self {
        Self {
            kind: ErrorKind::NoEndpoints,
            inner: Box::new(NoEndpoints),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self {
            kind: ErrorKind::Encode,
            inner: Box::new(value),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref())
    }
}

#[derive(Debug)]
struct NoEndpoints;

impl std::fmt::Display for NoEndpoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("no job servers configured")
    }
}

impl std::error::Error for NoEndpoints {}

#[derive(Debug)]
struct ServerRefusal {
    code: String,
    text: String,
}

impl std::fmt::Display for ServerRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server error {}: {}", self.code, self.text)
    }
}

impl std::error::Error for ServerRefusal {}

#[derive(Debug)]
struct UnexpectedReply(PacketType);

impl std::fmt::Display for UnexpectedReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "expected JOB_CREATED, got {:?}", self.0)
    }
}

impl std::error::Error for UnexpectedReply {}

/// A handle used to submit jobs for one function to a set of job servers.
#[derive(Debug)]
pub struct Client<T> {
    function: std::borrow::Cow<'static, str>,
    pools: Vec<std::sync::Arc<ConnectionPool<TcpConnector>>>,
    strategy: DistributionStrategy,
    cursor: std::sync::atomic::AtomicUsize,
    data_type: std::marker::PhantomData<fn() -> T>,
}

impl<T> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            function: self.function.clone(),
            pools: self.pools.clone(),
            strategy: self.strategy,
            cursor: std::sync::atomic::AtomicUsize::new(0),
            data_type: std::marker::PhantomData,
        }
    }
}

impl<T> Client<T> {
    /// Create a client for `function` with default pool sizing.
    pub fn new(
        function: impl Into<std::borrow::Cow<'static, str>>,
        endpoints: impl IntoIterator<Item = HostEndpoint>,
    ) -> Self {
        Self::with_config(function, endpoints, PoolConfig::default())
    }

    pub fn with_config(
        function: impl Into<std::borrow::Cow<'static, str>>,
        endpoints: impl IntoIterator<Item = HostEndpoint>,
        config: PoolConfig,
    ) -> Self {
        let pools = endpoints
            .into_iter()
            .map(|endpoint| {
                std::sync::Arc::new(ConnectionPool::new(
                    TcpConnector::new(endpoint),
                    config.clone(),
                ))
            })
            .collect();
        Self {
            function: function.into(),
            pools,
            strategy: DistributionStrategy::RoundRobin,
            cursor: std::sync::atomic::AtomicUsize::new(0),
            data_type: std::marker::PhantomData,
        }
    }

    /// Build a client from `key=value;` connection strings, one per server,
    /// each carrying its own pool sizing.
    pub fn from_connection_strings<'a>(
        function: impl Into<std::borrow::Cow<'static, str>>,
        strings: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, ParseError> {
        let pools = strings
            .into_iter()
            .map(|raw| {
                let parsed: ServerConfig = raw.parse()?;
                Ok(std::sync::Arc::new(ConnectionPool::new(
                    TcpConnector::new(parsed.endpoint),
                    parsed.pool,
                )))
            })
            .collect::<Result<Vec<_>, ParseError>>()?;
        Ok(Self {
            function: function.into(),
            pools,
            strategy: DistributionStrategy::RoundRobin,
            cursor: std::sync::atomic::AtomicUsize::new(0),
            data_type: std::marker::PhantomData,
        })
    }

    /// Choose how submissions are spread across the configured servers.
    pub fn strategy(self, strategy: DistributionStrategy) -> Self {
        Self { strategy, ..self }
    }

    /// Close every pool; subsequent submissions fail.
    pub fn dispose(&self) {
        for pool in &self.pools {
            pool.dispose();
        }
    }

    fn selection_order(&self) -> Vec<usize> {
        let len = self.pools.len();
        let start = match self.strategy {
            DistributionStrategy::RoundRobin => {
                self.cursor
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                    % len
            }
            DistributionStrategy::Random => rand::rng().random_range(0..len),
            DistributionStrategy::PrimaryFailover => 0,
        };

        let rotated = (0..len).map(|offset| (start + offset) % len);
        let (healthy, unhealthy): (Vec<_>, Vec<_>) =
            rotated.partition(|&index| self.pools[index].is_healthy());
        healthy.into_iter().chain(unhealthy).collect()
    }
}

impl<T> Client<T>
where
    T: Serialize + Send + Sync + 'static,
{
    /// Submit one job; returns the server-assigned job handle.
    ///
    /// Walks the servers in strategy order until one accepts the job.
    /// Pool-level failures on one server are not retried there; the next
    /// server is tried instead.
    pub async fn submit(&self, job: impl Into<SubmitJob<T>>) -> Result<String, Error> {
        if self.pools.is_empty() {
            return Err(Error::no_endpoints());
        }
        let job = job.into();
        let payload = serde_json::to_vec(&job.data)?;
        let unique = match (&job.correlation_id, &job.batch_key) {
            (None, None) => String::new(),
            (correlation, batch_key) => UniqueId {
                correlation: correlation.clone().unwrap_or_default(),
                batch_key: batch_key.clone(),
            }
            .encode(),
        };
        let packet = Packet::new(
            submit_packet_type(job.priority, job.background),
            vec![
                self.function.as_bytes().to_vec(),
                unique.into_bytes(),
                payload,
            ],
        );

        let mut last_error = None;
        for index in self.selection_order() {
            match submit_via(&self.pools[index], &packet).await {
                Ok(handle) => return Ok(handle),
                Err(error) => {
                    tracing::warn!(
                        error = %error,
                        server = index,
                        function = %self.function,
                        "submission failed; trying next server"
                    );
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.unwrap_or_else(Error::no_endpoints))
    }
}

fn submit_packet_type(priority: Priority, background: bool) -> PacketType {
    match (priority, background) {
        (Priority::Normal, false) => PacketType::SubmitJob,
        (Priority::Normal, true) => PacketType::SubmitJobBg,
        (Priority::High, false) => PacketType::SubmitJobHigh,
        (Priority::High, true) => PacketType::SubmitJobHighBg,
        (Priority::Low, false) => PacketType::SubmitJobLow,
        (Priority::Low, true) => PacketType::SubmitJobLowBg,
    }
}

async fn submit_via(
    pool: &ConnectionPool<TcpConnector>,
    packet: &Packet,
) -> Result<String, Error> {
    let mut conn = pool.get().await.map_err(Error::pool)?;
    let result = exchange(&mut conn, packet).await;
    match result {
        Ok(handle) => {
            pool.put(conn, false);
            Ok(handle)
        }
        Err(error) => {
            pool.put(conn, true);
            Err(error)
        }
    }
}

async fn exchange(
    conn: &mut PooledConnection<Transport>,
    packet: &Packet,
) -> Result<String, Error> {
    conn.send(packet).await.map_err(Error::transport)?;
    let reply = conn.recv().await.map_err(Error::transport)?;
    match reply.kind {
        PacketType::JobCreated => Ok(String::from_utf8_lossy(reply.arg(0)).into_owned()),
        PacketType::Error => Err(Error::server(ServerRefusal {
            code: String::from_utf8_lossy(reply.arg(0)).into_owned(),
            text: String::from_utf8_lossy(reply.arg(1)).into_owned(),
        })),
        other => Err(Error::server(UnexpectedReply(other))),
    }
}

//! Bounded per-host connection pool with age eviction and breaker gating.
//!
//! Why: connections are expensive and servers fail.
//! - A semaphore caps how many connections exist at once; waiting for a
//!   permit is bounded by the configured timeout.
//! - Idle connections past their max age are discarded, never handed out.
//! - Dialing is gated by the host's [`ServerHealthTracker`]; a host that
//!   keeps failing is probed, not hammered.
//! - The permit travels inside the checked-out connection, so it is released
//!   exactly once on every path, including drops and panics.
use std::collections::VecDeque;

use crate::health::ServerHealthTracker;
use crate::metrics::{CloseReason, MetricEvent, MetricsSink, NoopMetrics};
use crate::utils;

/// Capability to dial one new transport to a fixed host.
#[trait_variant::make(Connector: Send)]
pub trait LocalConnector {
    type Connection: Send + 'static;
    type Error: std::error::Error + Send + 'static;

    #[allow(unused)]
    async fn connect(&self) -> Result<Self::Connection, Self::Error>;
}

/// Sizing and health rules for one pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on live connections (checked out + idle).
    pub max_connections: usize,
    /// Idle or returned connections older than this are closed.
    pub connection_max_age: std::time::Duration,
    /// How long `get` may wait for a free permit.
    pub new_connection_timeout: std::time::Duration,
    /// Consecutive failures before the host is marked unhealthy.
    pub health_error_threshold: u32,
    /// Probe window while unhealthy.
    pub health_check_interval: std::time::Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connection_max_age: std::time::Duration::from_secs(300),
            new_connection_timeout: std::time::Duration::from_secs(30),
            health_error_threshold: 5,
            health_check_interval: std::time::Duration::from_secs(10),
        }
    }
}

/// Failure modes of [`ConnectionPool::get`].
#[derive(Debug)]
pub enum Error<E> {
    /// Every permit stayed busy for the whole wait.
    Exhausted { waited: std::time::Duration },
    /// The host's breaker is open; no dial was attempted.
    Unhealthy,
    /// The pool has been disposed.
    Disposed,
    /// Dialing a new transport failed.
    Connect(E),
}

impl<E: std::fmt::Display> std::fmt::Display for Error<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Exhausted { waited } => {
                write!(f, "no pooled connection became free within {waited:?}")
            }
            Error::Unhealthy => f.write_str("host is unhealthy; connection attempt gated"),
            Error::Disposed => f.write_str("connection pool is disposed"),
            Error::Connect(inner) => write!(f, "failed to connect: {inner}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for Error<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connect(inner) => Some(inner),
            _ => None,
        }
    }
}

/// One checked-out connection.
///
/// Derefs to the underlying transport. Give it back with
/// [`ConnectionPool::put`]; simply dropping it closes the transport and
/// frees the permit, which is always safe but skips the health report.
#[derive(Debug)]
pub struct PooledConnection<C> {
    id: u64,
    created_at: std::time::Instant,
    conn: C,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl<C> PooledConnection<C> {
    /// Pool-assigned identity of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> std::time::Instant {
        self.created_at
    }
}

impl<C> std::ops::Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> std::ops::DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

#[derive(Debug)]
struct Idle<C> {
    id: u64,
    created_at: std::time::Instant,
    conn: C,
}

/// Bounded set of reusable connections to one host.
pub struct ConnectionPool<C>
where
    C: Connector,
{
    connector: C,
    config: PoolConfig,
    semaphore: std::sync::Arc<tokio::sync::Semaphore>,
    idle: std::sync::Mutex<VecDeque<Idle<C::Connection>>>,
    health: std::sync::Arc<ServerHealthTracker>,
    next_id: std::sync::atomic::AtomicU64,
    disposed: std::sync::atomic::AtomicBool,
    metrics: std::sync::Arc<dyn MetricsSink>,
}

impl<C> ConnectionPool<C>
where
    C: Connector + Sync,
{
    pub fn new(connector: C, config: PoolConfig) -> Self {
        Self::with_metrics(connector, config, std::sync::Arc::new(NoopMetrics))
    }

    pub fn with_metrics(
        connector: C,
        config: PoolConfig,
        metrics: std::sync::Arc<dyn MetricsSink>,
    ) -> Self {
        let health = std::sync::Arc::new(ServerHealthTracker::with_metrics(
            config.health_error_threshold,
            config.health_check_interval,
            metrics.clone(),
        ));
        Self {
            semaphore: std::sync::Arc::new(tokio::sync::Semaphore::new(
                config.max_connections.max(1),
            )),
            connector,
            config,
            idle: std::sync::Mutex::new(VecDeque::new()),
            health,
            next_id: std::sync::atomic::AtomicU64::new(0),
            disposed: std::sync::atomic::AtomicBool::new(false),
            metrics,
        }
    }

    /// Check out a connection, reusing a fresh idle one when possible.
    ///
    /// Waits up to `new_connection_timeout` for capacity. Cancellation
    /// (dropping the returned future) never leaks a permit.
    pub async fn get(&self) -> Result<PooledConnection<C::Connection>, Error<C::Error>> {
        if self.disposed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(Error::Disposed);
        }

        let waited = self.config.new_connection_timeout;
        let permit = match utils::timeout(waited, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            // The semaphore only closes on dispose.
            Ok(Err(_)) => return Err(Error::Disposed),
            Err(utils::Elapsed) => {
                self.metrics.record(MetricEvent::PoolExhausted);
                return Err(Error::Exhausted { waited });
            }
        };

        while let Some(idle) = self.pop_idle() {
            if idle.created_at.elapsed() < self.config.connection_max_age {
                self.metrics.record(MetricEvent::ConnectionReused);
                return Ok(PooledConnection {
                    id: idle.id,
                    created_at: idle.created_at,
                    conn: idle.conn,
                    _permit: permit,
                });
            }
            tracing::debug!(connection = idle.id, "discarding over-age idle connection");
            self.metrics.record(MetricEvent::ConnectionClosed {
                reason: CloseReason::Expired,
            });
        }

        if !self.health.should_try_connection() {
            return Err(Error::Unhealthy);
        }

        match self.connector.connect().await {
            Ok(conn) => {
                let id = self
                    .next_id
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.metrics.record(MetricEvent::ConnectionOpened);
                Ok(PooledConnection {
                    id,
                    created_at: std::time::Instant::now(),
                    conn,
                    _permit: permit,
                })
            }
            Err(error) => {
                self.health.report_failure();
                Err(Error::Connect(error))
            }
        }
    }

    /// Return a checked-out connection.
    ///
    /// `has_error` reports how the connection behaved: an errored connection
    /// is closed and counted against the host, and a health flip drains the
    /// idle set rather than handing out doomed connections. A clean return
    /// within its max age goes back on the idle list.
    pub fn put(&self, conn: PooledConnection<C::Connection>, has_error: bool) {
        let PooledConnection {
            id,
            created_at,
            conn,
            _permit,
        } = conn;

        if self.disposed.load(std::sync::atomic::Ordering::Acquire) {
            drop(conn);
            self.metrics.record(MetricEvent::ConnectionClosed {
                reason: CloseReason::Disposed,
            });
            return;
        }

        if has_error {
            drop(conn);
            self.metrics.record(MetricEvent::ConnectionClosed {
                reason: CloseReason::Errored,
            });
            self.health.report_failure();
            if !self.health.is_healthy() {
                self.drain_idle(CloseReason::Errored);
            }
            return;
        }

        self.health.report_success();
        if created_at.elapsed() < self.config.connection_max_age {
            self.push_idle(Idle {
                id,
                created_at,
                conn,
            });
        } else {
            drop(conn);
            self.metrics.record(MetricEvent::ConnectionClosed {
                reason: CloseReason::Expired,
            });
        }
    }

    /// Close everything and fail all future (and pending) `get`s.
    ///
    /// Idempotent. Connections still checked out are closed when returned.
    pub fn dispose(&self) {
        if self.disposed.swap(true, std::sync::atomic::Ordering::AcqRel) {
            return;
        }
        self.semaphore.close();
        self.drain_idle(CloseReason::Disposed);
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    pub fn health(&self) -> std::sync::Arc<ServerHealthTracker> {
        self.health.clone()
    }

    pub fn idle_connections(&self) -> usize {
        self.lock_idle().len()
    }

    fn pop_idle(&self) -> Option<Idle<C::Connection>> {
        self.lock_idle().pop_back()
    }

    fn push_idle(&self, idle: Idle<C::Connection>) {
        self.lock_idle().push_back(idle);
    }

    fn drain_idle(&self, reason: CloseReason) {
        let drained: Vec<_> = {
            let mut idle = self.lock_idle();
            idle.drain(..).collect()
        };
        for _conn in &drained {
            self.metrics
                .record(MetricEvent::ConnectionClosed { reason });
        }
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, VecDeque<Idle<C::Connection>>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<C> std::fmt::Debug for ConnectionPool<C>
where
    C: Connector + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("idle", &self.idle_connections())
            .field("healthy", &self.is_healthy())
            .field(
                "disposed",
                &self.disposed.load(std::sync::atomic::Ordering::Relaxed),
            )
            .finish()
    }
}

//! Core engine for a job-server client: pooling, batching, dispatch.
//!
//! Why: keep the protocol out of the engine.
//! - The pool, batcher and executors only see capability traits
//!   ([`pool::Connector`], [`handler::HandlerProvider`]); wire concerns stay
//!   in the transport crate.
//! - Handlers state an explicit outcome; an unset or panicked handler is a
//!   permanent failure, never silence.
//! - Every job handle gets exactly one completion, routed back to the
//!   connection that produced it.
pub mod batch;
pub mod dispatch;
pub mod executor;
pub mod handler;
pub mod health;
pub mod job;
pub mod metrics;
pub mod pool;
pub mod utils;

#[cfg(feature = "rt-tokio")]
mod tokio_spawner;
#[cfg(feature = "rt-tokio")]
pub use tokio_spawner::TokioSpawner;

pub use batch::{BatchJob, BatchJobManager, BatchOptions};
pub use dispatch::JobManager;
pub use executor::{
    AsyncExecutor, JobContext, JobExecutor, JobSpawner, ResultCallback, SyncExecutor,
};
pub use handler::{
    BatchJobHandler, HandlerLease, HandlerProvider, HandlerRegistry, JobData, JobHandler,
    ScopedProvider, SharedProvider, WorkerContext,
};
pub use health::ServerHealthTracker;
pub use job::{ConnectionId, ExecutionResult, JobAssignment, JobCompletion, JobOutcome};
pub use metrics::{MetricEvent, MetricsSink, NoopMetrics};
pub use pool::{ConnectionPool, PoolConfig};

//! Gearman-protocol backend for the hakobi job-client engine.
//!
//! [`Client`] submits jobs to one or more job servers; [`Worker`] pulls
//! assignments, batches them where configured, and runs registered handlers,
//! reporting every outcome back on the connection that grabbed the job.
pub use hakobi_core;

pub mod client;
pub mod config;
pub mod protocol;
pub mod transport;
pub mod worker;

pub use client::{Client, DistributionStrategy, Priority, SubmitJob};
pub use config::{DEFAULT_PORT, HostEndpoint, ServerConfig};
pub use transport::{TcpConnector, Transport};
pub use worker::{Worker, WorkerBuilder, WorkerWithGracefulShutdown};

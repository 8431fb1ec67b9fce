use serde::Deserialize;

use hakobi_gearman::hakobi_core::batch::BatchOptions;
use hakobi_gearman::hakobi_core::handler::JobData;
use hakobi_gearman::hakobi_core::job::JobOutcome;
use hakobi_gearman::{DEFAULT_PORT, HostEndpoint, WorkerBuilder};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .compact()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let worker = WorkerBuilder::new()
        .endpoint(HostEndpoint::new("127.0.0.1", DEFAULT_PORT))
        .connections(2)
        .max_concurrency(8)
        .poll_delay(std::time::Duration::from_millis(250))
        .handler("greet", greet, ())
        .batch_handler(
            BatchOptions::new("tally", 10, std::time::Duration::from_millis(250)).keyed(true),
            tally,
            (),
        )
        .build()
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down, draining in-flight jobs");
        });

    worker.run().await;
}

#[derive(Debug, Deserialize)]
struct Greeting {
    name: String,
}

async fn greet(JobData(greeting): JobData<Greeting>) -> JobOutcome {
    tracing::info!(name = %greeting.name, "greeting");
    JobOutcome::Complete(format!("hello, {}", greeting.name).into_bytes())
}

async fn tally(JobData(amounts): JobData<Vec<u64>>) -> Vec<JobOutcome> {
    let total: u64 = amounts.iter().sum();
    tracing::info!(jobs = amounts.len(), total, "tallied batch");
    amounts
        .iter()
        .map(|_| JobOutcome::Complete(total.to_string().into_bytes()))
        .collect()
}

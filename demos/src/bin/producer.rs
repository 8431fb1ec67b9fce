use serde::Serialize;

use hakobi_gearman::{Client, DEFAULT_PORT, DistributionStrategy, HostEndpoint, SubmitJob};

#[derive(Debug, Serialize)]
struct Greeting {
    name: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .compact()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let client = Client::<Greeting>::new(
        "greet",
        vec![HostEndpoint::new("127.0.0.1", DEFAULT_PORT)],
    )
    .strategy(DistributionStrategy::RoundRobin);

    let mut interval = tokio::time::interval(std::time::Duration::from_millis(500));
    let mut n: u64 = 0;
    loop {
        interval.tick().await;
        let job = SubmitJob::new(Greeting {
            name: format!("worker-{n}"),
        })
        .correlation_id(format!("greet-{n}"));

        match client.submit(job).await {
            Ok(handle) => {
                tracing::info!(%handle, n, "submitted");
                n += 1;
            }
            Err(error) => {
                tracing::error!(error = %error, "failed to submit job");
            }
        }
    }
}

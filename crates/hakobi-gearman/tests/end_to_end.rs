//! End-to-end exercises against an in-process fake job server.

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};

use hakobi_gearman::hakobi_core::batch::BatchOptions;
use hakobi_gearman::hakobi_core::handler::JobData;
use hakobi_gearman::hakobi_core::job::JobOutcome;
use hakobi_gearman::hakobi_core::pool::PoolConfig;
use hakobi_gearman::protocol::{HEADER_LEN, Magic, Packet, PacketType, decode_header};
use hakobi_gearman::{Client, DistributionStrategy, HostEndpoint, SubmitJob, WorkerBuilder};

async fn bind() -> (TcpListener, HostEndpoint) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    (listener, HostEndpoint::new("127.0.0.1", port))
}

fn dead_endpoint() -> HostEndpoint {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    HostEndpoint::new("127.0.0.1", port)
}

/// Read one client frame; `None` once the client hangs up.
async fn read_packet(sock: &mut TcpStream) -> Option<Packet> {
    let mut header = [0u8; HEADER_LEN];
    if sock.read_exact(&mut header).await.is_err() {
        return None;
    }
    let (kind, len) = decode_header(&header, Magic::Request).expect("request header");
    let mut body = vec![0u8; len];
    sock.read_exact(&mut body).await.expect("body");
    Some(Packet::decode(kind, &body).expect("request body"))
}

async fn write_packet(sock: &mut TcpStream, packet: &Packet) {
    sock.write_all(&packet.encode(Magic::Response))
        .await
        .expect("write response");
}

async fn double(JobData(n): JobData<u64>) -> JobOutcome {
    JobOutcome::Complete((n * 2).to_string().into_bytes())
}

#[tokio::test]
async fn submit_reaches_the_server_and_returns_the_handle() {
    let (listener, endpoint) = bind().await;
    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.expect("accept");
        let packet = read_packet(&mut sock).await.expect("submit frame");
        assert_eq!(packet.kind, PacketType::SubmitJob);
        write_packet(
            &mut sock,
            &Packet::new(PacketType::JobCreated, vec![b"H:local:1".to_vec()]),
        )
        .await;
        (
            packet.arg(0).to_vec(),
            packet.arg(1).to_vec(),
            packet.arg(2).to_vec(),
        )
    });

    let client = Client::<u64>::new("resize", vec![endpoint]);
    let handle = client
        .submit(SubmitJob::new(7u64).correlation_id("c|1").batch_key("k1"))
        .await
        .expect("submit");
    assert_eq!(handle, "H:local:1");

    let (function, unique, payload) = server.await.expect("server");
    assert_eq!(function, b"resize");
    // The composite unique id escapes the pipe inside the correlation id.
    assert_eq!(unique, b"c%7C1|k1");
    assert_eq!(payload, b"7");
}

#[tokio::test]
async fn background_priority_picks_the_matching_packet_type() {
    let (listener, endpoint) = bind().await;
    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.expect("accept");
        let packet = read_packet(&mut sock).await.expect("submit frame");
        write_packet(
            &mut sock,
            &Packet::new(PacketType::JobCreated, vec![b"H:bg:1".to_vec()]),
        )
        .await;
        packet.kind
    });

    let client = Client::<u64>::new("resize", vec![endpoint]);
    client
        .submit(
            SubmitJob::new(1u64)
                .background(true)
                .priority(hakobi_gearman::Priority::High),
        )
        .await
        .expect("submit");
    assert_eq!(server.await.expect("server"), PacketType::SubmitJobHighBg);
}

#[tokio::test]
async fn submission_fails_over_to_the_next_server() {
    let (listener, live) = bind().await;
    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.expect("accept");
        read_packet(&mut sock).await.expect("submit frame");
        write_packet(
            &mut sock,
            &Packet::new(PacketType::JobCreated, vec![b"H:backup:1".to_vec()]),
        )
        .await;
    });

    let client = Client::<u64>::with_config(
        "resize",
        vec![dead_endpoint(), live],
        PoolConfig::default(),
    )
    .strategy(DistributionStrategy::PrimaryFailover);

    let handle = client.submit(1u64).await.expect("failover submit");
    assert_eq!(handle, "H:backup:1");
    server.await.expect("server");
}

#[tokio::test]
async fn worker_completes_an_assigned_job() {
    let (listener, endpoint) = bind().await;
    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<(Vec<u8>, Vec<u8>)>();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.expect("accept");
        let mut assigned = false;
        let mut done_tx = Some(done_tx);
        while let Some(packet) = read_packet(&mut sock).await {
            match packet.kind {
                PacketType::CanDo => assert_eq!(packet.arg(0), b"double"),
                PacketType::GrabJobUniq => {
                    if assigned {
                        write_packet(&mut sock, &Packet::new(PacketType::NoJob, Vec::new())).await;
                    } else {
                        assigned = true;
                        write_packet(
                            &mut sock,
                            &Packet::new(
                                PacketType::JobAssignUniq,
                                vec![
                                    b"H:1".to_vec(),
                                    b"double".to_vec(),
                                    Vec::new(),
                                    b"21".to_vec(),
                                ],
                            ),
                        )
                        .await;
                    }
                }
                PacketType::PreSleep => {}
                PacketType::WorkComplete => {
                    if let Some(tx) = done_tx.take() {
                        let _ = tx.send((packet.arg(0).to_vec(), packet.arg(1).to_vec()));
                    }
                }
                other => panic!("unexpected packet from worker: {other:?}"),
            }
        }
    });

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let worker = WorkerBuilder::new()
        .endpoint(endpoint)
        .poll_delay(std::time::Duration::from_millis(50))
        .handler("double", double, ())
        .build()
        .with_graceful_shutdown(async move {
            let _ = stop_rx.await;
        });
    let worker_task = tokio::spawn(worker.run());

    let (handle, payload) = tokio::time::timeout(std::time::Duration::from_secs(5), done_rx)
        .await
        .expect("work completed in time")
        .expect("completion signal");
    assert_eq!(handle, b"H:1");
    assert_eq!(payload, b"42");

    let _ = stop_tx.send(());
    tokio::time::timeout(std::time::Duration::from_secs(5), worker_task)
        .await
        .expect("worker drained in time")
        .expect("worker task");
    server.abort();
}

#[tokio::test]
async fn worker_batches_jobs_before_running_them() {
    let (listener, endpoint) = bind().await;
    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel::<(Vec<u8>, Vec<u8>)>();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.expect("accept");
        let mut assigned = 0u32;
        while let Some(packet) = read_packet(&mut sock).await {
            match packet.kind {
                PacketType::CanDo => assert_eq!(packet.arg(0), b"sum"),
                PacketType::GrabJobUniq => {
                    if assigned < 2 {
                        assigned += 1;
                        let handle = format!("H:{assigned}");
                        let payload = format!("{assigned}0");
                        write_packet(
                            &mut sock,
                            &Packet::new(
                                PacketType::JobAssignUniq,
                                vec![
                                    handle.into_bytes(),
                                    b"sum".to_vec(),
                                    Vec::new(),
                                    payload.into_bytes(),
                                ],
                            ),
                        )
                        .await;
                    } else {
                        write_packet(&mut sock, &Packet::new(PacketType::NoJob, Vec::new())).await;
                    }
                }
                PacketType::PreSleep => {}
                PacketType::WorkComplete => {
                    let _ = done_tx.send((packet.arg(0).to_vec(), packet.arg(1).to_vec()));
                }
                other => panic!("unexpected packet from worker: {other:?}"),
            }
        }
    });

    async fn sum_batch(JobData(items): JobData<Vec<u64>>) -> Vec<JobOutcome> {
        let total: u64 = items.iter().sum();
        items
            .iter()
            .map(|_| JobOutcome::Complete(total.to_string().into_bytes()))
            .collect()
    }

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let worker = WorkerBuilder::new()
        .endpoint(endpoint)
        .poll_delay(std::time::Duration::from_millis(50))
        .batch_handler(
            BatchOptions::new("sum", 2, std::time::Duration::from_secs(10)),
            sum_batch,
            (),
        )
        .build()
        .with_graceful_shutdown(async move {
            let _ = stop_rx.await;
        });
    let worker_task = tokio::spawn(worker.run());

    let mut seen = Vec::new();
    for _ in 0..2 {
        let completion =
            tokio::time::timeout(std::time::Duration::from_secs(5), done_rx.recv())
                .await
                .expect("batch completed in time")
                .expect("completion");
        seen.push(completion);
    }
    seen.sort();
    // Both jobs (10 and 20) report the batch total.
    assert_eq!(
        seen,
        vec![
            (b"H:1".to_vec(), b"30".to_vec()),
            (b"H:2".to_vec(), b"30".to_vec()),
        ]
    );

    let _ = stop_tx.send(());
    tokio::time::timeout(std::time::Duration::from_secs(5), worker_task)
        .await
        .expect("worker drained in time")
        .expect("worker task");
    server.abort();
}

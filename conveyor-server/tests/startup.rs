use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use conveyor_config::Config;
use conveyor_job_queue::bridge::serve_tcp;
use conveyor_job_queue::{JobQueueService, ProcessRole};
use conveyor_server::config_helpers::{
    bridge_from_config, job_queue_config, queue_options, strategy_from_config,
};
use conveyor_server::{build_router, AppState};
use serde_json::{json, Value};
use tokio::sync::watch;

/// Server and worker wired from one config: sqlite store on disk and a
/// TCP bridge between them, the way the binary runs them.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_and_worker_share_a_store_and_a_bridge() {
    let dir = tempfile::tempdir().unwrap();
    let bridge_listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();

    let mut cfg = Config::default();
    cfg.database.url = format!("sqlite://{}", dir.path().join("jobs.sqlite").display());
    cfg.job_queue.poll_interval_ms = 50;
    cfg.bridge.address = Some(format!("tcp://{}", bridge_listener.local_addr().unwrap()));

    let worker = JobQueueService::new(
        strategy_from_config(&cfg).await.unwrap(),
        job_queue_config(&cfg, ProcessRole::Worker),
    );
    conveyor_jobs::register_all(&worker, |queue| queue_options(&cfg, queue))
        .await
        .unwrap();
    worker.start().await.unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bridge_task = tokio::spawn(serve_tcp(
        bridge_listener,
        conveyor_jobs::bridge_router(),
        shutdown_rx,
    ));

    let server = JobQueueService::new(
        strategy_from_config(&cfg).await.unwrap(),
        job_queue_config(&cfg, ProcessRole::Server),
    );
    conveyor_jobs::register_all(&server, |queue| queue_options(&cfg, queue))
        .await
        .unwrap();
    server.start().await.unwrap();
    let bridge = bridge_from_config(&cfg, ProcessRole::Server).unwrap();
    let router = build_router(Arc::new(AppState::new(server.clone(), bridge)));

    let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let http = tokio::spawn(async move {
        axum::serve(listener, router.into_make_service())
            .await
            .unwrap();
    });

    let base = format!("http://{addr}/api");
    let client = reqwest::Client::new();

    let health = client.get(format!("{base}/health")).send().await.unwrap();
    assert!(health.status().is_success());

    let pong: Value = client
        .post(format!("{base}/worker/ping"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(pong["roundTripMs"].is_i64());

    // Queues run on the worker only, so the server just stores the job.
    let created: Value = client
        .post(format!("{base}/queues/send-email/jobs"))
        .json(&json!({
            "data": { "to": "ada@example.com", "subject": "s", "template": "t" }
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["effectiveId"].as_str().unwrap().to_owned();

    let mut state = Value::Null;
    for _ in 0..100 {
        let job: Value = client
            .get(format!("{base}/jobs/{id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        state = job["state"].clone();
        if state == "COMPLETED" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(state, "COMPLETED");

    http.abort();
    shutdown_tx.send(true).unwrap();
    bridge_task.await.unwrap().unwrap();
    server.stop().await;
    worker.stop().await;
}

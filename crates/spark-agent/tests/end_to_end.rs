//! Agent and server talking over real sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use spark_agent::{Agent, AgentConfig};
use spark_server::{router, AppState};
use tokio::net::TcpListener;

async fn start_server() -> (Arc<AppState>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new();
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });
    (state, format!("http://{addr}"))
}

async fn wait_for_device(state: &AppState, id: &str) -> String {
    for _ in 0..100 {
        if let Some(conn) = state.resolve(None, Some(id)).await {
            return conn;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("device {id} never reported");
}

fn start_agent(base: &str, id: &str) -> (Arc<Agent>, tokio::task::JoinHandle<()>) {
    let agent = Agent::new(AgentConfig {
        server: base.to_string(),
        device_id: Some(id.to_string()),
        report_interval: Duration::from_secs(1),
        reconnect_delay: Duration::from_millis(200),
    });
    let running = tokio::spawn(agent.clone().run());
    (agent, running)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ranged_download_and_offline() {
    let (state, base) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    let content: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, &content).unwrap();

    let (_agent, running) = start_agent(&base, "e2e-range");
    wait_for_device(&state, "e2e-range").await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/api/device/file/get"))
        .header(RANGE, "bytes=100-199")
        .form(&[("file", path.to_str().unwrap()), ("device", "e2e-range")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[CONTENT_RANGE], "bytes 100-199/1000");
    let body = response.bytes().await.unwrap();
    assert_eq!(&body[..], &content[100..200]);

    let response = client
        .post(format!("{base}/api/device/file/get"))
        .form(&[("file", "/nonexistent/spark.bin"), ("device", "e2e-range")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let response = client
        .post(format!("{base}/api/device/offline"))
        .form(&[("device", "e2e-range")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("agent kept running after offline")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_listing_arrives_over_side_channel() {
    let (state, base) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    // Roughly 80 bytes of JSON per entry puts the reply well past one frame.
    for i in 0..600 {
        std::fs::write(dir.path().join(format!("entry-{i:04}-{}", "x".repeat(24))), b"").unwrap();
    }

    let (_agent, running) = start_agent(&base, "e2e-list");
    wait_for_device(&state, "e2e-list").await;

    let response = reqwest::Client::new()
        .post(format!("{base}/api/device/file/list"))
        .form(&[("path", dir.path().to_str().unwrap()), ("device", "e2e-list")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let reply: serde_json::Value = response.json().await.unwrap();
    assert_eq!(reply["code"].as_i64().unwrap_or(0), 0);
    assert_eq!(reply["data"]["files"].as_array().unwrap().len(), 600);

    running.abort();
}

//! Probe endpoints served from a live listener, as the orchestrator sees them.
use serving_core::{probe_router, FailureStage, HealthReporter};
use std::net::SocketAddr;

async fn serve(health: HealthReporter) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move { axum::serve(listener, probe_router(health)).await.ok(); });
    addr
}

#[tokio::test]
async fn liveness_holds_while_readiness_follows_load_phase() {
    let health = HealthReporter::new();
    let addr = serve(health.clone()).await;
    let client = reqwest::Client::new();

    let live = client.get(format!("http://{addr}/live")).send().await.expect("live request");
    assert_eq!(live.status(), 200);
    let body: serde_json::Value = live.json().await.expect("json");
    assert_eq!(body["live"], true);

    let ready = client.get(format!("http://{addr}/ready")).send().await.expect("ready request");
    assert_eq!(ready.status(), 503);

    health.begin_loading();
    let ready = client.get(format!("http://{addr}/ready")).send().await.expect("ready request");
    assert_eq!(ready.status(), 503);

    health.mark_ready();
    let ready = client.get(format!("http://{addr}/ready")).send().await.expect("ready request");
    assert_eq!(ready.status(), 200);
    let body: serde_json::Value = ready.json().await.expect("json");
    assert_eq!(body["ready"], true);
}

#[tokio::test]
async fn failed_startup_is_visible_in_status_but_process_stays_live() {
    let health = HealthReporter::new();
    let addr = serve(health.clone()).await;
    health.begin_loading();
    health.mark_failed(FailureStage::Load, "feature schema is empty");

    let client = reqwest::Client::new();
    assert_eq!(client.get(format!("http://{addr}/live")).send().await.unwrap().status(), 200);
    assert_eq!(client.get(format!("http://{addr}/ready")).send().await.unwrap().status(), 503);

    let status: serde_json::Value = client.get(format!("http://{addr}/status")).send().await.unwrap().json().await.unwrap();
    assert_eq!(status["phase"], "load_failed");
    assert_eq!(status["failure"]["stage"], "load");
}

#[tokio::test]
async fn metrics_endpoint_is_prometheus_text() {
    serving_core::serving_metrics().artifacts.model_loads_total.with_label_values(&["ok"]).inc();
    let addr = serve(HealthReporter::new()).await;
    let resp = reqwest::get(format!("http://{addr}/metrics")).await.expect("metrics request");
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.expect("text");
    assert!(body.contains("serving_model_loads_total"), "missing model load counter");
}

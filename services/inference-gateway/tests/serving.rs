//! End-to-end: a local bucket mirror, a real listener, and the full startup path.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use inference_gateway::api::AppState;
use serde_json::{json, Value};
use serving_core::{ConfigError, HealthReporter, RuntimeConfig};

const SECRET: &str = "s3cr3t-do-not-print";
const MODEL: &str = r#"{"kind":"linear","intercept":0.5,"coefficients":[0.01,0.0001,0.2]}"#;
const SCHEMA: &str = r#"["age","income","tenure"]"#;

fn publish(bucket: &Path, name: &str, version: &str) {
    publish_files(bucket, name, version, MODEL, SCHEMA);
}

fn publish_files(bucket: &Path, name: &str, version: &str, model: &str, schema: &str) {
    let dir = bucket.join(name).join(version);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("model.bin"), model).unwrap();
    std::fs::write(dir.join("features.json"), schema).unwrap();
}

fn config(bucket: &Path, cache: &Path, version: &str) -> RuntimeConfig {
    let vars = HashMap::from([
        ("MODEL_STORAGE_LOCATION".to_string(), format!("file://{}", bucket.display())),
        ("MODEL_REGION".to_string(), "local".to_string()),
        ("MODEL_ARTIFACT_NAME".to_string(), "churn".to_string()),
        ("MODEL_ARTIFACT_VERSION".to_string(), version.to_string()),
        ("MODEL_CREDENTIAL_ID".to_string(), "svc-reader".to_string()),
        ("MODEL_CREDENTIAL_SECRET".to_string(), SECRET.to_string()),
        ("MODEL_CACHE_DIR".to_string(), cache.display().to_string()),
        ("MODEL_FETCH_ATTEMPTS".to_string(), "2".to_string()),
        ("MODEL_FETCH_BACKOFF_MS".to_string(), "1".to_string()),
        ("MODEL_INFERENCE_WORKERS".to_string(), "2".to_string()),
    ]);
    RuntimeConfig::load_from(vars).expect("valid config")
}

async fn start(cfg: RuntimeConfig) -> (SocketAddr, HealthReporter) {
    start_with(Ok(cfg)).await
}

async fn start_with(cfg: Result<RuntimeConfig, ConfigError>) -> (SocketAddr, HealthReporter) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let health = HealthReporter::new();
    let state = AppState::new(health.clone());
    tokio::spawn(inference_gateway::serve(listener, state, cfg, std::future::pending()));
    (addr, health)
}

async fn wait_settled(health: &HealthReporter) {
    for _ in 0..200 {
        if health.phase().is_terminal() { return; }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("startup did not settle");
}

#[tokio::test]
async fn serves_predictions_once_ready() {
    let bucket = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    publish(bucket.path(), "churn", "v1");
    let (addr, health) = start(config(bucket.path(), cache.path(), "v1")).await;
    wait_settled(&health).await;

    let client = reqwest::Client::new();
    assert_eq!(client.get(format!("http://{addr}/ready")).send().await.unwrap().status(), 200);

    let resp = client.post(format!("http://{addr}/v1/predict"))
        .json(&json!({"features": {"age": 30, "income": 50000, "tenure": 5}}))
        .send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert!((body["prediction"].as_f64().unwrap() - 6.8).abs() < 1e-9);
    assert_eq!(body["metadata"]["version"], "v1");

    let resp = client.post(format!("http://{addr}/v1/predict"))
        .json(&json!({"features": {"age": 30, "income": 50000}}))
        .send().await.unwrap();
    assert_eq!(resp.status(), 422);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "validation");
    assert_eq!(body["fields"], json!(["tenure"]));

    let resp = client.post(format!("http://{addr}/v1/predict"))
        .header("content-type", "application/json")
        .body("{not json")
        .send().await.unwrap();
    assert_eq!(resp.status(), 400);

    // Artifacts landed in the documented cache layout.
    assert!(cache.path().join("churn/v1/model.bin").is_file());
    assert!(cache.path().join("churn/v1/features.json").is_file());
}

#[tokio::test]
async fn batch_reports_each_instance() {
    let bucket = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    publish(bucket.path(), "churn", "v1");
    let (addr, health) = start(config(bucket.path(), cache.path(), "v1")).await;
    wait_settled(&health).await;

    let body: Value = reqwest::Client::new().post(format!("http://{addr}/v1/predict/batch"))
        .json(&json!({"instances": [
            {"age": 30, "income": 50000, "tenure": 5},
            {"age": 30, "income": 50000, "tenure": 5, "zip": 94107}
        ]}))
        .send().await.unwrap().json().await.unwrap();
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0]["prediction"].is_number());
    assert_eq!(results[1]["error"], "validation");
    assert_eq!(results[1]["fields"], json!(["zip"]));
}

#[tokio::test]
async fn missing_artifact_leaves_process_live_but_unready() {
    let bucket = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let (addr, health) = start(config(bucket.path(), cache.path(), "v404")).await;
    wait_settled(&health).await;

    let client = reqwest::Client::new();
    assert_eq!(client.get(format!("http://{addr}/live")).send().await.unwrap().status(), 200);
    assert_eq!(client.get(format!("http://{addr}/ready")).send().await.unwrap().status(), 503);

    let resp = client.post(format!("http://{addr}/v1/predict"))
        .json(&json!({"features": {"age": 30, "income": 50000, "tenure": 5}}))
        .send().await.unwrap();
    assert_eq!(resp.status(), 503);

    let status = client.get(format!("http://{addr}/status")).send().await.unwrap().text().await.unwrap();
    let parsed: Value = serde_json::from_str(&status).unwrap();
    assert_eq!(parsed["phase"], "load_failed");
    assert_eq!(parsed["failure"]["stage"], "fetch");
    assert!(!status.contains(SECRET));
}

#[tokio::test]
async fn restart_uses_cache_without_the_bucket() {
    let bucket = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    publish(bucket.path(), "churn", "v1");
    let (_, health) = start(config(bucket.path(), cache.path(), "v1")).await;
    wait_settled(&health).await;
    assert!(health.is_ready());

    // Second replica start: the remote copy is gone, the verified cache is enough.
    std::fs::remove_dir_all(bucket.path().join("churn")).unwrap();
    let (_, health) = start(config(bucket.path(), cache.path(), "v1")).await;
    wait_settled(&health).await;
    assert!(health.is_ready());
}

async fn status(addr: SocketAddr) -> Value {
    reqwest::get(format!("http://{addr}/status")).await.unwrap().json().await.unwrap()
}

#[tokio::test]
async fn corrupt_schema_fails_at_load_stage_but_stays_live() {
    let bucket = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    publish_files(bucket.path(), "churn", "v1", MODEL, r#"["age","age","tenure"]"#);
    let (addr, health) = start(config(bucket.path(), cache.path(), "v1")).await;
    wait_settled(&health).await;

    let client = reqwest::Client::new();
    assert_eq!(client.get(format!("http://{addr}/live")).send().await.unwrap().status(), 200);
    assert_eq!(client.get(format!("http://{addr}/ready")).send().await.unwrap().status(), 503);
    let status = status(addr).await;
    assert_eq!(status["phase"], "load_failed");
    assert_eq!(status["failure"]["stage"], "load");
}

#[tokio::test]
async fn rejected_config_keeps_probes_up() {
    let err = RuntimeConfig::load_from(HashMap::from([
        ("MODEL_REGION".to_string(), "local".to_string()),
        ("MODEL_CREDENTIAL_SECRET".to_string(), SECRET.to_string()),
    ])).unwrap_err();
    let (addr, health) = start_with(Err(err)).await;
    wait_settled(&health).await;

    let client = reqwest::Client::new();
    assert_eq!(client.get(format!("http://{addr}/live")).send().await.unwrap().status(), 200);
    assert_eq!(client.get(format!("http://{addr}/ready")).send().await.unwrap().status(), 503);
    let body = client.get(format!("http://{addr}/status")).send().await.unwrap().text().await.unwrap();
    let status: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(status["phase"], "load_failed");
    assert_eq!(status["failure"]["stage"], "config");
    assert!(!body.contains(SECRET));
}

#[tokio::test]
async fn failing_prediction_leaves_replica_ready() {
    let bucket = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    // Finite weights that overflow to infinity on any realistic input.
    let overflowing = r#"{"kind":"linear","intercept":0.0,"coefficients":[1e308,1e308,1e308]}"#;
    publish_files(bucket.path(), "churn", "v1", overflowing, SCHEMA);
    let (addr, health) = start(config(bucket.path(), cache.path(), "v1")).await;
    wait_settled(&health).await;

    let client = reqwest::Client::new();
    let resp = client.post(format!("http://{addr}/v1/predict"))
        .json(&json!({"features": {"age": 30, "income": 50000, "tenure": 5}}))
        .send().await.unwrap();
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"error": "inference", "message": "prediction failed"}));

    assert_eq!(client.get(format!("http://{addr}/ready")).send().await.unwrap().status(), 200);
    assert!(health.is_ready());
}

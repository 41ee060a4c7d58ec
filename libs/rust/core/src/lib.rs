//! Core shared utilities for model-serving services.

use anyhow::Result;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::{routing::get, Json, Router};
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::prelude::*;

pub mod config;
pub mod lifecycle;
pub mod metrics;

pub use config::{ConfigError, Credentials, RuntimeConfig, Secret, StorageLocation};
pub use lifecycle::{Failure, FailureStage, HealthReporter, HealthSnapshot, LoadPhase};
pub use metrics::{serving_metrics, ServingMetrics};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Install the global subscriber once. `RUST_LOG` drives filtering (default
/// `info`); `MODEL_JSON_LOG=1|true` switches to flattened JSON lines.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("MODEL_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);
        if json {
            registry.with(tracing_subscriber::fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false)).try_init()?;
        } else {
            registry.with(tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true)).try_init()?;
        }
        Ok(())
    })?;
    info!(target: "serving", service, "tracing initialized");
    Ok(())
}

/// Orchestrator-facing probes plus diagnostics. Liveness never consults the
/// load phase; it answers as long as the server can accept the request.
pub fn probe_router(health: HealthReporter) -> Router {
    Router::new()
        .route("/live", get(live))
        .route("/ready", get(ready))
        .route("/status", get(status))
        .route("/metrics", get(metrics_handler))
        .with_state(health)
}

async fn live(State(health): State<HealthReporter>) -> impl IntoResponse {
    let live = health.is_live();
    let code = if live { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(serde_json::json!({ "live": live })))
}

async fn ready(State(health): State<HealthReporter>) -> impl IntoResponse {
    let ready = health.is_ready();
    let code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(serde_json::json!({ "ready": ready })))
}

async fn status(State(health): State<HealthReporter>) -> Json<HealthSnapshot> { Json(health.snapshot()) }

async fn metrics_handler() -> axum::response::Response {
    match serving_metrics().render() {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response(),
    }
}

//! HTTP surface: prediction routes plus the shared probe routes.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use serving_core::{probe_router, serving_metrics, HealthReporter};

use crate::handler::{PredictionRequest, RequestError, RequestHandler};

#[derive(Clone)]
pub struct AppState {
    pub health: HealthReporter,
    handler: Arc<OnceCell<RequestHandler>>,
}

impl AppState {
    pub fn new(health: HealthReporter) -> Self {
        Self { health, handler: Arc::new(OnceCell::new()) }
    }

    /// Install the request handler. Only the first call wins.
    pub fn publish(&self, handler: RequestHandler) -> bool {
        self.handler.set(handler).is_ok()
    }

    /// The handler, once startup has both published it and flipped readiness.
    pub fn handler(&self) -> Option<&RequestHandler> {
        if self.health.is_ready() { self.handler.get() } else { None }
    }
}

pub fn router(state: AppState) -> Router {
    let health = state.health.clone();
    Router::new()
        .route("/v1/predict", post(predict))
        .route("/v1/predict/batch", post(predict_batch))
        .with_state(state)
        .merge(probe_router(health))
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    instances: Vec<Map<String, Value>>,
}

pub enum ApiError {
    NotReady,
    BadRequest(String),
    Request(RequestError),
}

impl From<RequestError> for ApiError {
    fn from(e: RequestError) -> Self { ApiError::Request(e) }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self { ApiError::BadRequest(e.body_text()) }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotReady => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "not_ready" }))).into_response(),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, Json(json!({ "error": "bad_request", "message": message }))).into_response(),
            ApiError::Request(e) => {
                let (code, body) = error_body(&e);
                (code, Json(body)).into_response()
            }
        }
    }
}

fn error_body(e: &RequestError) -> (StatusCode, Value) {
    match e {
        RequestError::Validation(v) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            json!({ "error": "validation", "fields": v.fields(), "message": v.to_string() }),
        ),
        RequestError::Inference(i) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": "inference", "message": i.to_string() }),
        ),
    }
}

fn ready_handler(state: &AppState) -> Result<&RequestHandler, ApiError> {
    state.handler().ok_or_else(|| {
        serving_metrics().requests.requests_total.with_label_values(&["not_ready"]).inc();
        ApiError::NotReady
    })
}

async fn predict(
    State(state): State<AppState>,
    body: Result<Json<PredictionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let handler = ready_handler(&state)?;
    let Json(request) = body?;
    let response = handler.handle(request).await?;
    Ok(Json(response).into_response())
}

async fn predict_batch(
    State(state): State<AppState>,
    body: Result<Json<BatchRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let handler = ready_handler(&state)?;
    let Json(batch) = body?;
    let results: Vec<Value> = handler.handle_batch(batch.instances).await
        .into_iter()
        .map(|r| match r {
            Ok(resp) => serde_json::to_value(resp).unwrap_or(Value::Null),
            Err(e) => error_body(&e).1,
        })
        .collect();
    Ok(Json(json!({ "results": results })).into_response())
}

//! Per-request path: validate the named features against the loaded schema,
//! order them, and run the predictor on the bounded blocking pool.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serving_core::serving_metrics;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::model::ModelArtifact;

/// Named numeric inputs for one prediction.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PredictionRequest {
    pub features: Map<String, Value>,
}

impl PredictionRequest {
    pub fn new(features: Map<String, Value>) -> Self { Self { features } }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PredictionResponse {
    pub prediction: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResponseMetadata {
    pub model: String,
    pub version: String,
}

/// The request does not match the feature schema. Always names the field(s).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required feature(s): {}", .0.join(", "))]
    Missing(Vec<String>),
    #[error("feature `{field}` must be a number")]
    NotNumeric { field: String },
    #[error("unexpected feature(s): {}", .0.join(", "))]
    Unexpected(Vec<String>),
}

impl ValidationError {
    pub fn fields(&self) -> Vec<&str> {
        match self {
            ValidationError::Missing(f) | ValidationError::Unexpected(f) => f.iter().map(String::as_str).collect(),
            ValidationError::NotNumeric { field } => vec![field.as_str()],
        }
    }
}

/// The predictor failed. What went wrong is logged, never displayed.
#[derive(Debug, Error)]
#[error("prediction failed")]
pub struct InferenceError {
    detail: String,
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

impl RequestError {
    pub fn label(&self) -> &'static str {
        match self {
            RequestError::Validation(_) => "validation",
            RequestError::Inference(_) => "inference",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestHandler {
    model: Arc<ModelArtifact>,
    permits: Arc<Semaphore>,
}

impl RequestHandler {
    /// `workers` bounds how many predictions run at once on the blocking pool.
    pub fn new(model: Arc<ModelArtifact>, workers: usize) -> Self {
        Self { model, permits: Arc::new(Semaphore::new(workers.max(1))) }
    }

    pub fn model(&self) -> &ModelArtifact { &self.model }

    /// Order the request's features by the schema. Checks run missing first,
    /// then value types, then leftovers.
    pub fn build_features(&self, features: &Map<String, Value>) -> Result<Vec<f64>, ValidationError> {
        let order = self.model.feature_order();
        let missing: Vec<String> = order.iter()
            .filter(|name| features.get(name.as_str()).map_or(true, Value::is_null))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ValidationError::Missing(missing));
        }

        let mut row = Vec::with_capacity(order.len());
        for name in order {
            let value = features.get(name.as_str()).and_then(numeric);
            row.push(value.ok_or_else(|| ValidationError::NotNumeric { field: name.clone() })?);
        }

        let mut unexpected: Vec<String> = features.keys().filter(|k| !order.contains(*k)).cloned().collect();
        if !unexpected.is_empty() {
            unexpected.sort();
            return Err(ValidationError::Unexpected(unexpected));
        }
        Ok(row)
    }

    #[instrument(skip_all, fields(model = %self.model.info().name))]
    pub async fn handle(&self, request: PredictionRequest) -> Result<PredictionResponse, RequestError> {
        let result = self.predict(&request.features).await;
        let outcome = match &result { Ok(_) => "ok", Err(e) => e.label() };
        serving_metrics().requests.requests_total.with_label_values(&[outcome]).inc();
        if let Err(RequestError::Validation(e)) = &result {
            debug!(error = %e, "request rejected");
        }
        result
    }

    /// Every instance is validated and predicted on its own; one bad row does
    /// not fail the others.
    pub async fn handle_batch(&self, instances: Vec<Map<String, Value>>) -> Vec<Result<PredictionResponse, RequestError>> {
        futures::future::join_all(instances.into_iter().map(|features| self.handle(PredictionRequest::new(features)))).await
    }

    async fn predict(&self, features: &Map<String, Value>) -> Result<PredictionResponse, RequestError> {
        let row = self.build_features(features)?;
        let prediction = self.infer(row).await?;
        let info = self.model.info();
        Ok(PredictionResponse {
            prediction,
            metadata: Some(ResponseMetadata { model: info.name.clone(), version: info.version.clone() }),
        })
    }

    async fn infer(&self, row: Vec<f64>) -> Result<f64, InferenceError> {
        let permit = self.permits.clone().acquire_owned().await
            .map_err(|_| InferenceError { detail: "inference pool closed".into() })?;
        let model = self.model.clone();
        let started = Instant::now();
        // The permit travels with the blocking job so a dropped request cannot
        // oversubscribe the pool while its prediction is still running.
        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            model.predictor().predict(&row)
        }).await;
        serving_metrics().requests.inference_latency_seconds.observe(started.elapsed().as_secs_f64());

        let detail = match joined {
            Ok(Ok(y)) => return Ok(y),
            Ok(Err(e)) => e.to_string(),
            Err(e) if e.is_panic() => "predictor panicked".to_string(),
            Err(e) => e.to_string(),
        };
        warn!(error = %detail, "inference failed");
        Err(InferenceError { detail })
    }
}

fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64().filter(|x| x.is_finite()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

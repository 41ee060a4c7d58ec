//! Startup sequence: resolve artifacts, load the model, publish it, then
//! report ready. Runs behind an already-serving listener, so a slow or failed
//! startup never takes liveness down with it.

use std::sync::Arc;

use serving_core::{serving_metrics, FailureStage, RuntimeConfig};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::api::AppState;
use crate::artifact::{ArtifactResolver, ArtifactSet, FetchError, StoreError};
use crate::handler::RequestHandler;
use crate::model::{LoadError, ModelLoader};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("storage backend unavailable: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("model load task aborted: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("a model is already published")]
    AlreadyPublished,
}

impl StartupError {
    pub fn stage(&self) -> FailureStage {
        match self {
            StartupError::Store(_) | StartupError::Fetch(_) => FailureStage::Fetch,
            _ => FailureStage::Load,
        }
    }
}

/// Run startup in the background against the configured storage.
pub fn spawn(cfg: RuntimeConfig, state: AppState) -> JoinHandle<Result<(), StartupError>> {
    tokio::spawn(async move {
        match ArtifactResolver::from_config(&cfg) {
            Ok(resolver) => startup(&cfg, &resolver, &state).await,
            Err(e) => fail(&state, e.into()),
        }
    })
}

#[instrument(skip_all, fields(model = %cfg.artifact_name, version = %cfg.artifact_version))]
pub async fn startup(cfg: &RuntimeConfig, resolver: &ArtifactResolver, state: &AppState) -> Result<(), StartupError> {
    state.health.begin_loading();
    match load_and_publish(cfg, resolver, state).await {
        Ok(()) => {
            state.health.mark_ready();
            Ok(())
        }
        Err(e) => fail(state, e),
    }
}

async fn load_and_publish(cfg: &RuntimeConfig, resolver: &ArtifactResolver, state: &AppState) -> Result<(), StartupError> {
    let paths = resolver.resolve_set(&ArtifactSet::from_config(cfg)).await?;

    let (name, version) = (cfg.artifact_name.clone(), cfg.artifact_version.clone());
    let loaded = tokio::task::spawn_blocking(move || ModelLoader::new().load(&paths, &name, &version)).await?;
    let loads = &serving_metrics().artifacts.model_loads_total;
    let artifact = match loaded {
        Ok(a) => { loads.with_label_values(&["ok"]).inc(); a }
        Err(e) => { loads.with_label_values(&["failed"]).inc(); return Err(e.into()); }
    };

    info!(kind = %artifact.info().kind, features = artifact.feature_order().len(), "publishing model");
    if !state.publish(RequestHandler::new(Arc::new(artifact), cfg.inference_workers)) {
        return Err(StartupError::AlreadyPublished);
    }
    Ok(())
}

fn fail(state: &AppState, e: StartupError) -> Result<(), StartupError> {
    state.health.mark_failed(e.stage(), e.to_string());
    Err(e)
}

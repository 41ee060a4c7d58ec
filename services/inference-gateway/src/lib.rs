//! Serves predictions from a model artifact fetched from remote object storage.

use std::future::Future;

use anyhow::Result;
use serving_core::config::fallback_listen_addr;
use serving_core::{ConfigError, FailureStage, HealthReporter, RuntimeConfig};
use tokio::net::TcpListener;
use tracing::{error, info};

pub mod api;
pub mod artifact;
pub mod bootstrap;
pub mod handler;
pub mod model;

use api::AppState;

/// Load configuration, bind, and serve until a shutdown signal arrives.
pub async fn run() -> Result<()> {
    let config = RuntimeConfig::load();
    let addr = config.as_ref().map(|c| c.listen_addr).unwrap_or_else(|_| fallback_listen_addr());
    let listener = TcpListener::bind(addr).await?;
    serve(listener, AppState::new(HealthReporter::new()), config, shutdown_signal()).await
}

/// Serve on an already bound listener. Startup runs in the background once
/// the accept loop is in place. Rejected configuration still brings the
/// probes up, with readiness failed at the config stage, so the failure is
/// visible to the orchestrator.
pub async fn serve<F>(listener: TcpListener, state: AppState, config: Result<RuntimeConfig, ConfigError>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = %listener.local_addr()?, "listening");
    match config {
        Ok(cfg) => { bootstrap::spawn(cfg, state.clone()); }
        Err(e) => {
            error!(error = %e, "configuration rejected, serving probes only");
            state.health.mark_failed(FailureStage::Config, e.to_string());
        }
    }
    let health = state.health.clone();
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            health.mark_not_live();
            info!("shutting down");
        })
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => { s.recv().await; }
            Err(e) => {
                error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

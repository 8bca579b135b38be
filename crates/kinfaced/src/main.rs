use anyhow::{Context, Result};
use kinface_core::{FamilyAnalyzer, ModelPaths, OnnxFaceProvider};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod middleware;
mod response;
mod routes;
mod state;

use config::Config;
use engine::EngineHandle;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "kinfaced starting");

    let weights: Vec<String> = config
        .feature_weights
        .iter()
        .map(|(feature, weight)| format!("{feature:?}={weight}"))
        .collect();
    tracing::info!(?weights, jitter = ?config.jitter, "family analysis configured");
    let analyzer = Arc::new(FamilyAnalyzer::new(config.feature_weights.clone(), config.jitter));
    let engine = load_engine(&config, Arc::clone(&analyzer));

    let addr = config.bind_addr();
    let state = Arc::new(AppState::new(config, engine, analyzer));
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    tracing::info!(%addr, "kinfaced ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("kinfaced shutting down");
    Ok(())
}

/// Load the models and start the engine thread. The API still starts
/// without them and face routes answer 503.
fn load_engine(config: &Config, analyzer: Arc<FamilyAnalyzer>) -> Option<EngineHandle> {
    let paths = ModelPaths::in_dir(&config.model_dir, &config.model_name);
    let provider = match OnnxFaceProvider::load(&paths, &config.model_name, config.intra_threads) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, model_dir = %config.model_dir.display(), "models unavailable, serving without them");
            return None;
        }
    };

    match engine::spawn_engine(provider, analyzer) {
        Ok(handle) => {
            tracing::info!(model = %config.model_name, "face models loaded");
            Some(handle)
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start engine thread");
            None
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for ctrl-c");
    }
}

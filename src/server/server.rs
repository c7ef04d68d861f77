//! HTTP server built on axum.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router as HttpRouter,
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::handlers;
use crate::config::ServerConfig;
use crate::engine::{Classifier, Generator, InferenceEngine, Router};
use crate::error::{EngineError, Result};
use crate::metrics::MetricsCollector;

/// Shared state for axum request handlers.
#[derive(Clone)]
pub struct AppState {
    pub classifier: Arc<dyn Classifier>,
    pub generator: Arc<dyn Generator>,
    pub router: Arc<Router>,
    pub metrics: Arc<MetricsCollector>,
    /// Present when the stages are backed by a real engine.
    pub engine: Option<Arc<InferenceEngine>>,
}

impl AppState {
    pub fn from_engine(engine: Arc<InferenceEngine>) -> Self {
        Self {
            classifier: engine.clone(),
            generator: engine.clone(),
            router: Arc::new(engine.router()),
            metrics: engine.metrics().clone(),
            engine: Some(engine),
        }
    }

    /// State over arbitrary stage implementations, without engine health.
    pub fn new(classifier: Arc<dyn Classifier>, generator: Arc<dyn Generator>, router: Router) -> Self {
        Self {
            classifier,
            generator,
            router: Arc::new(router),
            metrics: Arc::new(MetricsCollector::new()),
            engine: None,
        }
    }
}

/// Routes:
/// - POST /classify
/// - POST /generate
/// - POST /process
/// - GET /health
pub fn app(state: AppState) -> HttpRouter {
    HttpRouter::new()
        .route("/classify", post(handlers::classify))
        .route("/generate", post(handlers::generate))
        .route("/process", post(handlers::process))
        .route("/health", get(handlers::health))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Bind and serve until Ctrl-C, then shut the engine down.
pub async fn serve(config: &ServerConfig, engine: Arc<InferenceEngine>) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| EngineError::Configuration {
            parameter: "server".to_string(),
            message: format!("failed to bind to {addr}: {e}"),
        })?;

    info!("Server listening on {addr}");

    let shutdown_engine = engine.clone();
    axum::serve(listener, app(AppState::from_engine(engine)))
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C");
            }
            shutdown_engine.shutdown();
        })
        .await
        .map_err(|e| EngineError::Configuration {
            parameter: "server".to_string(),
            message: format!("server error: {e}"),
        })?;

    info!("Server stopped");
    Ok(())
}

//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ListenerOptions;
use crate::errors::PlatformError;
use crate::server::handlers::{
    create_deployment_handler, create_project_handler, deployment_logs_handler,
    get_deployment_handler, get_project_handler, health_handler, version_handler,
};
use crate::server::live::logs_ws_handler;
use crate::server::proxy::proxy_handler;
use crate::server::state::{ProxyState, ServerState};

/// Admission API and log reader routes
pub fn api_router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Projects
        .route("/projects", post(create_project_handler))
        .route("/projects/{id}", get(get_project_handler))
        // Deployments
        .route("/deployments", post(create_deployment_handler))
        .route("/deployments/{id}", get(get_deployment_handler))
        // Logs
        .route("/deployments/{id}/logs", get(deployment_logs_handler))
        .route("/logs/ws", get(logs_ws_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Reverse proxy routes: every request resolves by host
pub fn proxy_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .fallback(proxy_handler)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind a listener and serve a router until shutdown
pub async fn serve(
    name: &str,
    options: &ListenerOptions,
    app: Router,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), PlatformError>>, PlatformError> {
    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting {} server on {}", name, addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| PlatformError::ServerError(format!("{}: {}", addr, e)))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| PlatformError::ServerError(e.to_string()))
    });

    Ok(handle)
}

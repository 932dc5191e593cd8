//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::PlatformError;
use crate::server::serve::{api_router, proxy_router, serve};
use crate::server::state::{ProxyState, ServerState};
use crate::workers::{ingester, watcher};

/// Run the control plane: admission API, proxy, watcher and ingester
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), PlatformError> {
    info!("Initializing Shipyard...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), PlatformError> {
    let app_state = Arc::new(AppState::init(options).await?);
    shutdown_manager.with_app_state(app_state.clone())?;

    if options.enable_ingester {
        init_ingester_worker(
            options.ingester.clone(),
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )?;
    }

    if options.enable_watcher {
        init_watcher_worker(
            options.watcher.clone(),
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )?;
    }

    init_api_server(options, app_state.clone(), shutdown_manager, shutdown_tx.subscribe()).await?;

    if options.enable_proxy {
        init_proxy_server(options, app_state, shutdown_manager, shutdown_tx.subscribe()).await?;
    }

    Ok(())
}

fn init_ingester_worker(
    options: ingester::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), PlatformError> {
    info!("Initializing log ingester...");

    let db = app_state.db.clone();

    let handle = tokio::spawn(async move {
        ingester::run(
            &options,
            db.clone(),
            db,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_ingester_worker_handle(handle)
}

fn init_watcher_worker(
    options: watcher::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), PlatformError> {
    info!("Initializing status watcher...");

    let orchestrator = app_state.orchestrator.clone();

    let handle = tokio::spawn(async move {
        watcher::run(
            &options,
            orchestrator,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_watcher_worker_handle(handle)
}

async fn init_api_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), PlatformError> {
    info!("Initializing API server...");

    let server_state = ServerState::new(
        app_state.orchestrator.clone(),
        app_state.db.clone(),
        app_state.bus.clone(),
    );

    let handle = serve("API", &options.api, api_router(Arc::new(server_state)), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_api_server_handle(handle)
}

async fn init_proxy_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), PlatformError> {
    info!("Initializing reverse proxy...");

    let proxy_state = ProxyState {
        store: app_state.db.clone(),
        blob: app_state.blob.clone(),
        bucket: options.blob.bucket.clone(),
        directory_prefix: options.directory_prefix.clone(),
    };

    let handle = serve("proxy", &options.proxy, proxy_router(Arc::new(proxy_state)), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_proxy_server_handle(handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    api_server_handle: Option<JoinHandle<Result<(), PlatformError>>>,
    proxy_server_handle: Option<JoinHandle<Result<(), PlatformError>>>,
    watcher_worker_handle: Option<JoinHandle<()>>,
    ingester_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            api_server_handle: None,
            proxy_server_handle: None,
            watcher_worker_handle: None,
            ingester_worker_handle: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), PlatformError> {
        if self.app_state.is_some() {
            return Err(PlatformError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_watcher_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), PlatformError> {
        if self.watcher_worker_handle.is_some() {
            return Err(PlatformError::ShutdownError("watcher_handle already set".to_string()));
        }
        self.watcher_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_ingester_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), PlatformError> {
        if self.ingester_worker_handle.is_some() {
            return Err(PlatformError::ShutdownError("ingester_handle already set".to_string()));
        }
        self.ingester_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_api_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), PlatformError>>,
    ) -> Result<(), PlatformError> {
        if self.api_server_handle.is_some() {
            return Err(PlatformError::ShutdownError("api_server_handle already set".to_string()));
        }
        self.api_server_handle = Some(handle);
        Ok(())
    }

    pub fn with_proxy_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), PlatformError>>,
    ) -> Result<(), PlatformError> {
        if self.proxy_server_handle.is_some() {
            return Err(PlatformError::ShutdownError("proxy_server_handle already set".to_string()));
        }
        self.proxy_server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), PlatformError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), PlatformError> {
        info!("Shutting down Shipyard...");

        // 1. Stop accepting requests
        if let Some(handle) = self.api_server_handle.take() {
            handle.await.map_err(|e| PlatformError::ShutdownError(e.to_string()))??;
        }
        if let Some(handle) = self.proxy_server_handle.take() {
            handle.await.map_err(|e| PlatformError::ShutdownError(e.to_string()))??;
        }

        // 2. Watcher
        if let Some(handle) = self.watcher_worker_handle.take() {
            handle.await.map_err(|e| PlatformError::ShutdownError(e.to_string()))?;
        }

        // 3. Ingester, after producers inside this process are gone
        if let Some(handle) = self.ingester_worker_handle.take() {
            handle.await.map_err(|e| PlatformError::ShutdownError(e.to_string()))?;
        }

        // 4. App state
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}

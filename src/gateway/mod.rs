//! Control gateway: HTTP surface for task CRUD and asynchronous executions.

pub mod executions;
pub mod routes;

pub use executions::{Execution, ExecutionParams, ExecutionRegistry, ExecutionStatus};
pub use routes::ApiError;

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::{Any, CorsLayer};

use crate::backends::BackendRouter;
use crate::store::TaskStore;
use crate::worker::RoutingOptions;

/// Shared handler state. Store and router are built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TaskStore>,
    pub router: Arc<BackendRouter>,
    pub executions: Arc<ExecutionRegistry>,
    /// Applied to executions that do not override them.
    pub defaults: RoutingOptions,
    pub started: Instant,
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
}

impl AppState {
    pub fn new(store: Arc<dyn TaskStore>, router: Arc<BackendRouter>) -> Self {
        Self {
            store,
            router,
            executions: Arc::new(ExecutionRegistry::new()),
            defaults: RoutingOptions::default(),
            started: Instant::now(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn with_defaults(mut self, defaults: RoutingOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}

/// Full application router with CORS.
pub fn app(state: AppState) -> Router {
    routes::routes(state).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

/// Serve until the shutdown token fires, then wait for running executions
/// to finish their current task.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    let tracker = state.tracker.clone();
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Gateway listening");
    }

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracker.close();
    if !tracker.is_empty() {
        tracing::info!(running = tracker.len(), "Waiting for executions to finish");
    }
    tracker.wait().await;
    tracing::info!("Gateway stopped");
    Ok(())
}

//! API server setup.
//!
//! # Responsibilities
//! - Create the Axum router with all handlers
//! - Wire up middleware (tracing, timeout)
//! - Serve until shutdown

use axum::{routing::get, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::cache::ConfigCache;
use crate::discovery::{Resolver, VipRole};
use crate::http::handlers;
use crate::orchestrator::{LeadershipState, WorkerStatus};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub node_id: String,
    pub cache: Option<Arc<ConfigCache>>,
    pub resolver: Option<Arc<Resolver>>,
    pub leadership: Option<watch::Receiver<LeadershipState>>,
    pub worker: Option<watch::Receiver<WorkerStatus>>,
    pub vip: Option<watch::Receiver<VipRole>>,
}

impl AppState {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            cache: None,
            resolver: None,
            leadership: None,
            worker: None,
            vip: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<ConfigCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_leadership(mut self, rx: watch::Receiver<LeadershipState>) -> Self {
        self.leadership = Some(rx);
        self
    }

    pub fn with_worker(mut self, rx: watch::Receiver<WorkerStatus>) -> Self {
        self.worker = Some(rx);
        self
    }

    pub fn with_vip(mut self, rx: watch::Receiver<VipRole>) -> Self {
        self.vip = Some(rx);
        self
    }
}

/// HTTP server for the status / discovery API.
pub struct ApiServer {
    router: Router,
}

impl ApiServer {
    pub fn new(state: AppState) -> Self {
        Self {
            router: Self::build_router(state),
        }
    }

    #[allow(deprecated)]
    fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/resolve", get(handlers::resolve))
            .route("/status", get(handlers::status))
            .route("/groups/{group}", get(handlers::group))
            .with_state(state)
            .layer(TimeoutLayer::new(Duration::from_secs(10)))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve on `listener` until `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "API server starting");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        tracing::info!("API server stopped");
        Ok(())
    }
}

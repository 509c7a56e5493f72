//! Web server module.

mod handlers;

use crate::aggregator::{Aggregator, BatchRegistry};
use crate::cache::RateCache;
use crate::config::ServerConfig;
use crate::crypto::SecretCipher;
use crate::db::Store;
use crate::probe::{CurrencyRate, JobsDriver};

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Store,
    pub aggregator: Aggregator,
    pub jobs: Arc<JobsDriver>,
    pub rates: Arc<RateCache<Vec<CurrencyRate>>>,
    pub cipher: Arc<SecretCipher>,
    pub batches: Arc<BatchRegistry>,
}

/// Build the router with all routes.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Target registry
        .route("/targets", get(handlers::handle_list_targets).post(handlers::handle_create_target))
        .route(
            "/targets/{id}",
            put(handlers::handle_update_target).delete(handlers::handle_delete_target),
        )
        // Job schedulers
        .route("/targets/{id}/jobs", get(handlers::handle_target_jobs))
        .route("/targets/{id}/execute", post(handlers::handle_start_job))
        .route("/targets/{id}/stop", post(handlers::handle_stop_job))
        .route("/targets/{id}/history", get(handlers::handle_job_history))
        // Fan-out
        .route("/targets/refresh", post(handlers::handle_refresh))
        .route("/targets/refresh/{batch_id}/cancel", post(handlers::handle_cancel_refresh))
        .route("/targets/status", get(handlers::handle_status))
        // Cached exchange rates
        .route("/reachability-targets/currencies/{id}", get(handlers::handle_currency_rates))
        .route("/reachability-targets/currencies/cache/stats", get(handlers::handle_cache_stats))
        .route("/reachability-targets/currencies/cache/clear", post(handlers::handle_cache_clear_all))
        .route(
            "/reachability-targets/currencies/cache/clear/{id}",
            post(handlers::handle_cache_clear_one),
        )
        // Reachability
        .route("/services", get(handlers::handle_list_services))
        .route("/services/ping/{id}", post(handlers::handle_ping))
        .route("/services/ping-batch", post(handlers::handle_ping_batch))
        .route("/services/history/{id}", get(handlers::handle_ping_history))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
        .with_state(state)
}

/// HTTP front of the dashboard core.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = router(self.state.clone());

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

//! HTTP server wiring: router, middleware, swagger mount, graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use cohort_core::config::AppConfig;
use cohort_service::SegmentService;

use crate::rest::{self, AppState};
use crate::swagger::ApiDoc;

/// Build the application router. Exposed separately so tests can drive the
/// service through the full HTTP stack without binding a socket.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/user", post(rest::create_user))
        .route(
            "/segment",
            post(rest::create_segment).delete(rest::delete_segment),
        )
        .route("/segment/user", post(rest::update_user_segments))
        .route("/segment/user/:user_id", get(rest::get_user_segments))
        .route("/segment/history/:user_id", get(rest::get_user_history))
        .route("/segment/reports/:file_name", get(rest::download_report))
        .route("/health", get(rest::health_check))
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct ApiServer {
    config: AppConfig,
    service: Arc<SegmentService>,
}

impl ApiServer {
    pub fn new(config: AppConfig, service: Arc<SegmentService>) -> Self {
        Self { config, service }
    }

    /// Start the HTTP server; blocks until shutdown.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let app = router(AppState {
            service: self.service.clone(),
        });

        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);
        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Server stopped");
        Ok(())
    }

    /// Start the Prometheus metrics exporter on its own port.
    pub async fn start_metrics(&self) -> anyhow::Result<()> {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        let handle = builder
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install_recorder()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");

        // Keep the handle alive
        std::mem::forget(handle);
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received, draining connections");
}

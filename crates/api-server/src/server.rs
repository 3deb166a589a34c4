//! API server: HTTP routes plus the Prometheus exporter.

use crate::rest::{self, AppState};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use fast_ingest_core::config::AppConfig;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct ApiServer {
    config: AppConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: AppConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Routes and middleware, without binding a socket.
    pub fn router(state: AppState, max_body_bytes: usize) -> Router {
        Router::new()
            .route("/events", post(rest::ingest_event))
            .route("/events/bulk", post(rest::ingest_bulk))
            .route("/metrics", get(rest::get_metrics))
            .route("/health", get(rest::health_check))
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::x_request_id())
                    .layer(CompressionLayer::new())
                    .layer(CorsLayer::permissive()),
            )
            .layer(DefaultBodyLimit::max(max_body_bytes))
            .with_state(state)
    }

    /// Serve HTTP until `shutdown` is cancelled, then finish in-flight
    /// requests and return.
    pub async fn start_http(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = Self::router(self.state.clone(), self.config.api.max_body_bytes);

        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);
        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }

    /// Install the Prometheus recorder and its HTTP listener.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}

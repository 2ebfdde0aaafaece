//! HTTP server for the Prometheus metrics endpoint.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{info, trace};

use crate::error::ExporterError;
use crate::metrics::{self, SharedMetrics};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    metrics: SharedMetrics,
}

/// Create the HTTP router.
fn create_router(metrics: SharedMetrics, metrics_path: &str) -> Router {
    let state = AppState { metrics };

    Router::new()
        .route(metrics_path, get(metrics_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handler for the metrics endpoint.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let body = state.metrics.render();
    trace!(bytes = body.len(), "Serving scrape");

    (StatusCode::OK, [(CONTENT_TYPE, metrics::CONTENT_TYPE)], body).into_response()
}

/// HTTP server bound to its listen address.
pub struct HttpServer {
    metrics: SharedMetrics,
    listener: TcpListener,
    metrics_path: String,
}

impl HttpServer {
    /// Bind the listener. Failing to bind is fatal for the exporter, so it
    /// happens before any task is spawned.
    pub async fn bind(
        metrics: SharedMetrics,
        listen_addr: SocketAddr,
        metrics_path: String,
    ) -> Result<Self, ExporterError> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|source| ExporterError::Bind {
                addr: listen_addr,
                source,
            })?;

        Ok(Self {
            metrics,
            listener,
            metrics_path,
        })
    }

    /// The address actually bound, which differs from the configured one when
    /// port 0 was requested.
    pub fn local_addr(&self) -> Result<SocketAddr, ExporterError> {
        self.listener.local_addr().map_err(ExporterError::Http)
    }

    /// Serve scrapes until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ExporterError> {
        let router = create_router(self.metrics, &self.metrics_path);

        info!(
            addr = %self.listener.local_addr().map_err(ExporterError::Http)?,
            path = %self.metrics_path,
            "HTTP server listening"
        );

        // Run server with graceful shutdown
        axum::serve(self.listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(ExporterError::Http)?;

        info!("HTTP server stopped");
        Ok(())
    }
}

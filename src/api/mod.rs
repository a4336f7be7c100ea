//! HTTP API server: health probe and the one-shot upload pipeline

pub mod health;
pub mod voice;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::pipeline::Services;

/// Shared state for API handlers
#[derive(Debug, Clone)]
pub struct ApiState {
    pub services: Services,
    /// Force-emit deadline used when splitting a reply for synthesis
    pub first_sentence_deadline: Duration,
}

/// Build the full router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .merge(health::router())
        .nest("/api", voice::router(state))
        .layer(TraceLayer::new_for_http())
}

/// HTTP API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
}

impl ApiServer {
    #[must_use]
    pub fn new(state: ApiState, port: u16) -> Self {
        Self {
            state: Arc::new(state),
            port,
        }
    }

    /// Run the API server until `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns error if server fails to start
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        tracing::info!(%addr, "starting API server");

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        tracing::info!("API server stopped");
        Ok(())
    }

    /// Spawn the API server as a background task
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}

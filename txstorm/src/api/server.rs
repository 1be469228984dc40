//! HTTP API server.

use core::net::SocketAddr;
use std::{io, sync::Arc};

use axum::Router;
use tokio::net::TcpListener;

use super::metrics::{self, MetricsState};

/// HTTP API server.
pub struct Server {
    listener: TcpListener,
    metrics_state: Arc<MetricsState>,
}

impl Server {
    /// Binds a new API server to the given address.
    pub async fn bind(addr: SocketAddr, metrics_state: Arc<MetricsState>) -> Result<Self, io::Error> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { listener, metrics_state })
    }

    #[inline]
    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.listener.local_addr()
    }

    /// Runs the API server.
    pub async fn run(self) -> Result<(), io::Error> {
        let app = Router::new().merge(metrics::router(self.metrics_state));

        log::info!("API server listening on {}", self.listener.local_addr()?);

        axum::serve(self.listener, app).await
    }
}

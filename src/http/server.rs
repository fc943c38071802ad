//! HTTP server for the admission service.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{error, info};

use super::service::router;
use crate::admission::Admission;
use crate::error::{Result, TollgateError};

/// HTTP server exposing admission decisions and quota introspection.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The admission adapter serving requests
    admission: Admission,
}

impl HttpServer {
    /// Create a new server.
    pub fn new(addr: SocketAddr, admission: Admission) -> Self {
        Self { addr, admission }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let app = router(self.admission);

        info!(addr = %self.addr, "Starting HTTP admission service");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TollgateError::Io(e)
        })
    }
}

//! Liveness endpoint for the process monitor

use crate::CONSOLE_TARGET;
use axum::{Router, http::StatusCode, routing::get};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const ALIVE: &str = "Discord bot is running!";
pub const NOT_FOUND: &str = "Not found";

#[must_use]
pub fn router() -> Router {
    Router::new()
        .route("/", get(health_handler))
        .fallback(not_found_handler)
}

async fn health_handler() -> &'static str {
    ALIVE
}

async fn not_found_handler() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, NOT_FOUND)
}

/// Bind `0.0.0.0:port` and serve until `shutdown` fires
///
/// # Errors
/// Returns an error if the port cannot be bound or the server fails.
pub async fn serve(port: u16, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    info!(target: CONSOLE_TARGET, addr = %listener.local_addr()?, "Health server listening");
    axum::serve(listener, router())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

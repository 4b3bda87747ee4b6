//! Status HTTP server
//!
//! Exposes the run snapshot as JSON for monitoring tools.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;
use tracing::info;

use crate::snapshot::{RunSnapshot, SharedSnapshot};

/// Default listen address for the status endpoint
pub const DEFAULT_STATUS_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 7879);

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    Bind(#[from] std::io::Error),

    #[error("Server stopped: {0}")]
    Serve(std::io::Error),
}

/// Handler for GET /status
async fn get_status(State(snapshot): State<SharedSnapshot>) -> Json<RunSnapshot> {
    Json(snapshot.read().await.clone())
}

/// Creates the axum Router with the status endpoint
pub fn create_status_router(snapshot: SharedSnapshot) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(snapshot)
}

/// Runs the status HTTP server until it fails
pub async fn run_status_server(snapshot: SharedSnapshot, addr: SocketAddr) -> Result<(), ServerError> {
    let app = create_status_router(snapshot);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "status endpoint listening");
    axum::serve(listener, app).await.map_err(ServerError::Serve)?;

    Ok(())
}

//! HTTP status endpoint.
//!
//! A deliberately small surface: operators point health checks at it to see
//! that the daemon is up. Disabled when the configured port is zero.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
struct StatusState {
    client_name: Arc<String>,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    client_name: String,
    status: &'static str,
}

/// Serve `/status` and `/liveness` until the token cancels.
pub async fn serve_status(
    port: u16,
    client_name: String,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "status endpoint listening");

    let app = Router::new()
        .route("/status", get(status))
        .route("/liveness", get(liveness))
        .with_state(StatusState {
            client_name: Arc::new(client_name),
        });

    axum::serve(listener, app)
        .with_graceful_shutdown(token.cancelled_owned())
        .await?;
    Ok(())
}

async fn status(State(state): State<StatusState>) -> Json<StatusBody> {
    Json(StatusBody {
        client_name: state.client_name.as_ref().clone(),
        status: "running",
    })
}

async fn liveness() -> StatusCode {
    StatusCode::NO_CONTENT
}

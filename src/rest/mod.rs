//! Public REST API server.
//!
//! Endpoints:
//!   POST /api/v1/requests              — validate + enqueue a task
//!   GET  /api/v1/requests/{id}         — durable status of one task
//!   GET  /api/v1/requests/{id}/events  — live event stream (SSE)
//!   GET  /api/v1/health

pub mod routes;
pub mod sse;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::AppContext;

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/api/v1/health", get(routes::health))
        .route("/api/v1/requests", post(routes::create_request))
        .route("/api/v1/requests/{id}", get(routes::get_request))
        .route("/api/v1/requests/{id}/events", get(sse::request_events_sse))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// Serve until `shutdown` flips true.
pub async fn start_rest_server(
    ctx: Arc<AppContext>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let bind = format!("{}:{}", ctx.config.bind_address, ctx.config.port);
    let addr: SocketAddr = bind.parse()?;
    let router = build_router(ctx);

    info!("REST API listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

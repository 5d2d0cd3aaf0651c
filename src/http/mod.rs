// http/mod.rs — HTTP control surface: health + Prometheus metrics.
//
// Axum server on the metrics port, local only by default.
//
// Endpoints:
//   GET /healthz   200 while accepting tasks, 503 during drain
//   GET /metrics   Prometheus text exposition

use anyhow::Result;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::AppContext;

pub async fn run(ctx: Arc<AppContext>, cancel: CancellationToken) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", ctx.config.stream.host, ctx.config.metrics_port)
        .parse()?;
    let router = build_router(ctx);

    info!(addr = %addr, "metrics server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    info!("metrics server stopped");
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

async fn healthz(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let accepting = ctx.orchestrator.is_accepting();
    let body = Json(json!({
        "status": if accepting { "ok" } else { "draining" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }));
    let status = if accepting {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, body)
}

async fn metrics(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        ctx.metrics.render_prometheus(),
    )
}

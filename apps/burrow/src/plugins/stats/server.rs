//! Local dashboard API for the stats store.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tracing::info;

use super::{RequestEntry, Store, TunnelStats};

pub async fn serve(store: Arc<Store>, port: u16) -> Result<()> {
    let app = Router::new()
        .route("/api/stats", get(stats))
        .route("/api/logs", get(logs))
        .with_state(store);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("failed to bind stats dashboard on port {port}"))?;
    info!("stats dashboard API listening on http://127.0.0.1:{port}");

    axum::serve(listener, app)
        .await
        .context("stats dashboard server exited")
}

async fn stats(State(store): State<Arc<Store>>) -> Json<Vec<TunnelStats>> {
    Json(store.snapshot())
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default = "default_log_limit")]
    n: usize,
}

fn default_log_limit() -> usize {
    100
}

async fn logs(State(store): State<Arc<Store>>, Query(query): Query<LogsQuery>) -> Json<Vec<RequestEntry>> {
    Json(store.recent_logs(query.n))
}

pub mod blocklist;
pub mod config;
pub mod handlers;
pub mod middleware;
pub mod mux;
pub mod registry;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::EdgeConfig;
use crate::middleware::{ConfigCache, VisitorMiddleware};
use crate::mux::TunnelMux;
use crate::registry::Registry;

/// Shared state behind every edge handler.
#[derive(Clone)]
pub struct AppState {
    pub mux: Arc<TunnelMux>,
    pub registry: Registry,
    pub config_cache: Arc<ConfigCache>,
    pub middlewares: Arc<Vec<Box<dyn VisitorMiddleware>>>,
    pub reserved: Arc<HashSet<String>>,
}

impl AppState {
    pub fn new(config: &EdgeConfig, registry: Registry) -> Self {
        Self {
            mux: Arc::new(TunnelMux::new(config.request_timeout)),
            registry,
            config_cache: Arc::new(ConfigCache::new(config.config_cache_ttl)),
            middlewares: Arc::new(middleware::default_middlewares()),
            reserved: Arc::new(config.reserved_subdomains.iter().cloned().collect()),
        }
    }
}

/// Build the edge router: the register API, the agent socket endpoint,
/// and a catch-all for visitor traffic on `*.zone` hosts.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/register", post(handlers::register))
        .route("/_tunnel", get(handlers::tunnel_upgrade))
        .fallback(handlers::visitor)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Convenience used by main and the integration tests: bind and serve
/// with connect info (the IP allow-list middleware needs peer addresses).
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> std::io::Result<()> {
    let service = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, service).await
}

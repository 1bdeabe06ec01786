use std::env;
use std::time::Duration;

use burrow_proto::REQUEST_TIMEOUT_SECS;

/// Lifetime of one cached per-tunnel config entry.
const CONFIG_CACHE_TTL_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub port: u16,
    pub database_url: String,
    /// Public zone the edge serves, e.g. `burrow.dev`.
    pub zone: String,
    pub request_timeout: Duration,
    pub config_cache_ttl: Duration,
    /// Subdomains that always 404 for visitor traffic.
    pub reserved_subdomains: Vec<String>,
}

impl EdgeConfig {
    pub fn from_env() -> Self {
        Self {
            port: env::var("BURROW_EDGE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8787),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://burrow-edge.db?mode=rwc".to_string()),
            zone: env::var("BURROW_ZONE").unwrap_or_else(|_| "burrow.dev".to_string()),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            config_cache_ttl: Duration::from_secs(CONFIG_CACHE_TTL_SECS),
            reserved_subdomains: vec!["www".to_string(), "tunnel".to_string()],
        }
    }
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            port: 8787,
            database_url: "sqlite://burrow-edge.db?mode=rwc".to_string(),
            zone: "burrow.dev".to_string(),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            config_cache_ttl: Duration::from_secs(CONFIG_CACHE_TTL_SECS),
            reserved_subdomains: vec!["www".to_string(), "tunnel".to_string()],
        }
    }
}

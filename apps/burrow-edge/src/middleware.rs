//! Visitor-side middleware: each inbound visitor request walks a fixed
//! chain in registration order; the first middleware that returns a
//! response short-circuits the walk. Middlewares read the per-tunnel
//! config blob stored at registration time.

use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::blocklist::is_subdomain_blocked;
use crate::registry::Registry;

/// Everything a middleware may consult for one visitor request.
pub struct VisitorContext<'a> {
    pub subdomain: &'a str,
    pub config: &'a serde_json::Value,
    pub remote_ip: Option<IpAddr>,
    pub headers: &'a HeaderMap,
}

pub trait VisitorMiddleware: Send + Sync {
    fn name(&self) -> &'static str;
    /// `Some(response)` short-circuits the request; `None` passes it on.
    fn check(&self, ctx: &VisitorContext<'_>) -> Option<Response>;
}

/// The built-in chain, in registration order.
pub fn default_middlewares() -> Vec<Box<dyn VisitorMiddleware>> {
    vec![
        Box::new(BlockedSubdomain),
        Box::new(IpAllow),
        Box::new(BasicAuth),
    ]
}

/// Rejects subdomains that fail the offensive-word check, covering
/// rows allocated before a blocklist change.
struct BlockedSubdomain;

impl VisitorMiddleware for BlockedSubdomain {
    fn name(&self) -> &'static str {
        "blocked-subdomain"
    }

    fn check(&self, ctx: &VisitorContext<'_>) -> Option<Response> {
        if is_subdomain_blocked(ctx.subdomain) {
            debug!(subdomain = ctx.subdomain, "blocked subdomain");
            return Some((StatusCode::FORBIDDEN, "Subdomain blocked").into_response());
        }
        None
    }
}

/// Enforces the tunnel's `allowIps` list: exact addresses or v4 CIDR
/// prefixes. An absent or empty list admits everyone.
struct IpAllow;

impl VisitorMiddleware for IpAllow {
    fn name(&self) -> &'static str {
        "ip-allow"
    }

    fn check(&self, ctx: &VisitorContext<'_>) -> Option<Response> {
        let allowed = match ctx.config.get("allowIps").and_then(|v| v.as_array()) {
            Some(list) if !list.is_empty() => list,
            _ => return None,
        };
        let Some(remote) = ctx.remote_ip else {
            return Some(StatusCode::FORBIDDEN.into_response());
        };
        for entry in allowed {
            let Some(pattern) = entry.as_str() else {
                continue;
            };
            if ip_matches(remote, pattern) {
                return None;
            }
        }
        debug!(subdomain = ctx.subdomain, %remote, "visitor IP not in allow list");
        Some(StatusCode::FORBIDDEN.into_response())
    }
}

fn ip_matches(remote: IpAddr, pattern: &str) -> bool {
    if let Some((net, prefix)) = pattern.split_once('/') {
        let (IpAddr::V4(remote), Ok(net), Ok(prefix)) =
            (remote, net.parse::<Ipv4Addr>(), prefix.parse::<u32>())
        else {
            return false;
        };
        if prefix > 32 {
            return false;
        }
        let mask = if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        };
        return (u32::from(remote) & mask) == (u32::from(net) & mask);
    }
    pattern
        .parse::<IpAddr>()
        .map(|allowed| allowed == remote)
        .unwrap_or(false)
}

/// HTTP basic auth against the tunnel's `auth` config (`user:pass`).
struct BasicAuth;

impl VisitorMiddleware for BasicAuth {
    fn name(&self) -> &'static str {
        "basic-auth"
    }

    fn check(&self, ctx: &VisitorContext<'_>) -> Option<Response> {
        let expected = match ctx.config.get("auth").and_then(|v| v.as_str()) {
            Some(expected) if !expected.is_empty() => expected,
            _ => return None,
        };
        if let Some(supplied) = ctx
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Basic "))
            .and_then(|b64| BASE64.decode(b64).ok())
        {
            if supplied == expected.as_bytes() {
                return None;
            }
        }
        Some(
            (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"burrow\"")],
                "Unauthorized",
            )
                .into_response(),
        )
    }
}

/// 30-second read-through cache over the registry's per-tunnel config,
/// invalidated when a registration overwrites the stored config.
pub struct ConfigCache {
    ttl: Duration,
    entries: DashMap<String, CachedConfig>,
}

struct CachedConfig {
    loaded_at: Instant,
    config: serde_json::Value,
}

impl ConfigCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub async fn load(&self, registry: &Registry, subdomain: &str) -> serde_json::Value {
        if let Some(entry) = self.entries.get(subdomain) {
            if entry.loaded_at.elapsed() < self.ttl {
                return entry.config.clone();
            }
        }
        let config = match registry.tunnel_config(subdomain).await {
            Ok(Some(config)) => config,
            Ok(None) => serde_json::Value::Object(Default::default()),
            Err(err) => {
                warn!(subdomain, %err, "config load failed, applying empty config");
                serde_json::Value::Object(Default::default())
            }
        };
        self.entries.insert(
            subdomain.to_string(),
            CachedConfig {
                loaded_at: Instant::now(),
                config: config.clone(),
            },
        );
        config
    }

    pub fn invalidate(&self, subdomain: &str) {
        self.entries.remove(subdomain);
    }
}

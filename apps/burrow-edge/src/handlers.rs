use std::collections::HashMap;
use std::net::SocketAddr;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use tracing::{debug, error, info};
use uuid::Uuid;

use burrow_proto::{encoding, headers, HttpRequest, HttpResponse, RegisterRequest, RegisterResponse};

use crate::middleware::VisitorContext;
use crate::mux::ProxyError;
use crate::AppState;

/// `POST /api/register` — idempotent on `(clientId, port)`: an
/// existing tunnel keeps its subdomain (its config is overwritten when
/// a new one is supplied), a new port gets a fresh allocation.
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Response {
    if request.client_id.is_empty() || request.ports.is_empty() {
        return register_error(StatusCode::BAD_REQUEST, "clientId and ports are required");
    }

    let config = request.config.map(serde_json::Value::Object);
    let mut tunnels = HashMap::new();
    for port in request.ports {
        match state
            .registry
            .ensure_tunnel(&request.client_id, port, config.as_ref())
            .await
        {
            Ok(outcome) => {
                if outcome.config_updated {
                    state.config_cache.invalidate(&outcome.subdomain);
                }
                info!(client_id = %request.client_id, port, subdomain = %outcome.subdomain, "tunnel registered");
                tunnels.insert(port, outcome.subdomain);
            }
            Err(err) => {
                error!(client_id = %request.client_id, port, %err, "tunnel registration failed");
                return register_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
            }
        }
    }

    Json(RegisterResponse {
        tunnels,
        error: None,
    })
    .into_response()
}

fn register_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(RegisterResponse {
            tunnels: HashMap::new(),
            error: Some(message.to_string()),
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct TunnelQuery {
    subdomain: Option<String>,
}

/// `GET /_tunnel?subdomain=<s>` — the agent socket endpoint. 400 when
/// the subdomain parameter is missing, 426 when the request is not a
/// WebSocket upgrade.
pub async fn tunnel_upgrade(
    State(state): State<AppState>,
    Query(query): Query<TunnelQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let Some(subdomain) = query.subdomain.filter(|s| !s.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Missing subdomain parameter").into_response();
    };
    let Some(ws) = ws else {
        return StatusCode::UPGRADE_REQUIRED.into_response();
    };
    let mux = state.mux.clone();
    ws.on_upgrade(move |socket| mux.serve_agent(socket, subdomain))
}

/// Catch-all for `https://<subdomain>.<zone>/*` visitor traffic.
pub async fn visitor(
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: Option<WebSocketUpgrade>,
    request: Request,
) -> Response {
    let Some(subdomain) = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .and_then(subdomain_from_host)
    else {
        return (StatusCode::NOT_FOUND, "Not found").into_response();
    };
    let subdomain = subdomain.to_string();

    if state.reserved.contains(&subdomain) {
        return (StatusCode::NOT_FOUND, "Not found").into_response();
    }

    let config = state.config_cache.load(&state.registry, &subdomain).await;
    let ctx = VisitorContext {
        subdomain: &subdomain,
        config: &config,
        remote_ip: Some(remote_addr.ip()),
        headers: request.headers(),
    };
    for middleware in state.middlewares.iter() {
        if let Some(response) = middleware.check(&ctx) {
            debug!(%subdomain, middleware = middleware.name(), "request short-circuited");
            return response;
        }
    }

    if !state.mux.agent_connected(&subdomain) {
        return (StatusCode::BAD_GATEWAY, "Tunnel not connected").into_response();
    }

    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    match ws {
        Some(ws) => {
            let wire_headers = headers::from_header_map(request.headers());
            let mux = state.mux.clone();
            ws.on_upgrade(move |socket| mux.serve_visitor(socket, subdomain, path, wire_headers))
        }
        None => proxy_visitor_request(&state, &subdomain, path, request).await,
    }
}

async fn proxy_visitor_request(
    state: &AppState,
    subdomain: &str,
    path: String,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let method = parts.method.as_str().to_string();
    let wire_headers = headers::from_header_map(&parts.headers);

    // GET and HEAD never carry a body field.
    let body = if parts.method == http::Method::GET || parts.method == http::Method::HEAD {
        None
    } else {
        match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) if bytes.is_empty() => None,
            Ok(bytes) => Some(encoding::encode_chunked(&bytes)),
            Err(err) => {
                debug!(subdomain, %err, "failed to read visitor body");
                return (StatusCode::BAD_REQUEST, "Failed to read request body").into_response();
            }
        }
    };

    let envelope = HttpRequest {
        id: Uuid::new_v4().to_string(),
        method,
        path,
        headers: wire_headers,
        body,
    };

    match state.mux.proxy_http(subdomain, envelope).await {
        Ok(response) => visitor_response(response),
        Err(ProxyError::Timeout) => {
            (StatusCode::GATEWAY_TIMEOUT, "Request timed out").into_response()
        }
        Err(ProxyError::TunnelNotConnected) => {
            (StatusCode::BAD_GATEWAY, "Tunnel not connected").into_response()
        }
        Err(ProxyError::SendFailed) | Err(ProxyError::TunnelClosed) => {
            (StatusCode::BAD_GATEWAY, "Tunnel disconnected").into_response()
        }
    }
}

/// Rebuild the visitor-facing response from the agent's envelope.
fn visitor_response(envelope: HttpResponse) -> Response {
    let status = StatusCode::from_u16(envelope.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let body = match envelope.body.as_deref() {
        Some(encoded) => match encoding::decode(encoded) {
            Ok(bytes) => bytes,
            Err(_) => {
                return (StatusCode::BAD_GATEWAY, "Invalid response body from tunnel")
                    .into_response()
            }
        },
        None => Vec::new(),
    };

    let mut response = Response::new(axum::body::Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers::to_header_map(&envelope.headers);
    response
}

/// First DNS label of the Host header, without any port suffix.
fn subdomain_from_host(host: &str) -> Option<&str> {
    let hostname = host.split(':').next()?;
    let label = hostname.split('.').next()?;
    if label.is_empty() {
        None
    } else {
        Some(label)
    }
}

//! The local HTTP leg of the tunnel: rebuild each forwarded request
//! against the local server and re-encode the response. Every failure
//! on this leg becomes a synthesized 502 envelope with a short
//! diagnostic body; nothing propagates an error up to the read loop.

use std::time::Duration;

use anyhow::{Context, Result};
use http::header::{HeaderValue, HOST};
use http::Method;
use tracing::debug;

use burrow_proto::{encoding, headers, HttpRequest, HttpResponse, REQUEST_TIMEOUT_SECS};

use crate::config;

/// Client used for all requests of one tunnel connection. Redirects
/// are returned verbatim for the visitor's browser to follow.
pub fn local_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("failed to build local HTTP client")
}

/// Forward one `http-request` envelope to `localhost:<port>` and
/// return the `http-response` envelope for it.
pub async fn handle_request(
    client: &reqwest::Client,
    request: &HttpRequest,
    local_port: u16,
) -> HttpResponse {
    let target_host = config::target_host();
    let url = format!("http://{target_host}:{local_port}{}", request.path);

    let Ok(method) = Method::from_bytes(request.method.as_bytes()) else {
        return HttpResponse::synthesized(&request.id, 502, "Invalid request method");
    };

    let body = match request.body.as_deref() {
        Some(encoded) => match encoding::decode(encoded) {
            Ok(bytes) => bytes,
            Err(_) => {
                return HttpResponse::synthesized(&request.id, 502, "Invalid request body");
            }
        },
        None => Vec::new(),
    };

    let mut header_map =
        headers::to_header_map(&headers::without(&request.headers, headers::REQUEST_STRIP));
    // Many local dev servers check the Host header.
    if let Ok(host) = HeaderValue::from_str(&format!("{target_host}:{local_port}")) {
        header_map.insert(HOST, host);
    }

    let result = client
        .request(method, &url)
        .headers(header_map)
        .body(body)
        .send()
        .await;

    let response = match result {
        Ok(response) => response,
        Err(err) => {
            debug!(local_port, %err, "local request failed");
            return HttpResponse::synthesized(
                &request.id,
                502,
                &format!("Failed to connect to local port {local_port}: {err}"),
            );
        }
    };

    let status = response.status().as_u16();
    // The client has already decompressed and rebuffered the body, so
    // the encoding headers describe bytes that no longer exist.
    let response_headers = headers::without(
        &headers::from_header_map(response.headers()),
        headers::RESPONSE_STRIP,
    );

    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            return HttpResponse::synthesized(
                &request.id,
                502,
                &format!("Failed to read local response: {err}"),
            );
        }
    };

    HttpResponse {
        id: request.id.clone(),
        status,
        headers: response_headers,
        body: if bytes.is_empty() {
            None
        } else {
            Some(encoding::encode_chunked(&bytes))
        },
    }
}

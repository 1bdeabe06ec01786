//! Shared wire protocol for agent ↔ edge tunnel traffic.
//! Keeping this in a dedicated crate lets both the edge server and the
//! agent CLI speak the exact same envelope format without pulling in
//! heavier runtime code.

use serde::{Deserialize, Serialize};

pub mod encoding;
pub mod headers;

pub use headers::Headers;

/// Keepalive tokens exchanged as literal text frames, outside the
/// JSON envelope format. The agent emits `PING` every 30 seconds; the
/// edge answers `PONG` without waking any tunnel logic.
pub const PING: &str = "ping";
pub const PONG: &str = "pong";

/// Interval between agent keepalive pings.
pub const KEEPALIVE_SECS: u64 = 30;

/// Timeout applied to one proxied HTTP request, on both sides. The
/// edge-side pending timeout and the agent-side local client timeout
/// are deliberately the same value so whichever fires first, the other
/// side's state is reaped within one round trip.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// One message of the tunnel protocol. Serialized as a JSON object
/// with a `type` tag drawn from a closed set; unknown tags fail to
/// parse and are dropped at the dispatch sites, unknown fields inside
/// a known message are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "http-request")]
    HttpRequest(HttpRequest),
    #[serde(rename = "http-response")]
    HttpResponse(HttpResponse),
    #[serde(rename = "ws-open")]
    WsOpen(WsOpen),
    #[serde(rename = "ws-frame")]
    WsFrame(WsFrame),
    #[serde(rename = "ws-close")]
    WsClose(WsClose),
}

impl Envelope {
    /// Serialize to the single text frame that goes on the socket.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).expect("envelope serialization cannot fail")
    }
}

/// A visitor HTTP request forwarded edge → agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequest {
    pub id: String,
    pub method: String,
    /// Path plus query string, exactly as the visitor sent it.
    pub path: String,
    pub headers: Headers,
    /// Base64 body. Omitted for GET/HEAD and empty bodies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// The matching response, agent → edge, correlated by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse {
    pub id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl HttpResponse {
    /// Synthesized response for failures on the agent side. Always
    /// carries a short plain-text diagnostic, never a bare error.
    pub fn synthesized(id: impl Into<String>, status: u16, diagnostic: &str) -> Self {
        Self {
            id: id.into(),
            status,
            headers: Headers::new(),
            body: Some(encoding::encode_chunked(diagnostic.as_bytes())),
        }
    }
}

/// Edge → agent: a visitor opened a WebSocket; dial the local server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsOpen {
    /// Visitor session id, unique per edge region.
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub headers: Headers,
}

/// One proxied WebSocket frame, either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsFrame {
    pub id: String,
    pub is_text: bool,
    /// Raw string for text frames, base64 for binary frames.
    pub payload: String,
}

/// Closure of a proxied WebSocket session, either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsClose {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Body of `POST /api/register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub client_id: String,
    pub ports: Vec<u16>,
    /// Merged plug-in config, stored per tunnel on the edge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Response of `POST /api/register`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterResponse {
    #[serde(default)]
    pub tunnels: std::collections::HashMap<u16, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_request_wire_shape() {
        let req = HttpRequest {
            id: "r1".into(),
            method: "GET".into(),
            path: "/foo?x=1".into(),
            headers: Headers::new(),
            body: None,
        };
        let json = Envelope::HttpRequest(req).to_text();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "http-request");
        assert_eq!(value["path"], "/foo?x=1");
        // GET must not emit a body field at all.
        assert!(value.get("body").is_none());
    }

    #[test]
    fn ws_frame_uses_camel_case_tag() {
        let frame = Envelope::WsFrame(WsFrame {
            id: "s1".into(),
            is_text: true,
            payload: "hello".into(),
        });
        let value: serde_json::Value = serde_json::from_str(&frame.to_text()).unwrap();
        assert_eq!(value["type"], "ws-frame");
        assert_eq!(value["isText"], true);
        assert_eq!(value["payload"], "hello");
    }

    #[test]
    fn unknown_type_is_a_parse_error() {
        let err = serde_json::from_str::<Envelope>(r#"{"type":"mystery","id":"x"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let parsed: Envelope = serde_json::from_str(
            r#"{"type":"ws-close","id":"s1","code":1000,"futureField":42}"#,
        )
        .unwrap();
        match parsed {
            Envelope::WsClose(close) => {
                assert_eq!(close.code, Some(1000));
                assert_eq!(close.reason, None);
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn register_response_tunnels_keyed_by_port() {
        let res: RegisterResponse =
            serde_json::from_str(r#"{"tunnels":{"3000":"abcd"}}"#).unwrap();
        assert_eq!(res.tunnels.get(&3000).map(String::as_str), Some("abcd"));
        assert!(res.error.is_none());
    }
}

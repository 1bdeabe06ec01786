//! The local WebSocket leg: a per-tunnel registry of visitor session
//! id → open local WebSocket. Each session has its own writer task, so
//! frame writes on one local socket are serialized; frames toward the
//! edge go through the tunnel outbox shared with every other writer.
//!
//! `handle_open` registers the session and its buffering channel
//! before the local dial starts, so frames that arrive while the dial
//! is still in flight queue up instead of racing the open.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use http::header::{HeaderName, HeaderValue};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use burrow_proto::{encoding, headers, Envelope, Headers, WsClose, WsFrame, WsOpen};

use crate::config;

const LOCAL_DIAL_FAILED_CODE: u16 = 1011;
const LOCAL_DIAL_FAILED_REASON: &str = "Failed to connect to local WebSocket";

/// Close code reported when the local server closed without one.
const NO_STATUS_CODE: u16 = 1005;

struct SessionHandle {
    tx: mpsc::UnboundedSender<Message>,
}

/// Proxied visitor WebSocket sessions for one tunnel connection.
pub struct WsRelay {
    local_port: u16,
    /// Tunnel-bound writer shared with the HTTP and keepalive paths.
    outbox: mpsc::UnboundedSender<Message>,
    sessions: Arc<DashMap<String, SessionHandle>>,
}

impl WsRelay {
    pub fn new(local_port: u16, outbox: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            local_port,
            outbox,
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Register the session and start dialing the local WebSocket
    /// server. A failed dial abandons the session with a 1011 close.
    pub fn handle_open(&self, open: WsOpen) {
        let (tx, rx) = mpsc::unbounded_channel::<Message>();
        self.sessions
            .insert(open.id.clone(), SessionHandle { tx });

        let sessions = self.sessions.clone();
        let outbox = self.outbox.clone();
        let local_port = self.local_port;
        tokio::spawn(dial_and_relay(open, rx, sessions, outbox, local_port));
    }

    /// Forward one tunnel frame to the local socket. Frames for
    /// unknown sessions are dropped.
    pub fn handle_frame(&self, frame: WsFrame) {
        let Some(session) = self.sessions.get(&frame.id) else {
            debug!(session = %frame.id, "dropping frame for unknown session");
            return;
        };
        let message = if frame.is_text {
            Message::Text(frame.payload)
        } else {
            match encoding::decode(&frame.payload) {
                Ok(bytes) => Message::Binary(bytes),
                Err(err) => {
                    warn!(session = %frame.id, %err, "dropping undecodable binary frame");
                    return;
                }
            }
        };
        let _ = session.tx.send(message);
    }

    /// Close a local session on the edge's behalf.
    pub fn handle_close(&self, close: WsClose) {
        if let Some((_, session)) = self.sessions.remove(&close.id) {
            let _ = session.tx.send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(close.code.unwrap_or(1000)),
                reason: close.reason.unwrap_or_default().into(),
            })));
        }
    }

    /// Drop every session; their writer tasks close the local sockets.
    pub fn close_all(&self) {
        self.sessions.clear();
    }
}

/// Dial the local server, then pump both directions until the session
/// ends on either side.
async fn dial_and_relay(
    open: WsOpen,
    rx: mpsc::UnboundedReceiver<Message>,
    sessions: Arc<DashMap<String, SessionHandle>>,
    outbox: mpsc::UnboundedSender<Message>,
    local_port: u16,
) {
    let stream = match dial_local(&open.path, &open.headers, local_port).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(session = %open.id, %err, "local WebSocket dial failed");
            // The session leaves the table before the close goes out.
            sessions.remove(&open.id);
            let envelope = Envelope::WsClose(WsClose {
                id: open.id,
                code: Some(LOCAL_DIAL_FAILED_CODE),
                reason: Some(LOCAL_DIAL_FAILED_REASON.to_string()),
            });
            let _ = outbox.send(Message::Text(envelope.to_text()));
            return;
        }
    };

    let (mut sink, read) = stream.split();

    // Per-session writer: serializes every write to this local socket,
    // draining anything that queued up while the dial was in flight.
    let mut rx = rx;
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    read_loop(open.id, read, sessions, outbox).await;
}

async fn dial_local(
    path: &str,
    open_headers: &Headers,
    local_port: u16,
) -> anyhow::Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let target_host = config::target_host();
    let url = format!("ws://{target_host}:{local_port}{path}");

    let mut request = url.into_client_request()?;
    // The dialer owns the handshake headers; copy the rest.
    let forwarded = headers::without(open_headers, headers::WS_HANDSHAKE_STRIP);
    for (key, values) in &forwarded {
        let Ok(name) = HeaderName::from_bytes(key.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                request.headers_mut().append(name.clone(), value);
            }
        }
    }

    let (stream, _) = connect_async(request).await?;
    Ok(stream)
}

/// Forward every local frame to the edge; on closure, report the local
/// close code and reason upstream, once.
async fn read_loop(
    session_id: String,
    mut read: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    sessions: Arc<DashMap<String, SessionHandle>>,
    outbox: mpsc::UnboundedSender<Message>,
) {
    let (code, reason) = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                let frame = Envelope::WsFrame(WsFrame {
                    id: session_id.clone(),
                    is_text: true,
                    payload: text,
                });
                if outbox.send(Message::Text(frame.to_text())).is_err() {
                    // Tunnel is gone; nothing left to relay to.
                    break (NO_STATUS_CODE, String::new());
                }
            }
            Some(Ok(Message::Binary(bytes))) => {
                let frame = Envelope::WsFrame(WsFrame {
                    id: session_id.clone(),
                    is_text: false,
                    payload: encoding::encode_chunked(&bytes),
                });
                if outbox.send(Message::Text(frame.to_text())).is_err() {
                    break (NO_STATUS_CODE, String::new());
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(frame) => (frame.code.into(), frame.reason.to_string()),
                    None => (NO_STATUS_CODE, String::new()),
                };
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                debug!(session = %session_id, %err, "local WebSocket read error");
                break (NO_STATUS_CODE, String::new());
            }
            None => break (NO_STATUS_CODE, String::new()),
        }
    };

    // The session is in the table iff no ws-close has been sent yet;
    // if the edge already closed it, stay silent.
    if sessions.remove(&session_id).is_some() {
        let envelope = Envelope::WsClose(WsClose {
            id: session_id,
            code: Some(code),
            reason: if reason.is_empty() { None } else { Some(reason) },
        });
        let _ = outbox.send(Message::Text(envelope.to_text()));
    }
}

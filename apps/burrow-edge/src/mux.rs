//! The tunnel multiplexer: one shared state machine holding every
//! agent socket, every proxied visitor WebSocket, and every in-flight
//! HTTP request for the region.
//!
//! Sockets never touch the tables directly. Each accepted socket gets
//! an unbounded outbox drained by a single writer task, so one
//! message write is always atomic, and a send to a dead socket is a
//! silently-dropped channel error rather than a panic — the same
//! tolerance a double `close()` gets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use burrow_proto::{
    encoding, Envelope, Headers, HttpRequest, HttpResponse, WsClose, WsFrame, WsOpen, PING, PONG,
};

/// Write half of an accepted socket, as the mux sees it.
pub type Outbox = mpsc::UnboundedSender<Message>;

const CLOSE_REPLACED_CODE: u16 = 1000;
const CLOSE_REPLACED_REASON: &str = "New connection replacing old one";
const CLOSE_TUNNEL_DOWN_CODE: u16 = 1001;
const CLOSE_TUNNEL_DOWN_REASON: &str = "Tunnel disconnected";

/// The blob persisted alongside each accepted socket. It is the single
/// source of truth for rebuilding the index tables after a cold start:
/// an attachment with a `visitorSessionId` re-enters the visitor
/// table, one without re-enters the agent table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub subdomain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visitor_session_id: Option<String>,
}

struct AgentHandle {
    outbox: Outbox,
    attachment: Attachment,
    /// Distinguishes this socket from a replacement for the same
    /// subdomain; cleanup is a no-op unless the ids still match.
    conn_id: u64,
}

struct VisitorHandle {
    outbox: Outbox,
    attachment: Attachment,
}

struct PendingRequest {
    subdomain: String,
    /// Dropping the sender without resolving rejects the waiter, which
    /// the HTTP handler reports as a 502.
    resolve: oneshot::Sender<HttpResponse>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("tunnel not connected")]
    TunnelNotConnected,
    #[error("agent socket send failed")]
    SendFailed,
    #[error("tunnel closed while the request was in flight")]
    TunnelClosed,
    #[error("request timed out")]
    Timeout,
}

pub struct TunnelMux {
    agents: DashMap<String, AgentHandle>,
    visitors: DashMap<String, VisitorHandle>,
    pending: DashMap<String, PendingRequest>,
    conn_seq: AtomicU64,
    request_timeout: Duration,
}

impl TunnelMux {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            agents: DashMap::new(),
            visitors: DashMap::new(),
            pending: DashMap::new(),
            conn_seq: AtomicU64::new(0),
            request_timeout,
        }
    }

    // ---- index tables ----

    /// Insert an accepted agent socket. An existing socket for the
    /// same subdomain is closed with 1000 and evicted before the new
    /// one is registered. Returns the connection id the caller must
    /// hand back to [`TunnelMux::cleanup_agent`].
    pub fn register_agent(&self, subdomain: &str, outbox: Outbox) -> u64 {
        if let Some((_, old)) = self.agents.remove(subdomain) {
            info!(subdomain, "replacing existing agent socket");
            let _ = old
                .outbox
                .send(close_message(CLOSE_REPLACED_CODE, CLOSE_REPLACED_REASON));
        }
        let conn_id = self.conn_seq.fetch_add(1, Ordering::Relaxed);
        self.agents.insert(
            subdomain.to_string(),
            AgentHandle {
                outbox,
                attachment: Attachment {
                    subdomain: subdomain.to_string(),
                    visitor_session_id: None,
                },
                conn_id,
            },
        );
        conn_id
    }

    /// Tear down the tunnel state after an agent socket closed or
    /// errored: evict the socket, reject every pending request for the
    /// subdomain, and close every visitor session riding the tunnel.
    /// A socket that was already replaced cleans up nothing.
    pub fn cleanup_agent(&self, subdomain: &str, conn_id: u64) {
        let removed = self
            .agents
            .remove_if(subdomain, |_, handle| handle.conn_id == conn_id)
            .is_some();
        if !removed {
            return;
        }
        info!(subdomain, "agent disconnected");

        let stale: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.value().subdomain == subdomain)
            .map(|entry| entry.key().clone())
            .collect();
        for id in stale {
            // Dropping the resolver rejects the waiting visitor handler.
            self.pending.remove(&id);
        }

        let sessions: Vec<String> = self
            .visitors
            .iter()
            .filter(|entry| entry.value().attachment.subdomain == subdomain)
            .map(|entry| entry.key().clone())
            .collect();
        for session_id in sessions {
            if let Some((_, visitor)) = self.visitors.remove(&session_id) {
                let _ = visitor.outbox.send(close_message(
                    CLOSE_TUNNEL_DOWN_CODE,
                    CLOSE_TUNNEL_DOWN_REASON,
                ));
            }
        }
    }

    /// Insert an accepted visitor socket under its session id.
    pub fn register_visitor(&self, session_id: &str, subdomain: &str, outbox: Outbox) {
        self.visitors.insert(
            session_id.to_string(),
            VisitorHandle {
                outbox,
                attachment: Attachment {
                    subdomain: subdomain.to_string(),
                    visitor_session_id: Some(session_id.to_string()),
                },
            },
        );
    }

    pub fn agent_connected(&self, subdomain: &str) -> bool {
        self.agents.contains_key(subdomain)
    }

    pub fn visitor_connected(&self, session_id: &str) -> bool {
        self.visitors.contains_key(session_id)
    }

    pub fn pending_count(&self, subdomain: &str) -> usize {
        self.pending
            .iter()
            .filter(|entry| entry.value().subdomain == subdomain)
            .count()
    }

    // ---- hibernation emulation ----

    /// Serialized attachment plus write half for every accepted
    /// socket, the way a hibernation runtime would enumerate them.
    pub fn snapshot_attachments(&self) -> Vec<(String, Outbox)> {
        let mut entries = Vec::new();
        for agent in self.agents.iter() {
            let raw = serde_json::to_string(&agent.value().attachment)
                .expect("attachment serialization cannot fail");
            entries.push((raw, agent.value().outbox.clone()));
        }
        for visitor in self.visitors.iter() {
            let raw = serde_json::to_string(&visitor.value().attachment)
                .expect("attachment serialization cannot fail");
            entries.push((raw, visitor.value().outbox.clone()));
        }
        entries
    }

    /// Rebuild both index tables from serialized attachments on cold
    /// start. The pending table is deliberately not restored: any
    /// in-flight caller timed out while the region slept, and replies
    /// that arrive for unknown ids are dropped.
    pub fn restore(
        request_timeout: Duration,
        entries: impl IntoIterator<Item = (String, Outbox)>,
    ) -> Self {
        let mux = Self::new(request_timeout);
        for (raw, outbox) in entries {
            match serde_json::from_str::<Attachment>(&raw) {
                Ok(attachment) => match attachment.visitor_session_id.clone() {
                    Some(session_id) => {
                        mux.visitors
                            .insert(session_id, VisitorHandle { outbox, attachment });
                    }
                    None => {
                        let conn_id = mux.conn_seq.fetch_add(1, Ordering::Relaxed);
                        mux.agents.insert(
                            attachment.subdomain.clone(),
                            AgentHandle {
                                outbox,
                                attachment,
                                conn_id,
                            },
                        );
                    }
                },
                Err(err) => warn!(%err, "discarding socket with unreadable attachment"),
            }
        }
        mux
    }

    // ---- visitor HTTP path ----

    /// Forward one visitor HTTP request over the tunnel and wait for
    /// the correlated response. Exactly one of response, timeout,
    /// tunnel-close, or send-failure settles each request; the pending
    /// entry is removed by whichever fires first.
    pub async fn proxy_http(
        &self,
        subdomain: &str,
        request: HttpRequest,
    ) -> Result<HttpResponse, ProxyError> {
        let agent_outbox = self
            .agents
            .get(subdomain)
            .map(|handle| handle.outbox.clone())
            .ok_or(ProxyError::TunnelNotConnected)?;

        let request_id = request.id.clone();
        let (resolve, resolved) = oneshot::channel();
        self.pending.insert(
            request_id.clone(),
            PendingRequest {
                subdomain: subdomain.to_string(),
                resolve,
            },
        );

        let text = Envelope::HttpRequest(request).to_text();
        if agent_outbox.send(Message::Text(text)).is_err() {
            self.pending.remove(&request_id);
            return Err(ProxyError::SendFailed);
        }

        match tokio::time::timeout(self.request_timeout, resolved).await {
            Ok(Ok(response)) => Ok(response),
            // Resolver dropped: the tunnel died with the request in flight.
            Ok(Err(_)) => Err(ProxyError::TunnelClosed),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(ProxyError::Timeout)
            }
        }
    }

    // ---- agent socket ----

    /// Serve one accepted agent socket until it closes, then tear the
    /// tunnel down.
    pub async fn serve_agent(self: Arc<Self>, socket: WebSocket, subdomain: String) {
        let (mut sink, mut stream) = socket.split();
        let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Message>();
        let conn_id = self.register_agent(&subdomain, outbox.clone());
        info!(%subdomain, "agent connected");

        let writer = tokio::spawn(async move {
            while let Some(message) = outbox_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        while let Some(result) = stream.next().await {
            let message = match result {
                Ok(message) => message,
                Err(err) => {
                    debug!(%subdomain, %err, "agent socket error");
                    break;
                }
            };
            match message {
                Message::Text(text) => {
                    // Keepalive stays below the envelope layer.
                    if text == PING {
                        let _ = outbox.send(Message::Text(PONG.to_string()));
                        continue;
                    }
                    if text == PONG {
                        continue;
                    }
                    match serde_json::from_str::<Envelope>(&text) {
                        Ok(envelope) => self.handle_agent_envelope(envelope),
                        Err(err) => {
                            warn!(%subdomain, %err, "dropping malformed agent message");
                        }
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        self.cleanup_agent(&subdomain, conn_id);
        drop(outbox);
        let _ = writer.await;
    }

    /// Route one parsed envelope off the agent socket. Replies for
    /// unknown request ids and frames for unknown sessions are dropped.
    pub fn handle_agent_envelope(&self, envelope: Envelope) {
        match envelope {
            Envelope::HttpResponse(response) => {
                match self.pending.remove(&response.id) {
                    Some((_, pending)) => {
                        let _ = pending.resolve.send(response);
                    }
                    None => debug!(id = %response.id, "dropping reply for unknown request"),
                }
            }
            Envelope::WsFrame(frame) => {
                let Some(visitor) = self.visitors.get(&frame.id) else {
                    debug!(id = %frame.id, "dropping frame for unknown visitor session");
                    return;
                };
                let message = if frame.is_text {
                    Message::Text(frame.payload)
                } else {
                    match encoding::decode(&frame.payload) {
                        Ok(bytes) => Message::Binary(bytes),
                        Err(err) => {
                            warn!(id = %frame.id, %err, "dropping undecodable binary frame");
                            return;
                        }
                    }
                };
                let _ = visitor.outbox.send(message);
            }
            Envelope::WsClose(close) => {
                if let Some((_, visitor)) = self.visitors.remove(&close.id) {
                    let _ = visitor.outbox.send(close_message(
                        close.code.unwrap_or(1000),
                        &close.reason.unwrap_or_default(),
                    ));
                }
            }
            other => debug!(?other, "dropping unexpected agent envelope"),
        }
    }

    fn send_to_agent(&self, subdomain: &str, envelope: Envelope) -> bool {
        match self.agents.get(subdomain) {
            Some(agent) => agent
                .outbox
                .send(Message::Text(envelope.to_text()))
                .is_ok(),
            None => false,
        }
    }

    // ---- visitor WebSocket path ----

    /// Serve one accepted visitor WebSocket: announce the session to
    /// the agent, proxy frames in both directions, propagate closure.
    pub async fn serve_visitor(
        self: Arc<Self>,
        socket: WebSocket,
        subdomain: String,
        path: String,
        headers: Headers,
    ) {
        let session_id = Uuid::new_v4().to_string();

        // ws-open goes first so the agent can dial the local server
        // before the first frame arrives.
        let opened = self.send_to_agent(
            &subdomain,
            Envelope::WsOpen(WsOpen {
                id: session_id.clone(),
                path,
                headers,
            }),
        );
        if !opened {
            let mut socket = socket;
            let _ = socket
                .send(close_message(
                    CLOSE_TUNNEL_DOWN_CODE,
                    CLOSE_TUNNEL_DOWN_REASON,
                ))
                .await;
            return;
        }

        let (mut sink, mut stream) = socket.split();
        let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Message>();
        self.register_visitor(&session_id, &subdomain, outbox);
        debug!(%subdomain, %session_id, "visitor websocket opened");

        let writer = tokio::spawn(async move {
            while let Some(message) = outbox_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        let mut close_code: Option<u16> = None;
        let mut close_reason: Option<String> = None;
        while let Some(result) = stream.next().await {
            let message = match result {
                Ok(message) => message,
                Err(err) => {
                    debug!(%session_id, %err, "visitor socket error");
                    break;
                }
            };
            match message {
                Message::Text(text) => {
                    self.send_to_agent(
                        &subdomain,
                        Envelope::WsFrame(WsFrame {
                            id: session_id.clone(),
                            is_text: true,
                            payload: text,
                        }),
                    );
                }
                Message::Binary(bytes) => {
                    self.send_to_agent(
                        &subdomain,
                        Envelope::WsFrame(WsFrame {
                            id: session_id.clone(),
                            is_text: false,
                            payload: encoding::encode_chunked(&bytes),
                        }),
                    );
                }
                Message::Close(frame) => {
                    if let Some(frame) = frame {
                        close_code = Some(frame.code);
                        close_reason = Some(frame.reason.to_string());
                    }
                    break;
                }
                _ => {}
            }
        }

        // Exactly one close path removes the session: if the agent
        // already closed it, the entry is gone and nothing is notified.
        if self.visitors.remove(&session_id).is_some() {
            self.send_to_agent(
                &subdomain,
                Envelope::WsClose(WsClose {
                    id: session_id.clone(),
                    code: close_code,
                    reason: close_reason.filter(|r| !r.is_empty()),
                }),
            );
            debug!(%subdomain, %session_id, "visitor websocket closed");
        }
        let _ = writer.await;
    }
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}

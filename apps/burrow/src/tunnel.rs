//! The agent side of the tunnel: registration, the reconnect loop, and
//! the per-connection serve loop that dispatches inbound envelopes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use burrow_proto::{
    Envelope, RegisterRequest, RegisterResponse, KEEPALIVE_SECS, PING, PONG,
};

use crate::plugins::{Pipeline, RequestContext};
use crate::proxy;
use crate::wsrelay::WsRelay;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Register the given ports with the edge and return the allocated
/// `port → subdomain` mapping. Any non-200 status or `error` field in
/// the response is fatal to the caller.
pub async fn register(
    client_id: &str,
    ports: &[u16],
    worker_base_url: &str,
    config: Option<serde_json::Map<String, serde_json::Value>>,
) -> Result<HashMap<u16, String>> {
    let request = RegisterRequest {
        client_id: client_id.to_string(),
        ports: ports.to_vec(),
        config,
    };

    let response = reqwest::Client::new()
        .post(format!("{}/api/register", worker_base_url.trim_end_matches('/')))
        .json(&request)
        .send()
        .await
        .context("registration request failed")?;

    if !response.status().is_success() {
        bail!("server returned status: {}", response.status().as_u16());
    }

    let body: RegisterResponse = response
        .json()
        .await
        .context("invalid registration response")?;
    if let Some(error) = body.error {
        bail!("server error: {error}");
    }

    Ok(body.tunnels)
}

/// Maintain one tunnel until shutdown is signalled: dial, serve,
/// reconnect with a 5-second backoff.
pub async fn start_tunnel(
    subdomain: String,
    local_port: u16,
    worker_base_url: String,
    pipeline: Arc<Pipeline>,
    mut shutdown: watch::Receiver<bool>,
) {
    let ws_url = tunnel_ws_url(&worker_base_url, &subdomain);

    loop {
        if *shutdown.borrow() {
            return;
        }
        info!(%subdomain, local_port, "connecting tunnel");

        match connect_async(&ws_url).await {
            Ok((stream, _)) => {
                info!(%subdomain, local_port, "tunnel established");
                pipeline.notify_connect(&subdomain, local_port);
                let result = serve(stream, &subdomain, local_port, &pipeline, &mut shutdown).await;
                let error = result.as_ref().err().map(|e| e.to_string());
                pipeline.notify_disconnect(&subdomain, error.as_deref());
                if *shutdown.borrow() {
                    return;
                }
                warn!(
                    %subdomain,
                    error = error.as_deref().unwrap_or("closed"),
                    "tunnel disconnected, retrying in 5s"
                );
            }
            Err(err) => {
                warn!(%subdomain, %err, "tunnel dial failed, retrying in 5s");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            changed = shutdown.changed() => {
                // A dropped sender counts as shutdown.
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

/// Derive the agent socket URL from the edge base URL.
fn tunnel_ws_url(worker_base_url: &str, subdomain: &str) -> String {
    let base = worker_base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws_base}/_tunnel?subdomain={subdomain}")
}

/// Serve one established agent socket: a writer task drains the shared
/// outbox (the single write-serialization point), a keepalive task
/// pings every 30 seconds, and the reader dispatches inbound
/// envelopes until the socket dies or shutdown is signalled.
async fn serve(
    stream: WsStream,
    subdomain: &str,
    local_port: u16,
    pipeline: &Arc<Pipeline>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let (mut sink, mut reader) = stream.split();
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbox_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let keepalive_outbox = outbox.clone();
    let keepalive = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(KEEPALIVE_SECS));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if keepalive_outbox.send(Message::Text(PING.to_string())).is_err() {
                debug!("keepalive write failed, stopping");
                break;
            }
        }
    });

    let relay = Arc::new(WsRelay::new(local_port, outbox.clone()));
    let client = proxy::local_client()?;

    let result = loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(subdomain, "shutting down tunnel");
                    let _ = outbox.send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "shutdown".into(),
                    })));
                    break Ok(());
                }
            }
            next = reader.next() => {
                match next {
                    Some(Ok(Message::Text(text))) => {
                        if text == PONG {
                            continue;
                        }
                        dispatch(
                            &text, subdomain, local_port, pipeline, &client, &relay, &outbox,
                        );
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break Err(anyhow!("closed by edge: {:?}", frame));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break Err(err.into()),
                    None => break Err(anyhow!("socket closed")),
                }
            }
        }
    };

    keepalive.abort();
    relay.close_all();
    drop(outbox);
    let _ = writer.await;
    result
}

/// Route one inbound envelope. WebSocket sub-protocol messages are
/// handled inline (they only touch the session table and its
/// channels, and inline handling keeps frames for one session in
/// order); each HTTP request gets its own worker so one slow local
/// round trip cannot head-of-line block the read loop.
fn dispatch(
    text: &str,
    subdomain: &str,
    local_port: u16,
    pipeline: &Arc<Pipeline>,
    client: &reqwest::Client,
    relay: &Arc<WsRelay>,
    outbox: &mpsc::UnboundedSender<Message>,
) {
    let envelope = match serde_json::from_str::<Envelope>(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(%err, "dropping unparseable tunnel message");
            return;
        }
    };

    match envelope {
        Envelope::HttpRequest(request) => {
            let subdomain = subdomain.to_string();
            let pipeline = pipeline.clone();
            let client = client.clone();
            let outbox = outbox.clone();
            tokio::spawn(async move {
                let ctx = RequestContext {
                    subdomain,
                    req_id: request.id.clone(),
                };
                pipeline.notify_request(&ctx);
                let request = pipeline.run_before_proxy(&ctx, request);
                let response = proxy::handle_request(&client, &request, local_port).await;
                let response = pipeline.run_after_proxy(&ctx, &request, response);
                let text = Envelope::HttpResponse(response).to_text();
                if outbox.send(Message::Text(text)).is_err() {
                    debug!("response dropped, tunnel connection is gone");
                }
            });
        }
        Envelope::WsOpen(open) => relay.handle_open(open),
        Envelope::WsFrame(frame) => relay.handle_frame(frame),
        Envelope::WsClose(close) => relay.handle_close(close),
        other => debug!(?other, "dropping unexpected envelope"),
    }
}

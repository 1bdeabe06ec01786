//! Whole-tunnel test: a real edge, a real local server, and the agent
//! connecting the two, all in one process.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as AxMessage, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use http::header::{HeaderValue, HOST};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use burrow::plugins::Pipeline;
use burrow::tunnel;
use burrow_edge::config::EdgeConfig;
use burrow_edge::registry::Registry;
use burrow_edge::AppState;

struct TestEdge {
    base_url: String,
    addr: std::net::SocketAddr,
    state: AppState,
    _db_dir: tempfile::TempDir,
}

async fn start_edge() -> TestEdge {
    let db_dir = tempfile::tempdir().unwrap();
    let db_url = format!(
        "sqlite://{}/tunnels.db?mode=rwc",
        db_dir.path().to_str().unwrap()
    );
    let registry = Registry::connect(&db_url).await.unwrap();
    let state = AppState::new(&EdgeConfig::default(), registry);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serve_state = state.clone();
    tokio::spawn(async move {
        let _ = burrow_edge::serve(listener, serve_state).await;
    });

    TestEdge {
        base_url: format!("http://{addr}"),
        addr,
        state,
        _db_dir: db_dir,
    }
}

async fn ws_echo(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket: WebSocket| async move {
        while let Some(Ok(message)) = socket.recv().await {
            match message {
                AxMessage::Text(text) => {
                    if socket.send(AxMessage::Text(text)).await.is_err() {
                        return;
                    }
                }
                AxMessage::Close(_) => return,
                _ => {}
            }
        }
    })
}

async fn start_local_server() -> u16 {
    let app = Router::new()
        .route("/foo", get(|| async { ([("x-k", "v1")], "hi") }))
        .route("/ws", get(ws_echo));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    port
}

async fn wait_for_agent(edge: &TestEdge, subdomain: &str) {
    for _ in 0..100 {
        if edge.state.mux.agent_connected(subdomain) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("agent never connected for {subdomain}");
}

#[tokio::test]
async fn http_and_websocket_traffic_flows_end_to_end() {
    let edge = start_edge().await;
    let local_port = start_local_server().await;

    let mapping = tunnel::register("client-e2e", &[local_port], &edge.base_url, None)
        .await
        .unwrap();
    let subdomain = mapping.get(&local_port).unwrap().clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pipeline = Arc::new(Pipeline::new());
    let agent = tokio::spawn(tunnel::start_tunnel(
        subdomain.clone(),
        local_port,
        edge.base_url.clone(),
        pipeline,
        shutdown_rx,
    ));

    wait_for_agent(&edge, &subdomain).await;
    let visitor_host = format!("{subdomain}.burrow.dev");

    // HTTP happy path through the whole stack.
    let response = reqwest::Client::new()
        .get(format!("{}/foo?x=1", edge.base_url))
        .header("host", &visitor_host)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("x-k").unwrap().to_str().unwrap(),
        "v1"
    );
    assert_eq!(response.text().await.unwrap(), "hi");

    // Visitor WebSocket echo, in order.
    let mut request = format!("ws://{}/ws", edge.addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(HOST, HeaderValue::from_str(&visitor_host).unwrap());
    let (stream, _) = connect_async(request).await.unwrap();
    let (mut tx, mut rx) = stream.split();

    tx.send(Message::Text("ping1".to_string())).await.unwrap();
    tx.send(Message::Text("ping2".to_string())).await.unwrap();
    for expected in ["ping1", "ping2"] {
        let echoed = tokio::time::timeout(Duration::from_secs(5), rx.next())
            .await
            .expect("timed out waiting for echo")
            .expect("socket closed")
            .unwrap();
        assert_eq!(echoed, Message::Text(expected.to_string()));
    }

    // Graceful shutdown drains the tunnel task.
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), agent)
        .await
        .expect("agent did not shut down")
        .unwrap();
}

#[tokio::test]
async fn visitor_gets_502_when_local_server_is_offline() {
    let edge = start_edge().await;

    // A port with nothing behind it.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_port = listener.local_addr().unwrap().port();
    drop(listener);

    let mapping = tunnel::register("client-offline", &[local_port], &edge.base_url, None)
        .await
        .unwrap();
    let subdomain = mapping.get(&local_port).unwrap().clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let agent = tokio::spawn(tunnel::start_tunnel(
        subdomain.clone(),
        local_port,
        edge.base_url.clone(),
        Arc::new(Pipeline::new()),
        shutdown_rx,
    ));
    wait_for_agent(&edge, &subdomain).await;

    let response = reqwest::Client::new()
        .get(format!("{}/", edge.base_url))
        .header("host", format!("{subdomain}.burrow.dev"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    let body = response.text().await.unwrap();
    assert!(
        body.starts_with("Failed to connect to local port"),
        "unexpected body: {body}"
    );

    shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), agent).await;
}

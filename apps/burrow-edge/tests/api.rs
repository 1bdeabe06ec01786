//! End-to-end tests of the edge HTTP surface against a real listener
//! and a file-backed registry.

use std::collections::HashSet;

use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use burrow_edge::blocklist::is_subdomain_blocked;
use burrow_edge::config::EdgeConfig;
use burrow_edge::registry::Registry;
use burrow_edge::AppState;
use burrow_proto::{encoding, Envelope, HttpResponse, RegisterResponse};

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

async fn register(edge: &TestEdge, body: serde_json::Value) -> (StatusCode, RegisterResponse) {
    let response = reqwest::Client::new()
        .post(format!("{}/api/register", edge.base_url))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = response.status();
    let body = response.json().await.unwrap();
    (status, body)
}

#[tokio::test]
async fn register_allocates_and_is_idempotent() {
    let edge = start_edge().await;

    let (status, first) = register(
        &edge,
        serde_json::json!({ "clientId": "client-1", "ports": [3000, 4000] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(first.error.is_none());
    let sub_3000 = first.tunnels.get(&3000).unwrap().clone();
    let sub_4000 = first.tunnels.get(&4000).unwrap().clone();
    assert_eq!(sub_3000.len(), 4);
    assert_ne!(sub_3000, sub_4000);
    assert!(!is_subdomain_blocked(&sub_3000));

    // Same client and port keeps its subdomain.
    let (_, second) = register(
        &edge,
        serde_json::json!({ "clientId": "client-1", "ports": [3000] }),
    )
    .await;
    assert_eq!(second.tunnels.get(&3000), Some(&sub_3000));

    // A different client gets a different one.
    let (_, third) = register(
        &edge,
        serde_json::json!({ "clientId": "client-2", "ports": [3000] }),
    )
    .await;
    assert_ne!(third.tunnels.get(&3000), Some(&sub_3000));
}

#[tokio::test]
async fn register_updates_config_for_existing_tunnels() {
    let edge = start_edge().await;

    let (_, first) = register(
        &edge,
        serde_json::json!({
            "clientId": "client-1",
            "ports": [3000],
            "config": { "auth": "user:pass" }
        }),
    )
    .await;
    let subdomain = first.tunnels.get(&3000).unwrap().clone();

    let stored = edge
        .state
        .registry
        .tunnel_config(&subdomain)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored["auth"], "user:pass");

    let (_, second) = register(
        &edge,
        serde_json::json!({
            "clientId": "client-1",
            "ports": [3000],
            "config": { "auth": "user:newpass" }
        }),
    )
    .await;
    assert_eq!(second.tunnels.get(&3000), Some(&subdomain));

    let stored = edge
        .state
        .registry
        .tunnel_config(&subdomain)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored["auth"], "user:newpass");
}

#[tokio::test]
async fn register_rejects_empty_requests() {
    let edge = start_edge().await;
    let (status, body) = register(
        &edge,
        serde_json::json!({ "clientId": "", "ports": [3000] }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.error.is_some());
}

#[tokio::test]
async fn allocated_subdomains_are_unique_and_never_blocked() {
    let edge = start_edge().await;
    let mut seen = HashSet::new();
    for port in 0..200u16 {
        let (_, response) = register(
            &edge,
            serde_json::json!({ "clientId": "client-1", "ports": [10000 + port] }),
        )
        .await;
        let subdomain = response.tunnels.values().next().unwrap().clone();
        assert!(subdomain.len() >= 4);
        assert!(!is_subdomain_blocked(&subdomain));
        assert!(seen.insert(subdomain), "duplicate subdomain allocated");
    }
}

#[tokio::test]
async fn tunnel_endpoint_validates_the_handshake() {
    let edge = start_edge().await;
    let client = reqwest::Client::new();

    // Missing subdomain parameter.
    let response = client
        .get(format!("{}/_tunnel", edge.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Not a WebSocket upgrade.
    let response = client
        .get(format!("{}/_tunnel?subdomain=abcd", edge.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
}

#[tokio::test]
async fn visitor_traffic_without_an_agent_is_a_502() {
    let edge = start_edge().await;
    let response = reqwest::Client::new()
        .get(format!("{}/anything", edge.base_url))
        .header("host", "ab12.burrow.dev")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(response.text().await.unwrap(), "Tunnel not connected");
}

#[tokio::test]
async fn reserved_subdomains_always_404() {
    let edge = start_edge().await;
    let client = reqwest::Client::new();
    for host in ["www.burrow.dev", "tunnel.burrow.dev"] {
        let response = client
            .get(format!("{}/", edge.base_url))
            .header("host", host)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{host}");
    }
}

#[tokio::test]
async fn agent_socket_serves_visitor_requests() {
    let edge = start_edge().await;

    let (stream, _) = connect_async(format!("ws://{}/_tunnel?subdomain=ab12", edge.addr))
        .await
        .unwrap();
    let (mut tx, mut rx) = stream.split();
    // The upgrade callback registers the socket asynchronously.
    for _ in 0..100 {
        if edge.state.mux.agent_connected("ab12") {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(edge.state.mux.agent_connected("ab12"));

    // Keepalive pings are answered below the envelope layer.
    tx.send(Message::Text("ping".to_string())).await.unwrap();
    match rx.next().await.unwrap().unwrap() {
        Message::Text(text) => assert_eq!(text, "pong"),
        other => panic!("expected pong, got {other:?}"),
    }

    // A visitor request arrives as an http-request envelope...
    let base_url = edge.base_url.clone();
    let visitor = tokio::spawn(async move {
        reqwest::Client::new()
            .get(format!("{base_url}/hello"))
            .header("host", "ab12.burrow.dev")
            .send()
            .await
            .unwrap()
    });

    let request = loop {
        match rx.next().await.unwrap().unwrap() {
            Message::Text(text) => match serde_json::from_str::<Envelope>(&text).unwrap() {
                Envelope::HttpRequest(request) => break request,
                other => panic!("expected http-request, got {other:?}"),
            },
            _ => continue,
        }
    };
    assert_eq!(request.method, "GET");
    assert_eq!(request.path, "/hello");
    assert!(request.body.is_none());

    // ...and the correlated reply becomes the visitor's response.
    let reply = Envelope::HttpResponse(HttpResponse {
        id: request.id.clone(),
        status: 200,
        headers: Default::default(),
        body: Some(encoding::encode_chunked(b"hello from agent")),
    });
    tx.send(Message::Text(reply.to_text())).await.unwrap();

    let response = visitor.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "hello from agent");
}

#[tokio::test]
async fn basic_auth_config_gates_visitor_traffic() {
    let edge = start_edge().await;
    let (_, response) = register(
        &edge,
        serde_json::json!({
            "clientId": "client-1",
            "ports": [3000],
            "config": { "auth": "user:pass" }
        }),
    )
    .await;
    let subdomain = response.tunnels.get(&3000).unwrap().clone();
    let host = format!("{subdomain}.burrow.dev");

    // Middleware short-circuits before the tunnel lookup, so no agent
    // is needed to observe the 401.
    let response = reqwest::Client::new()
        .get(format!("{}/", edge.base_url))
        .header("host", &host)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = reqwest::Client::new()
        .get(format!("{}/", edge.base_url))
        .header("host", &host)
        .basic_auth("user", Some("pass"))
        .send()
        .await
        .unwrap();
    // Credentials pass the middleware; the missing agent is the next stop.
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

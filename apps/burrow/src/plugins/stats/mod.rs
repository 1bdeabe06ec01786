//! In-memory stats plug-in: records every proxied request and tunnel
//! lifecycle event, and serves the numbers over a local dashboard API.
//! A single `--dashboard-port` flag controls it; port 0 disables stats
//! entirely.

mod server;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use clap::{Arg, ArgMatches, Command};
use dashmap::DashMap;
use serde::Serialize;
use tracing::warn;

use burrow_proto::{encoding, HttpRequest, HttpResponse};

use super::{ConnectionHook, Plugin, RequestContext, RequestHook};

/// Stored bodies are capped to keep the ring buffer bounded.
const MAX_STORED_BODY: usize = 64_000;

const DEFAULT_MAX_LOGS: usize = 1000;

/// One logged request/response pair.
#[derive(Debug, Clone, Serialize)]
pub struct RequestEntry {
    pub id: u64,
    pub subdomain: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub latency_ms: u64,
    pub bytes_in: usize,
    pub bytes_out: usize,
    pub timestamp: u64,
    pub request_headers: burrow_proto::Headers,
    pub request_body: Option<String>,
    pub response_headers: burrow_proto::Headers,
    pub response_body: Option<String>,
}

/// Aggregate counters for one tunnel.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStats {
    pub subdomain: String,
    pub port: u16,
    pub total_requests: u64,
    pub error_count: u64,
    pub total_bytes_in: usize,
    pub total_bytes_out: usize,
    pub total_latency_ms: u64,
    pub max_latency_ms: u64,
    pub min_latency_ms: u64,
    pub connected_at: u64,
}

struct PendingMeta {
    start: Instant,
    subdomain: String,
}

struct StoreInner {
    tunnels: HashMap<String, TunnelStats>,
    /// Insertion order for stable iteration.
    order: Vec<String>,
    logs: VecDeque<RequestEntry>,
    max_logs: usize,
    next_id: u64,
}

/// The in-memory stats store. Safe for concurrent use.
pub struct Store {
    inner: Mutex<StoreInner>,
    /// In-flight requests keyed by request id; written by `on_request`,
    /// consumed by `after_proxy` for the same context.
    pending: DashMap<String, PendingMeta>,
}

impl Store {
    pub fn new(max_logs: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                tunnels: HashMap::new(),
                order: Vec::new(),
                logs: VecDeque::new(),
                max_logs,
                next_id: 0,
            }),
            pending: DashMap::new(),
        }
    }

    pub fn record_connect(&self, subdomain: &str, port: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner.tunnels.insert(
            subdomain.to_string(),
            TunnelStats {
                subdomain: subdomain.to_string(),
                port,
                total_requests: 0,
                error_count: 0,
                total_bytes_in: 0,
                total_bytes_out: 0,
                total_latency_ms: 0,
                max_latency_ms: 0,
                min_latency_ms: u64::MAX,
                connected_at: unix_now(),
            },
        );
        if !inner.order.iter().any(|s| s == subdomain) {
            inner.order.push(subdomain.to_string());
        }
    }

    pub fn record_disconnect(&self, subdomain: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.tunnels.remove(subdomain);
        inner.order.retain(|s| s != subdomain);
    }

    fn begin_request(&self, ctx: &RequestContext) {
        self.pending.insert(
            ctx.req_id.clone(),
            PendingMeta {
                start: Instant::now(),
                subdomain: ctx.subdomain.clone(),
            },
        );
    }

    fn finish_request(&self, ctx: &RequestContext, request: &HttpRequest, response: &HttpResponse) {
        let (latency_ms, subdomain) = match self.pending.remove(&ctx.req_id) {
            Some((_, meta)) => (meta.start.elapsed().as_millis() as u64, meta.subdomain),
            None => (0, ctx.subdomain.clone()),
        };

        let request_body = request.body.as_deref().and_then(decode_for_storage);
        let response_body = response.body.as_deref().and_then(decode_for_storage);
        let bytes_in = request
            .body
            .as_deref()
            .map(decoded_len)
            .unwrap_or_default();
        let bytes_out = response
            .body
            .as_deref()
            .map(decoded_len)
            .unwrap_or_default();

        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let entry = RequestEntry {
            id: inner.next_id,
            subdomain: subdomain.clone(),
            method: request.method.clone(),
            path: request.path.clone(),
            status: response.status,
            latency_ms,
            bytes_in,
            bytes_out,
            timestamp: unix_now(),
            request_headers: request.headers.clone(),
            request_body,
            response_headers: response.headers.clone(),
            response_body,
        };
        if inner.logs.len() >= inner.max_logs {
            inner.logs.pop_front();
        }
        inner.logs.push_back(entry);

        if let Some(stats) = inner.tunnels.get_mut(&subdomain) {
            stats.total_requests += 1;
            stats.total_bytes_in += bytes_in;
            stats.total_bytes_out += bytes_out;
            stats.total_latency_ms += latency_ms;
            stats.max_latency_ms = stats.max_latency_ms.max(latency_ms);
            stats.min_latency_ms = stats.min_latency_ms.min(latency_ms);
            if response.status >= 400 {
                stats.error_count += 1;
            }
        }
    }

    /// All tunnel aggregates, in connect order.
    pub fn snapshot(&self) -> Vec<TunnelStats> {
        let inner = self.inner.lock().unwrap();
        inner
            .order
            .iter()
            .filter_map(|subdomain| inner.tunnels.get(subdomain))
            .cloned()
            .map(|mut stats| {
                if stats.total_requests == 0 {
                    stats.min_latency_ms = 0;
                }
                stats
            })
            .collect()
    }

    /// The most recent `n` request entries, oldest first.
    pub fn recent_logs(&self, n: usize) -> Vec<RequestEntry> {
        let inner = self.inner.lock().unwrap();
        let skip = inner.logs.len().saturating_sub(n);
        inner.logs.iter().skip(skip).cloned().collect()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn decoded_len(encoded: &str) -> usize {
    encoding::decode(encoded)
        .map(|b| b.len())
        .unwrap_or(encoded.len())
}

fn decode_for_storage(encoded: &str) -> Option<String> {
    let bytes = encoding::decode(encoded).ok()?;
    if bytes.len() >= MAX_STORED_BODY {
        return None;
    }
    String::from_utf8(bytes).ok()
}

// --- Plug-in wiring ---

pub struct StatsPlugin {
    dashboard_port: u16,
    store: Arc<Store>,
    dashboard_started: Arc<AtomicBool>,
}

impl StatsPlugin {
    pub fn new() -> Self {
        Self {
            dashboard_port: 9999,
            store: Arc::new(Store::new(DEFAULT_MAX_LOGS)),
            dashboard_started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The underlying store, for external consumers.
    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }
}

impl Default for StatsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for StatsPlugin {
    fn name(&self) -> &'static str {
        "stats"
    }

    fn register_flags(&self, command: Command) -> Command {
        command.arg(
            Arg::new("dashboard-port")
                .long("dashboard-port")
                .value_name("PORT")
                .default_value("9999")
                .help("Stats dashboard port (0 to disable stats entirely)"),
        )
    }

    fn configure(&mut self, matches: &ArgMatches) {
        if let Some(port) = matches
            .get_one::<String>("dashboard-port")
            .and_then(|v| v.parse().ok())
        {
            self.dashboard_port = port;
        }
    }

    fn enabled(&self) -> bool {
        self.dashboard_port > 0
    }

    fn request_hooks(&self) -> Vec<Arc<dyn RequestHook>> {
        vec![Arc::new(StatsRequestHook {
            store: self.store.clone(),
        })]
    }

    fn connection_hooks(&self) -> Vec<Arc<dyn ConnectionHook>> {
        vec![Arc::new(StatsConnectionHook {
            store: self.store.clone(),
            dashboard_port: self.dashboard_port,
            dashboard_started: self.dashboard_started.clone(),
        })]
    }
}

struct StatsRequestHook {
    store: Arc<Store>,
}

impl RequestHook for StatsRequestHook {
    fn after_proxy(
        &self,
        ctx: &RequestContext,
        request: &HttpRequest,
        response: HttpResponse,
    ) -> HttpResponse {
        self.store.finish_request(ctx, request, &response);
        response
    }
}

struct StatsConnectionHook {
    store: Arc<Store>,
    dashboard_port: u16,
    dashboard_started: Arc<AtomicBool>,
}

impl ConnectionHook for StatsConnectionHook {
    fn on_connect(&self, subdomain: &str, port: u16) {
        self.store.record_connect(subdomain, port);
        self.start_dashboard();
    }

    fn on_disconnect(&self, subdomain: &str, _error: Option<&str>) {
        self.store.record_disconnect(subdomain);
    }

    fn on_request(&self, ctx: &RequestContext) {
        self.store.begin_request(ctx);
    }
}

impl StatsConnectionHook {
    /// Start the dashboard API on first connect.
    fn start_dashboard(&self) {
        if self.dashboard_port == 0 || self.dashboard_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let store = self.store.clone();
        let port = self.dashboard_port;
        tokio::spawn(async move {
            if let Err(err) = server::serve(store, port).await {
                warn!(%err, "stats dashboard server failed");
            }
        });
    }
}

//! Multi-value header maps as they travel through the tunnel.
//!
//! Headers are always `key → ordered values`; the order of values
//! within one key survives the round trip (`set-cookie: a` then
//! `set-cookie: b` re-emerges as two entries in that order). Key
//! comparison is case-insensitive; keys are carried as received and
//! normalized by the `http` crate on re-emission.

use std::collections::HashMap;

use http::header::{HeaderMap, HeaderName, HeaderValue};

pub type Headers = HashMap<String, Vec<String>>;

/// Headers never forwarded from the visitor request to the local
/// server. `accept-encoding` is hop-by-hop here: the local client
/// negotiates its own encoding and transparently decompresses, so
/// forwarding the visitor's value would let the edge strip a
/// `content-encoding` the local server actually produced. `host` is
/// replaced with the local target host.
pub const REQUEST_STRIP: &[&str] = &["accept-encoding", "host"];

/// Headers never forwarded from the local response to the visitor:
/// the local client has already decompressed and rebuffered the body,
/// so these describe bytes that no longer exist.
pub const RESPONSE_STRIP: &[&str] = &["content-encoding", "content-length"];

/// WebSocket handshake headers owned by the dialer, never copied when
/// opening the local leg of a proxied WebSocket.
pub const WS_HANDSHAKE_STRIP: &[&str] = &[
    "upgrade",
    "connection",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "sec-websocket-protocol",
    "host",
];

/// Collect an `http::HeaderMap` into the wire form, preserving
/// per-key value order. Values that are not valid UTF-8 are skipped.
pub fn from_header_map(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for key in map.keys() {
        let values: Vec<String> = map
            .get_all(key)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_owned))
            .collect();
        if !values.is_empty() {
            headers.insert(key.as_str().to_owned(), values);
        }
    }
    headers
}

/// Rebuild an `http::HeaderMap`, appending multi-values in order.
/// Keys or values the `http` crate rejects are skipped.
pub fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (key, values) in headers {
        let Ok(name) = HeaderName::from_bytes(key.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                map.append(name.clone(), value);
            }
        }
    }
    map
}

/// Copy `headers` minus the named keys, compared case-insensitively.
pub fn without(headers: &Headers, strip: &[&str]) -> Headers {
    headers
        .iter()
        .filter(|(key, _)| !strip.iter().any(|s| key.eq_ignore_ascii_case(s)))
        .map(|(key, values)| (key.clone(), values.clone()))
        .collect()
}

/// Case-insensitive single-value lookup (first value wins).
pub fn get<'a>(headers: &'a Headers, key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .and_then(|(_, values)| values.first())
        .map(String::as_str)
}

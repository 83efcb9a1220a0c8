//! Client sessions: one HTTP exchange, or a long-lived WebSocket with a read pump and a write pump.
//!
//! HTTP requests are turned into a JSON envelope (path, action, optional value/token, requestId)
//! and sent through a leased session link; the session ends with the response. A WebSocket
//! session forwards each client message to the hub and waits for its response before reading
//! the next one, so responses reach the client in request order.

use crate::codec::{CodecError, PayloadCodec};
use crate::compression::CompressionMode;
use crate::hub::{HubError, SessionLink, SessionPool};
use axum::extract::ws::{Message, WebSocket};
use axum::http::Method;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    WebSocket,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TransportKind::Http => "http",
            TransportKind::WebSocket => "websocket",
        })
    }
}

/// Source of HTTP request ids, shared by all HTTP sessions.
#[derive(Debug, Default)]
pub struct RequestIds(AtomicU64);

impl RequestIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Structured error payload sent to clients: `{"error","reason","message"}`.
pub fn error_body(code: &str, reason: &str, message: &str) -> String {
    json!({ "error": code, "reason": reason, "message": message }).to_string()
}

pub fn unsupported_method_body() -> String {
    error_body("400", "Bad request", "Unsupported HTTP method")
}

/// Query part the hub understands when appended to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKey {
    Filter,
    Metadata,
}

impl QueryKey {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryKey::Filter => "filter",
            QueryKey::Metadata => "metadata",
        }
    }
}

/// Split `path?filter=...` or `path?metadata=...` into path and query. Other queries stay in the path.
pub fn split_path_query(path: &str) -> (&str, Option<(QueryKey, &str)>) {
    if let Some((base, query)) = path.split_once('?') {
        if let Some(value) = query.strip_prefix("filter=") {
            return (base, Some((QueryKey::Filter, value)));
        }
        if let Some(value) = query.strip_prefix("metadata=") {
            return (base, Some((QueryKey::Metadata, value)));
        }
    }
    (path, None)
}

/// The only decoding applied to request URIs: `%22` becomes a quote, `%20` is dropped.
pub fn decode_request_path(raw: &str) -> String {
    raw.replace("%22", "\"").replace("%20", "")
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported HTTP method {0}")]
pub struct UnsupportedMethod(pub Method);

/// Build the hub envelope for one HTTP request. GET and OPTIONS read, POST sets the body.
pub fn build_http_request(
    method: &Method,
    raw_uri: &str,
    token: Option<&str>,
    body: &[u8],
    request_id: u64,
) -> Result<String, UnsupportedMethod> {
    let action = if *method == Method::GET || *method == Method::OPTIONS {
        "get"
    } else if *method == Method::POST {
        "set"
    } else {
        return Err(UnsupportedMethod(method.clone()));
    };

    let decoded = decode_request_path(raw_uri);
    let (path, query) = split_path_query(&decoded);
    let path = path.strip_prefix('/').unwrap_or(path);
    let path = if path.is_empty() { "empty-path" } else { path };

    let mut envelope = Map::new();
    envelope.insert("path".to_string(), Value::String(path.to_string()));
    envelope.insert("action".to_string(), Value::String(action.to_string()));
    if action == "set" {
        envelope.insert(
            "value".to_string(),
            Value::String(String::from_utf8_lossy(body).into_owned()),
        );
    }
    if let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) {
        envelope.insert("token".to_string(), Value::String(token.to_string()));
    }
    envelope.insert("requestId".to_string(), Value::String(request_id.to_string()));
    if let Some((key, value)) = query {
        let value = serde_json::from_str::<Value>(value).unwrap_or_else(|_| Value::String(value.to_string()));
        envelope.insert(key.as_str().to_string(), value);
    }
    Ok(Value::Object(envelope).to_string())
}

/// Drop hub bookkeeping (`action`, `requestId`) from a response before it goes to an HTTP client.
pub fn finalize_http_response(response: &str) -> String {
    match serde_json::from_str::<Value>(response) {
        Ok(Value::Object(mut fields)) => {
            fields.shift_remove("action");
            fields.shift_remove("requestId");
            Value::Object(fields).to_string()
        }
        _ => response.to_string(),
    }
}

/// One HTTP exchange: lease a link, forward the envelope, wait for the response.
pub async fn run_http_session(pool: &SessionPool, envelope: &str) -> Result<String, HubError> {
    let mut link = pool.open_session()?;
    log::debug!("http session {} forwarding {}", link.client_id(), envelope);
    let response = link.round_trip(envelope).await?;
    Ok(finalize_http_response(&response))
}

fn decode_frame(
    codec: &dyn PayloadCodec,
    mode: CompressionMode,
    frame: Message,
) -> Option<Result<String, CodecError>> {
    let bytes = match frame {
        Message::Text(text) if !mode.is_binary() => return Some(Ok(text)),
        Message::Text(text) => text.into_bytes(),
        Message::Binary(bytes) => bytes,
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => return None,
    };
    if mode.is_binary() {
        Some(codec.decode(mode, bytes))
    } else {
        Some(String::from_utf8(bytes).map_err(CodecError::from))
    }
}

fn encode_frame(
    codec: &dyn PayloadCodec,
    mode: CompressionMode,
    message: String,
) -> Result<Message, CodecError> {
    if mode.is_binary() {
        Ok(Message::Binary(codec.encode(mode, message)?))
    } else {
        Ok(Message::Text(message))
    }
}

/// Run a WebSocket session until either pump stops. The other pump is then torn down.
pub async fn run_ws_session(
    socket: WebSocket,
    link: SessionLink,
    mode: CompressionMode,
    codec: Arc<dyn PayloadCodec>,
    buffer: usize,
) {
    let client_id = link.client_id();
    log::info!("websocket session {} open, compression {:?}", client_id, mode);
    let (sink, stream) = socket.split();
    let (backend_tx, backend_rx) = mpsc::channel(buffer.max(1));

    let mut reader = tokio::spawn(read_pump(stream, link, backend_tx, mode, codec.clone()));
    let mut writer = tokio::spawn(write_pump(sink, backend_rx, mode, codec, client_id));

    tokio::select! {
        _ = &mut reader => {
            let _ = writer.await;
        }
        _ = &mut writer => {
            reader.abort();
            let _ = reader.await;
        }
    }
    log::info!("websocket session {} closed", client_id);
}

async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    mut link: SessionLink,
    backend: mpsc::Sender<String>,
    mode: CompressionMode,
    codec: Arc<dyn PayloadCodec>,
) {
    let client_id = link.client_id();
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                log::error!("client {} read error: {}", client_id, e);
                break;
            }
        };
        if matches!(frame, Message::Close(_)) {
            break;
        }
        let payload = match decode_frame(codec.as_ref(), mode, frame) {
            None => continue,
            Some(Ok(p)) => p,
            Some(Err(e)) => {
                log::warn!("client {} sent an undecodable frame: {}", client_id, e);
                if backend.send(error_body("400", "Bad request", &e.to_string())).await.is_err() {
                    break;
                }
                continue;
            }
        };
        log::info!("client {} request: {}, len={}", client_id, payload, payload.len());

        let response = match link.round_trip(&payload).await {
            Ok(r) => r,
            Err(HubError::Routing(e)) => {
                log::warn!("client {} request rejected: {}", client_id, e);
                error_body("400", "Bad request", &e.to_string())
            }
            Err(e) => {
                log::error!("client {} hub link failed: {}", client_id, e);
                break;
            }
        };
        if backend.send(response).await.is_err() {
            break;
        }
    }
}

async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut backend: mpsc::Receiver<String>,
    mode: CompressionMode,
    codec: Arc<dyn PayloadCodec>,
    client_id: u64,
) {
    while let Some(message) = backend.recv().await {
        log::debug!("client {} response: {}", client_id, message);
        let frame = match encode_frame(codec.as_ref(), mode, message) {
            Ok(f) => f,
            Err(e) => {
                log::error!("client {} response encoding failed: {}", client_id, e);
                continue;
            }
        };
        if let Err(e) = sink.send(frame).await {
            log::error!("client {} write error: {}", client_id, e);
            break;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Passthrough;

    fn parsed(envelope: &str) -> Value {
        serde_json::from_str(envelope).unwrap()
    }

    #[test]
    fn get_builds_read_envelope() {
        let e = build_http_request(&Method::GET, "/signal/x", None, b"", 3).unwrap();
        assert_eq!(e, r#"{"path":"signal/x","action":"get","requestId":"3"}"#);
    }

    #[test]
    fn options_is_treated_as_get() {
        let e = parsed(&build_http_request(&Method::OPTIONS, "/Vehicle/Speed", None, b"", 0).unwrap());
        assert_eq!(e["action"], "get");
    }

    #[test]
    fn post_carries_body_as_value() {
        let e = build_http_request(&Method::POST, "/signal/x", None, br#"{"v":1}"#, 9).unwrap();
        assert_eq!(
            parsed(&e),
            json!({"path": "signal/x", "action": "set", "value": "{\"v\":1}", "requestId": "9"})
        );
    }

    #[test]
    fn other_methods_are_unsupported() {
        for m in [Method::DELETE, Method::PUT, Method::PATCH, Method::HEAD] {
            assert!(build_http_request(&m, "/signal/x", None, b"", 0).is_err());
        }
        assert_eq!(
            unsupported_method_body(),
            r#"{"error":"400","reason":"Bad request","message":"Unsupported HTTP method"}"#
        );
    }

    #[test]
    fn authorization_becomes_token() {
        let e = parsed(&build_http_request(&Method::GET, "/A", Some("Bearer abc"), b"", 1).unwrap());
        assert_eq!(e["token"], "Bearer abc");
        let e = parsed(&build_http_request(&Method::GET, "/A", Some("  "), b"", 1).unwrap());
        assert!(e.get("token").is_none());
    }

    #[test]
    fn query_suffix_is_split() {
        assert_eq!(
            split_path_query("/A/B?filter=[x=1]"),
            ("/A/B", Some((QueryKey::Filter, "[x=1]")))
        );
        assert_eq!(
            split_path_query("/A/B?metadata=static"),
            ("/A/B", Some((QueryKey::Metadata, "static")))
        );
        assert_eq!(split_path_query("/A/B?x=1"), ("/A/B?x=1", None));
        assert_eq!(split_path_query("/A/B"), ("/A/B", None));
    }

    #[test]
    fn filter_json_is_embedded_after_decoding() {
        let uri = "/Vehicle/Cabin?filter={%22type%22:%22paths%22,%20%22parameter%22:%22*%22}";
        let e = parsed(&build_http_request(&Method::GET, uri, None, b"", 2).unwrap());
        assert_eq!(e["path"], "Vehicle/Cabin");
        assert_eq!(e["filter"], json!({"type": "paths", "parameter": "*"}));
        let e = parsed(&build_http_request(&Method::GET, "/A/B?filter=[x=1]", None, b"", 2).unwrap());
        assert_eq!(e["filter"], "[x=1]");
    }

    #[test]
    fn empty_path_is_marked() {
        let e = parsed(&build_http_request(&Method::GET, "/", None, b"", 0).unwrap());
        assert_eq!(e["path"], "empty-path");
    }

    #[test]
    fn request_ids_increase() {
        let ids = RequestIds::new();
        let a = ids.next();
        let b = ids.next();
        assert!(b > a);
    }

    #[test]
    fn response_loses_hub_bookkeeping() {
        assert_eq!(
            finalize_http_response(r#"{"action":"get","requestId":"4","data":{"path":"A","dp":{"value":"1"}}}"#),
            r#"{"data":{"path":"A","dp":{"value":"1"}}}"#
        );
        assert_eq!(finalize_http_response("not json"), "not json");
    }

    #[test]
    fn frames_follow_compression_mode() {
        let codec = Passthrough;
        assert!(matches!(
            encode_frame(&codec, CompressionMode::None, "{}".into()).unwrap(),
            Message::Text(_)
        ));
        for mode in [CompressionMode::Proprietary, CompressionMode::PbLevel1, CompressionMode::PbLevel2] {
            assert!(matches!(encode_frame(&codec, mode, "{}".into()).unwrap(), Message::Binary(_)));
        }
        assert!(decode_frame(&codec, CompressionMode::None, Message::Ping(vec![])).is_none());
        assert_eq!(
            decode_frame(&codec, CompressionMode::PbLevel1, Message::Binary(b"{}".to_vec()))
                .unwrap()
                .unwrap(),
            "{}"
        );
    }
}

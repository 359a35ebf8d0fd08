//! Correlation tagging
//!
//! Every instrumented request receives a [`CorrelationContext`] at entry: a
//! fresh correlation id, the derived handler name, a monotonic start instant,
//! a config-gated snapshot of the request, and a capture logger. The context
//! travels through the pipeline as a plain value and is dropped when the
//! request finishes; nothing survives in shared state.

use axum::http::request::Parts;
use serde_json::Value;
use std::fmt;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::capture::RequestLogger;
use crate::config::CaptureConfig;

/// Current time as Unix milliseconds
pub fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}

/// Identity attached to a request by the host application (or by the
/// operator auth layer). Absent for anonymous requests.
#[derive(Debug, Clone)]
pub struct RequestUser {
    pub username: String,
}

/// How the wrapped handler produces its response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Plain handler returning a response directly
    Direct,
    /// JSON API handler running behind a framework adapter
    Mediated,
}

impl HandlerKind {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Mediated => "mediated",
        }
    }
}

/// Stable handler identity derived from a Rust type path
///
/// The owning app is the first path segment, the symbol the last. Closures
/// have no usable symbol and fall back to a placeholder; derivation never
/// fails the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerName {
    pub app: String,
    pub kind: HandlerKind,
    pub symbol: String,
}

impl HandlerName {
    pub fn derive(kind: HandlerKind, type_path: &str) -> Self {
        // Generic arguments are noise: "demo::views::Detail<String>" names Detail
        let path = type_path.split('<').next().unwrap_or(type_path);
        let segments: Vec<&str> = path.split("::").filter(|s| !s.is_empty()).collect();

        let app = segments.first().copied().unwrap_or("app").to_string();

        let symbol = match segments.last() {
            Some(&"{{closure}}") | None => "handler".to_string(),
            Some(last) => last.to_string(),
        };

        Self { app, kind, symbol }
    }

    /// Fully qualified name as persisted: `{app}.{tag}.{symbol}`
    pub fn qualified(&self) -> String {
        format!("{}.{}.{}", self.app, self.kind.tag(), self.symbol)
    }
}

impl fmt::Display for HandlerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.qualified())
    }
}

/// What the tagger saw of the request, taken once at entry
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub method: String,
    pub path: String,
    /// JSON object of header name -> value; None when capture is disabled
    pub headers: Option<Value>,
    /// JSON object of decoded query pairs; None when capture is disabled
    pub query_parameters: Option<Value>,
    /// Raw query string; None when capture is disabled
    pub query_string: Option<String>,
    pub user_id: Option<String>,
    /// Request payload: JSON body (mediated) or form fields (direct)
    pub payload: Option<Value>,
}

impl RequestSnapshot {
    pub fn capture(cfg: &CaptureConfig, parts: &Parts, body: &[u8], kind: HandlerKind) -> Self {
        let headers = cfg.headers.then(|| {
            let mut map = serde_json::Map::new();
            for (name, value) in parts.headers.iter() {
                map.insert(
                    name.as_str().to_string(),
                    Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
                );
            }
            Value::Object(map)
        });

        let raw_query = parts.uri.query().unwrap_or("");

        let query_parameters = cfg.query_parameters.then(|| {
            let mut map = serde_json::Map::new();
            for (key, value) in url::form_urlencoded::parse(raw_query.as_bytes()) {
                map.insert(key.into_owned(), Value::String(value.into_owned()));
            }
            Value::Object(map)
        });

        let query_string = cfg.query_string.then(|| raw_query.to_string());

        let user_id = parts
            .extensions
            .get::<RequestUser>()
            .map(|user| user.username.clone());

        let payload = if body.is_empty() {
            None
        } else {
            match kind {
                HandlerKind::Mediated => serde_json::from_slice(body).ok(),
                HandlerKind::Direct => {
                    let mut map = serde_json::Map::new();
                    for (key, value) in url::form_urlencoded::parse(body) {
                        map.insert(key.into_owned(), Value::String(value.into_owned()));
                    }
                    Some(Value::Object(map))
                }
            }
        };

        Self {
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
            headers,
            query_parameters,
            query_string,
            user_id,
            payload,
        }
    }
}

/// Per-request correlation state created by the tagger
#[derive(Debug, Clone)]
pub struct CorrelationContext {
    /// Correlation id (UUIDv4), also the persistence key for this request
    pub request_id: String,
    pub handler: HandlerName,
    pub started: Instant,
    /// Wall-clock tag time, Unix milliseconds
    pub tagged_at: u64,
    pub snapshot: RequestSnapshot,
    pub logger: RequestLogger,
}

impl CorrelationContext {
    pub fn tag(
        cfg: &CaptureConfig,
        kind: HandlerKind,
        type_path: &str,
        parts: &Parts,
        body: &[u8],
    ) -> Self {
        let request_id = Uuid::new_v4().to_string();
        let handler = HandlerName::derive(kind, type_path);
        let snapshot = RequestSnapshot::capture(cfg, parts, body, kind);
        let logger = RequestLogger::new(&cfg.default_logger_name, &request_id, &handler.symbol);

        Self {
            request_id,
            handler,
            started: Instant::now(),
            tagged_at: current_millis(),
            snapshot,
            logger,
        }
    }

    /// Milliseconds since the request was tagged
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

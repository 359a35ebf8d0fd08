//! Persisted APM entities
//!
//! Plain row types. JSON-shaped columns are kept as pre-serialized strings,
//! timestamps as Unix milliseconds.

use serde::{Deserialize, Serialize};

/// One tagged request, keyed by its correlation id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    pub id: String,
    /// JSON object of headers, None when capture was disabled
    pub headers: Option<String>,
    /// JSON object of decoded query pairs, None when capture was disabled
    pub query_parameters: Option<String>,
    pub query_string: Option<String>,
    /// Derived handler name (`app.kind.symbol`)
    pub handler: String,
    pub method: String,
    pub path: String,
    pub user_id: Option<String>,
    pub requested_at: u64,
}

/// Response row for a tagged request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub request_id: String,
    pub status_code: u16,
    pub elapsed_ms: u64,
    /// Response body snapshot, only stored for statuses >= 400
    pub body: Option<String>,
    pub created_at: u64,
}

/// A captured failure, keyed by the failing request's correlation id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorTrace {
    pub request_id: String,
    /// Request payload as captured at tag time
    pub payload: Option<String>,
    pub exception_class: String,
    pub exception_args: String,
    pub traceback: String,
    pub created_at: u64,
    pub dismissed_at: Option<u64>,
    pub dismissed_by: Option<String>,
}

impl ErrorTrace {
    pub fn is_dismissed(&self) -> bool {
        self.dismissed_at.is_some()
    }
}

/// One captured log line attached to a trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogRecord {
    pub trace_id: String,
    pub level: String,
    pub file_path: String,
    pub func_name: String,
    pub timestamp: u64,
    pub message: String,
}

/// A configured chat platform connection (one per platform)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub id: i64,
    pub platform: String,
    pub token: String,
    pub created_by: Option<String>,
}

/// How a receiver addresses its channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverKind {
    /// Platform-native channel id, used as-is
    Id,
    /// Human channel name, resolved through the platform's listing API
    Name,
}

impl ReceiverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Name => "name",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "id" => Self::Id,
            _ => Self::Name,
        }
    }
}

/// A notification destination belonging to an integration
#[derive(Debug, Clone)]
pub struct NotificationReceiver {
    pub id: i64,
    pub integration_id: i64,
    pub kind: ReceiverKind,
    pub target: String,
}

/// Everything needed to render one notification
#[derive(Debug, Clone)]
pub struct TraceDetail {
    pub trace: ErrorTrace,
    pub request: ApiRequest,
    /// Chronological (insertion order)
    pub logs: Vec<RequestLogRecord>,
}

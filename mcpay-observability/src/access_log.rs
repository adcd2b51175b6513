use serde::{Deserialize, Serialize};

/// Structured access log entry (spec.md §4.9's analytics are a separate,
/// payment-aware usage row; this is the plain per-request access line).
#[derive(Debug, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub timestamp: String,
    pub server_id: Option<String>,
    pub client_ip: Option<String>,
    pub method: String,
    pub uri: String,
    pub response_status: u16,
    pub latency_ms: f64,
    pub upstream_addr: Option<String>,
}

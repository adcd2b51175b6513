use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;
use mcpay_core::{AuthMethod, PricingEntry, ToolCall, User};

/// A response the pipeline hands back to the client, produced by any step
/// that halts further processing (spec.md §3, "terminal response").
#[derive(Debug, Clone)]
pub struct TerminalResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl TerminalResponse {
    pub fn json(status: u16, body: &impl serde::Serialize) -> Self {
        let bytes = serde_json::to_vec(body).expect("terminal response body must serialize");
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from(bytes),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// The raw upstream response captured by the forwarder, before the cache
/// and analytics steps get a chance to inspect it.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_event_stream(&self) -> bool {
        self.content_type()
            .is_some_and(|ct| ct.contains("text/event-stream"))
    }
}

/// The mutable, request-scoped bag the pipeline runner exclusively owns.
/// Steps mutate only the fields they are responsible for producing (spec.md
/// §3's `Context`, §4.1's ownership rule).
pub struct Context {
    pub method: String,
    pub path: String,
    pub query: String,
    pub request_headers: Vec<(String, String)>,
    pub request_body: Bytes,
    pub client_ip: Option<String>,

    pub server_id: Option<String>,
    pub target_upstream: Option<String>,
    pub outbound_headers: Vec<(String, String)>,

    pub tool_call: Option<ToolCall>,
    pub picked_pricing: Option<PricingEntry>,
    pub user: Option<User>,
    pub auth_method: AuthMethod,
    pub preset_payment_header: Option<String>,

    pub cache_key: Option<String>,
    pub cache_bypass: bool,

    pub upstream_response: Option<UpstreamResponse>,
    pub terminal_response: Option<TerminalResponse>,

    pub start: Instant,
    pub cancelled: bool,

    /// Free-form scratch space for steps that need to pass a value to a
    /// later step without widening this struct (mirrors the teacher's
    /// `PluginContext::vars`).
    pub vars: HashMap<String, serde_json::Value>,
}

impl Context {
    pub fn new(method: String, path: String, query: String, headers: Vec<(String, String)>, body: Bytes) -> Self {
        Self {
            method,
            path,
            query,
            request_headers: headers,
            request_body: body,
            client_ip: None,
            server_id: None,
            target_upstream: None,
            outbound_headers: Vec::new(),
            tool_call: None,
            picked_pricing: None,
            user: None,
            auth_method: AuthMethod::None,
            preset_payment_header: None,
            cache_key: None,
            cache_bypass: false,
            upstream_response: None,
            terminal_response: None,
            start: Instant::now(),
            cancelled: false,
            vars: HashMap::new(),
        }
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.request_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn is_paid(&self) -> bool {
        self.tool_call.as_ref().is_some_and(|t| t.is_paid)
    }
}

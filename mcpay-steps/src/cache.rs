//! Response Cache (spec.md §4.5): cache-read and cache-write steps sharing
//! one process-local map, grounded on the teacher's `ConfigCache`
//! (`ando-store/src/cache.rs`) — a `DashMap`-backed, value-owned cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use mcpay_core::{CacheConfig, CacheEntry};
use mcpay_observability::MetricsCollector;
use mcpay_pipeline::{Context, Step, StepOutcome, TerminalResponse};
use sha2::{Digest, Sha256};

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn hash_body(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    let encoded = base64::engine::general_purpose::STANDARD.encode(digest);
    encoded.chars().take(32).collect()
}

/// Builds `method:fullUrl:hash(body)[:32]` (spec.md §3, §4.5).
pub fn cache_key(method: &str, full_url: &str, body: &[u8]) -> String {
    format!("{method}:{full_url}:{}", hash_body(body))
}

fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url).ok()?.host_str().map(str::to_string)
}

/// TTL per host: CoinGecko gets a longer window, known hosts get the
/// default, an unparseable host falls back to the shortest TTL (spec.md §4.5).
fn ttl_for_host(host: Option<&str>, config: &CacheConfig) -> u64 {
    match host {
        Some(h) if h.contains("coingecko") => config.coingecko_ttl_ms,
        Some(_) => config.default_ttl_ms,
        None => config.fallback_ttl_ms,
    }
}

/// Shared process-local cache map plus a once-per-sweep-interval expiry
/// sweep (spec.md §4.5).
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    config: CacheConfig,
    last_sweep_ms: AtomicU64,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            config,
            last_sweep_ms: AtomicU64::new(0),
        })
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.get(key)?;
        if entry.is_live(now_ms()) {
            Some(entry.clone())
        } else {
            None
        }
    }

    pub fn put(&self, key: String, entry: CacheEntry) {
        self.entries.insert(key, entry);
        self.maybe_sweep();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Opportunistic expiry sweep, at most once per `sweep_interval_ms`
    /// (spec.md §4.5). Race on the gate is tolerated — worst case two
    /// threads sweep back to back, which is harmless.
    fn maybe_sweep(&self) {
        let now = now_ms();
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.config.sweep_interval_ms {
            return;
        }
        self.last_sweep_ms.store(now, Ordering::Relaxed);
        self.entries.retain(|_, entry| entry.is_live(now));
    }
}

pub struct CacheReadStep {
    cache: Arc<ResponseCache>,
    metrics: Arc<MetricsCollector>,
}

impl CacheReadStep {
    pub fn new(cache: Arc<ResponseCache>, metrics: Arc<MetricsCollector>) -> Self {
        Self { cache, metrics }
    }
}

#[async_trait]
impl Step for CacheReadStep {
    fn name(&self) -> &'static str {
        "cache-read"
    }

    async fn run(&self, ctx: &mut Context) -> StepOutcome {
        if !ctx.method.eq_ignore_ascii_case("GET") {
            return StepOutcome::Continue;
        }

        let full_url = format!("{}?{}", ctx.path, ctx.query);
        let key = cache_key(&ctx.method, &full_url, &ctx.request_body);
        ctx.cache_key = Some(key.clone());

        if let Some(entry) = self.cache.get(&key) {
            self.metrics.record_cache_outcome("HIT");
            let mut headers = entry.headers.clone();
            headers.push(("x-mcpay-cache".to_string(), "HIT".to_string()));
            return StepOutcome::Terminal(TerminalResponse {
                status: entry.status,
                headers,
                body: entry.body,
            });
        }

        StepOutcome::Continue
    }
}

pub struct CacheWriteStep {
    cache: Arc<ResponseCache>,
    config: CacheConfig,
    metrics: Arc<MetricsCollector>,
}

impl CacheWriteStep {
    pub fn new(cache: Arc<ResponseCache>, config: CacheConfig, metrics: Arc<MetricsCollector>) -> Self {
        Self { cache, config, metrics }
    }
}

#[async_trait]
impl Step for CacheWriteStep {
    fn name(&self) -> &'static str {
        "cache-write"
    }

    async fn run(&self, ctx: &mut Context) -> StepOutcome {
        let Some(key) = ctx.cache_key.clone() else {
            return StepOutcome::Continue;
        };
        let Some(response) = ctx.upstream_response.clone() else {
            return StepOutcome::Continue;
        };
        if response.status >= 400 {
            return StepOutcome::Continue;
        }

        if response.is_event_stream() {
            self.metrics.record_cache_outcome("BYPASS");
            if let Some(terminal) = ctx.terminal_response.as_mut() {
                terminal.headers.push(("x-mcpay-cache".to_string(), "BYPASS".to_string()));
            }
            return StepOutcome::Continue;
        }

        let host = ctx.target_upstream.as_deref().and_then(host_of);
        let ttl = ttl_for_host(host.as_deref(), &self.config);
        let entry = CacheEntry {
            status: response.status,
            status_text: String::new(),
            headers: response.headers.clone(),
            body: response.body.clone(),
            timestamp_ms: now_ms(),
            ttl_ms: ttl,
        };
        self.cache.put(key, entry);
        self.metrics.record_cache_outcome("MISS");

        if let Some(terminal) = ctx.terminal_response.as_mut() {
            terminal.headers.push(("x-mcpay-cache".to_string(), "MISS".to_string()));
        }

        StepOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mcpay_core::McpayConfig;
    use mcpay_pipeline::UpstreamResponse;

    fn blank_ctx(method: &str, path: &str) -> Context {
        Context::new(method.into(), path.into(), "".into(), vec![], Bytes::new())
    }

    fn test_metrics() -> Arc<MetricsCollector> {
        Arc::new(MetricsCollector::new().unwrap())
    }

    #[tokio::test]
    async fn get_miss_then_hit_after_write() {
        let cache = ResponseCache::new(McpayConfig::default().cache);
        let read = CacheReadStep::new(cache.clone(), test_metrics());
        let write = CacheWriteStep::new(cache.clone(), McpayConfig::default().cache, test_metrics());

        let mut ctx = blank_ctx("GET", "/mcp/SRV/health");
        ctx.target_upstream = Some("https://up.example".into());
        assert!(matches!(read.run(&mut ctx).await, StepOutcome::Continue));

        ctx.upstream_response = Some(UpstreamResponse {
            status: 200,
            headers: vec![("content-type".into(), "application/json".into())],
            body: Bytes::from_static(b"{\"ok\":true}"),
        });
        ctx.terminal_response = Some(TerminalResponse {
            status: 200,
            headers: vec![],
            body: Bytes::from_static(b"{\"ok\":true}"),
        });
        write.run(&mut ctx).await;
        assert_eq!(cache.len(), 1);

        let mut second = blank_ctx("GET", "/mcp/SRV/health");
        second.target_upstream = Some("https://up.example".into());
        match read.run(&mut second).await {
            StepOutcome::Terminal(resp) => {
                assert!(resp.headers.iter().any(|(k, v)| k == "x-mcpay-cache" && v == "HIT"));
                assert_eq!(resp.body, Bytes::from_static(b"{\"ok\":true}"));
            }
            _ => panic!("expected cache hit"),
        }
    }

    #[tokio::test]
    async fn event_stream_bypasses_cache() {
        let cache = ResponseCache::new(McpayConfig::default().cache);
        let write = CacheWriteStep::new(cache.clone(), McpayConfig::default().cache, test_metrics());

        let mut ctx = blank_ctx("GET", "/mcp/SRV/stream");
        ctx.cache_key = Some("GET:/mcp/SRV/stream?:abc".into());
        ctx.target_upstream = Some("https://up.example".into());
        ctx.upstream_response = Some(UpstreamResponse {
            status: 200,
            headers: vec![("content-type".into(), "text/event-stream".into())],
            body: Bytes::new(),
        });
        ctx.terminal_response = Some(TerminalResponse { status: 200, headers: vec![], body: Bytes::new() });
        write.run(&mut ctx).await;

        assert!(cache.is_empty());
        let terminal = ctx.terminal_response.unwrap();
        assert!(terminal.headers.iter().any(|(k, v)| k == "x-mcpay-cache" && v == "BYPASS"));
    }

    #[tokio::test]
    async fn non_get_requests_are_not_cached() {
        let cache = ResponseCache::new(McpayConfig::default().cache);
        let read = CacheReadStep::new(cache.clone(), test_metrics());
        let mut ctx = blank_ctx("POST", "/mcp/SRV");
        read.run(&mut ctx).await;
        assert!(ctx.cache_key.is_none());
    }

    #[test]
    fn ttl_prefers_coingecko_window() {
        let config = McpayConfig::default().cache;
        assert_eq!(ttl_for_host(Some("api.coingecko.com"), &config), config.coingecko_ttl_ms);
        assert_eq!(ttl_for_host(Some("up.example"), &config), config.default_ttl_ms);
        assert_eq!(ttl_for_host(None, &config), config.fallback_ttl_ms);
    }
}

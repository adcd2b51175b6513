//! Prometheus metrics collector, grounded on the teacher's
//! `MetricsCollector` (`ando-observability/src/metrics.rs`): same
//! `Registry`-owning struct, same `IntCounterVec`/`HistogramVec`/`IntGauge`
//! shape, narrowed to the gateway's own request/payment/cache surface.

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub struct MetricsCollector {
    registry: Registry,

    /// Total proxied requests by server id, method, status.
    pub http_requests_total: IntCounterVec,
    /// Request latency histogram by server id.
    pub http_request_duration: HistogramVec,
    /// Upstream response time, independent of the client-facing latency.
    pub upstream_latency: HistogramVec,
    /// Outcome of the payment gate (`free`, `paid`, `402_unready`,
    /// `402_need_header`, `402_invalid`, `settled_pending`).
    pub payment_gate_outcomes: IntCounterVec,
    /// Response cache hit/miss/bypass counters.
    pub cache_outcomes: IntCounterVec,
    /// Active in-flight requests.
    pub active_requests: IntGauge,
}

impl MetricsCollector {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("mcpay_http_requests_total", "Total proxied HTTP requests").namespace("mcpay"),
            &["server_id", "method", "status"],
        )?;

        let http_request_duration = HistogramVec::new(
            HistogramOpts::new("mcpay_http_request_duration_seconds", "Client-facing request latency")
                .namespace("mcpay")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["server_id"],
        )?;

        let upstream_latency = HistogramVec::new(
            HistogramOpts::new("mcpay_upstream_latency_seconds", "Upstream dispatch latency")
                .namespace("mcpay")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["upstream_host"],
        )?;

        let payment_gate_outcomes = IntCounterVec::new(
            Opts::new("mcpay_payment_gate_outcomes_total", "Payment gate state outcomes").namespace("mcpay"),
            &["outcome"],
        )?;

        let cache_outcomes = IntCounterVec::new(
            Opts::new("mcpay_cache_outcomes_total", "Response cache hit/miss/bypass").namespace("mcpay"),
            &["outcome"],
        )?;

        let active_requests = IntGauge::new("mcpay_active_requests", "In-flight requests")?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration.clone()))?;
        registry.register(Box::new(upstream_latency.clone()))?;
        registry.register(Box::new(payment_gate_outcomes.clone()))?;
        registry.register(Box::new(cache_outcomes.clone()))?;
        registry.register(Box::new(active_requests.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_request_duration,
            upstream_latency,
            payment_gate_outcomes,
            cache_outcomes,
            active_requests,
        })
    }

    pub fn record_request(&self, server_id: &str, method: &str, status: u16, duration_secs: f64) {
        self.http_requests_total
            .with_label_values(&[server_id, method, &status.to_string()])
            .inc();
        self.http_request_duration.with_label_values(&[server_id]).observe(duration_secs);
    }

    pub fn record_payment_gate_outcome(&self, outcome: &str) {
        self.payment_gate_outcomes.with_label_values(&[outcome]).inc();
    }

    pub fn record_cache_outcome(&self, outcome: &str) {
        self.cache_outcomes.with_label_values(&[outcome]).inc();
    }

    /// Prometheus text exposition for the `/metrics` admin endpoint.
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let metrics = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metrics, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("failed to construct metrics collector")
    }
}

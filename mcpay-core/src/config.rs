use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Top-level configuration for the gateway. Loaded once at startup into an
/// immutable struct, the same shape the teacher's `AndoConfig::load` builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpayConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub payment_strategy: PaymentStrategyConfig,

    #[serde(default)]
    pub facilitator: FacilitatorConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub runtime: RuntimeMode,
}

/// Proxy + admin HTTP listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,

    /// Cap on a request body the inspector/forwarder will buffer in memory
    /// before rejecting with 413 (spec.md §9, "read once into a bounded buffer").
    #[serde(default = "default_body_cap_bytes")]
    pub body_cap_bytes: usize,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
}

/// Host-keyed token-bucket rate limiter (spec.md §4.4).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rl_capacity")]
    pub capacity: f64,

    #[serde(default = "default_rl_refill_per_second")]
    pub refill_per_second: f64,

    #[serde(default = "default_rl_min_delay_ms")]
    pub min_delay_ms: u64,
}

/// Cross-cutting signer-registry policy (spec.md §4.8, §5, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentStrategyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub fallback: FallbackBehavior,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_strategy_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FallbackBehavior {
    Fail,
    #[default]
    Continue,
    LogOnly,
}

/// Per-network facilitator base URLs (spec.md §6: `BASE_SEPOLIA_FACILITATOR_URL`,
/// `SEI_TESTNET_FACILITATOR_URL`, else `FACILITATOR_URL`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacilitatorConfig {
    #[serde(default = "default_facilitator_url")]
    pub default_url: String,

    #[serde(default)]
    pub per_network: HashMap<String, String>,

    #[serde(default = "default_facilitator_timeout_ms")]
    pub timeout_ms: u64,
}

impl FacilitatorConfig {
    /// Resolves the facilitator base URL for a network, falling back to
    /// `default_url` when no per-network override is configured.
    pub fn url_for(&self, network: &str) -> &str {
        self.per_network
            .get(network)
            .map(String::as_str)
            .unwrap_or(&self.default_url)
    }
}

/// Response-cache TTL policy (spec.md §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_coingecko_ms")]
    pub coingecko_ttl_ms: u64,

    #[serde(default = "default_ttl_default_ms")]
    pub default_ttl_ms: u64,

    #[serde(default = "default_ttl_fallback_ms")]
    pub fallback_ttl_ms: u64,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub victoria_logs: VictoriaLogsConfig,

    #[serde(default)]
    pub prometheus: PrometheusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VictoriaLogsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_vl_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_log_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_log_flush_interval")]
    pub flush_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_path")]
    pub path: String,
}

/// Equivalent of `NODE_ENV`: selects whether the test auto-sign strategy is
/// eligible to run (spec.md §4.8's test strategy, §8 E4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    #[default]
    Production,
    Test,
}

impl McpayConfig {
    /// Load configuration from YAML file + environment variables, mirroring
    /// the teacher's layered figment setup (`MCPAY_` prefix, `__` nesting).
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        } else {
            for default_path in &["mcpay.yaml", "/etc/mcpay/mcpay.yaml", "config/mcpay.yaml"] {
                if std::path::Path::new(default_path).exists() {
                    figment = figment.merge(Yaml::file(default_path));
                    break;
                }
            }
        }

        figment = figment.merge(Env::prefixed("MCPAY_").split("__"));

        let config: Self = figment.extract()?;
        Ok(config)
    }

    pub fn is_test_mode(&self) -> bool {
        self.runtime == RuntimeMode::Test
    }
}

impl Default for McpayConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            server: ServerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            payment_strategy: PaymentStrategyConfig::default(),
            facilitator: FacilitatorConfig::default(),
            cache: CacheConfig::default(),
            observability: ObservabilityConfig::default(),
            runtime: RuntimeMode::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            admin_addr: default_admin_addr(),
            body_cap_bytes: default_body_cap_bytes(),
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_rl_capacity(),
            refill_per_second: default_rl_refill_per_second(),
            min_delay_ms: default_rl_min_delay_ms(),
        }
    }
}

impl Default for PaymentStrategyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fallback: FallbackBehavior::default(),
            max_retries: default_max_retries(),
            timeout_ms: default_strategy_timeout_ms(),
        }
    }
}

impl Default for FacilitatorConfig {
    fn default() -> Self {
        Self {
            default_url: default_facilitator_url(),
            per_network: HashMap::new(),
            timeout_ms: default_facilitator_timeout_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            coingecko_ttl_ms: default_ttl_coingecko_ms(),
            default_ttl_ms: default_ttl_default_ms(),
            fallback_ttl_ms: default_ttl_fallback_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            victoria_logs: VictoriaLogsConfig::default(),
            prometheus: PrometheusConfig::default(),
        }
    }
}

impl Default for VictoriaLogsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_vl_endpoint(),
            batch_size: default_log_batch_size(),
            flush_interval_secs: default_log_flush_interval(),
        }
    }
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
        }
    }
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_http_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_admin_addr() -> SocketAddr {
    "127.0.0.1:8081".parse().unwrap()
}

fn default_body_cap_bytes() -> usize {
    1024 * 1024 // 1 MiB, spec.md §9
}

fn default_connect_timeout() -> u64 {
    6000
}

fn default_read_timeout() -> u64 {
    15000
}

fn default_rl_capacity() -> f64 {
    30.0
}

fn default_rl_refill_per_second() -> f64 {
    0.5
}

fn default_rl_min_delay_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_strategy_timeout_ms() -> u64 {
    30_000
}

fn default_facilitator_url() -> String {
    "https://x402.org/facilitator".to_string()
}

fn default_facilitator_timeout_ms() -> u64 {
    10_000
}

fn default_ttl_coingecko_ms() -> u64 {
    60_000
}

fn default_ttl_default_ms() -> u64 {
    45_000
}

fn default_ttl_fallback_ms() -> u64 {
    30_000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_vl_endpoint() -> String {
    "http://127.0.0.1:9428/insert/jsonline".to_string()
}

fn default_log_batch_size() -> usize {
    1000
}

fn default_log_flush_interval() -> u64 {
    5
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_true() -> bool {
    true
}

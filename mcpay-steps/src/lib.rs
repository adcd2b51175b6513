//! Concrete step implementations and the canonical-order assembly that
//! turns them into a [`PipelineRunner`].

pub mod analytics;
pub mod auth_resolve;
pub mod cache;
pub mod forward_prepare;
pub mod header_filter;
pub mod inspect_tool_call;
pub mod payment_gate;
pub mod rate_limit;
pub mod upstream_dispatch;

use std::sync::Arc;

use mcpay_catalog::CatalogRepository;
use mcpay_core::McpayConfig;
use mcpay_observability::MetricsCollector;
use mcpay_pipeline::{PipelineBuildError, PipelineRunner, Step};
use mcpay_signers::{ManagedWalletStrategy, SignerRegistry, Strategy, TestStrategy};

pub use analytics::AnalyticsStep;
pub use auth_resolve::{AuthResolveStep, NoSessionValidator, SessionValidator};
pub use cache::{CacheReadStep, CacheWriteStep, ResponseCache};
pub use forward_prepare::ForwardPrepareStep;
pub use inspect_tool_call::InspectToolCallStep;
pub use payment_gate::{FacilitatorClients, PaymentGateStep};
pub use rate_limit::RateLimitStep;
pub use upstream_dispatch::UpstreamDispatchStep;

/// Collaborators the gateway binary owns and wires once at startup.
pub struct GatewayDeps {
    pub catalog: Arc<dyn CatalogRepository>,
    pub session_validator: Arc<dyn SessionValidator>,
    pub http_client: reqwest::Client,
    pub config: McpayConfig,
    pub metrics: Arc<MetricsCollector>,
}

/// Builds the signer registry's default strategy set: the managed-wallet
/// strategy always present, the test strategy added so it is eligible
/// whenever the deployment runs in test mode (spec.md §4.8).
fn default_strategies(catalog: Arc<dyn CatalogRepository>) -> Vec<Arc<dyn Strategy>> {
    vec![
        Arc::new(ManagedWalletStrategy::new(catalog)),
        Arc::new(TestStrategy::new()),
    ]
}

/// Assembles the nine canonical-order steps into a runnable pipeline
/// (spec.md §4.1).
pub fn build_pipeline(deps: GatewayDeps) -> Result<PipelineRunner, PipelineBuildError> {
    let GatewayDeps {
        catalog,
        session_validator,
        http_client,
        config,
        metrics,
    } = deps;

    let response_cache = ResponseCache::new(config.cache.clone());
    let signers = Arc::new(SignerRegistry::new(
        default_strategies(catalog.clone()),
        config.payment_strategy.clone(),
    ));
    let facilitators = Arc::new(FacilitatorClients::new(config.facilitator.clone()));

    let steps: Vec<Arc<dyn Step>> = vec![
        Arc::new(AuthResolveStep::new(catalog.clone(), session_validator)),
        Arc::new(InspectToolCallStep::new(catalog.clone())),
        Arc::new(RateLimitStep::new(config.rate_limit)),
        Arc::new(CacheReadStep::new(response_cache.clone(), metrics.clone())),
        Arc::new(ForwardPrepareStep),
        Arc::new(PaymentGateStep::new(catalog.clone(), facilitators, signers, metrics.clone(), &config)),
        Arc::new(UpstreamDispatchStep::new(http_client)),
        Arc::new(CacheWriteStep::new(response_cache, config.cache, metrics)),
        Arc::new(AnalyticsStep::new(catalog)),
    ];

    PipelineRunner::build(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpay_catalog::InMemoryCatalog;

    #[test]
    fn build_pipeline_accepts_canonical_order() {
        let deps = GatewayDeps {
            catalog: InMemoryCatalog::new(),
            session_validator: Arc::new(NoSessionValidator),
            http_client: reqwest::Client::new(),
            config: McpayConfig::default(),
            metrics: Arc::new(MetricsCollector::new().unwrap()),
        };
        assert!(build_pipeline(deps).is_ok());
    }
}

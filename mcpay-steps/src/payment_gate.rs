//! Payment Gate (spec.md §4.7) — the state machine deciding whether a
//! `tools/call` may proceed to the upstream dispatch.
//!
//! `S_free → S_paid_unready → S_paid_challenge → S_need_header → S_verify →
//! S_forward`, implemented as one straight-line function rather than an
//! explicit state enum: each state's terminal condition returns early, the
//! way the teacher's plugin `run` methods short-circuit on their own
//! disqualifying conditions (e.g. `KeyAuthPlugin::execute`).

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use mcpay_catalog::CatalogRepository;
use mcpay_core::{FacilitatorConfig, McpayConfig, Network, PaymentRecord, PaymentStatus};
use mcpay_facilitator::{FacilitatorClient, FacilitatorClientError};
use mcpay_observability::MetricsCollector;
use mcpay_pipeline::{Context, Step, StepOutcome, TerminalResponse};
use mcpay_signers::{SignContext, SignerRegistry};
use mcpay_x402::{raw_to_human, PaymentPayload, PaymentRequirement, PaymentRequired};

/// Lazily-built, network-keyed facilitator clients (spec.md §6: per-network
/// facilitator URL overrides).
pub struct FacilitatorClients {
    config: FacilitatorConfig,
    timeout: std::time::Duration,
    clients: DashMap<String, Arc<FacilitatorClient>>,
}

impl FacilitatorClients {
    pub fn new(config: FacilitatorConfig) -> Self {
        let timeout = std::time::Duration::from_millis(config.timeout_ms);
        Self {
            config,
            timeout,
            clients: DashMap::new(),
        }
    }

    pub fn get(&self, network: &str) -> Result<Arc<FacilitatorClient>, FacilitatorClientError> {
        if let Some(existing) = self.clients.get(network) {
            return Ok(existing.clone());
        }
        let url = self.config.url_for(network).to_string();
        let client = Arc::new(FacilitatorClient::try_new(&url, self.timeout)?);
        self.clients.insert(network.to_string(), client.clone());
        Ok(client)
    }
}

fn managed_wallet_headers_present(ctx: &Context) -> bool {
    ctx.get_header("x-wallet-provider") == Some("coinbase-cdp") && ctx.get_header("x-wallet-type") == Some("managed")
}

pub struct PaymentGateStep {
    catalog: Arc<dyn CatalogRepository>,
    facilitators: Arc<FacilitatorClients>,
    signers: Arc<SignerRegistry>,
    metrics: Arc<MetricsCollector>,
    is_test_mode: bool,
}

impl PaymentGateStep {
    pub fn new(
        catalog: Arc<dyn CatalogRepository>,
        facilitators: Arc<FacilitatorClients>,
        signers: Arc<SignerRegistry>,
        metrics: Arc<MetricsCollector>,
        config: &McpayConfig,
    ) -> Self {
        Self {
            catalog,
            facilitators,
            signers,
            metrics,
            is_test_mode: config.is_test_mode(),
        }
    }
}

#[async_trait]
impl Step for PaymentGateStep {
    fn name(&self) -> &'static str {
        "payment-gate"
    }

    async fn run(&self, ctx: &mut Context) -> StepOutcome {
        let Some(tool_call) = ctx.tool_call.clone() else {
            self.metrics.record_payment_gate_outcome("free");
            return StepOutcome::Continue; // S_free: nothing to gate.
        };
        if !tool_call.is_paid {
            self.metrics.record_payment_gate_outcome("free");
            return StepOutcome::Continue; // S_free
        }

        let (Some(pricing), Some(pay_to)) = (tool_call.pricing.clone(), tool_call.pay_to.clone()) else {
            // S_paid_unready
            self.metrics.record_payment_gate_outcome("402_unready");
            let body = PaymentRequired::new("No payment information available", vec![]);
            return StepOutcome::Terminal(TerminalResponse::json(402, &body));
        };

        let human_amount = match raw_to_human(&pricing.max_amount_required_raw, pricing.token_decimals) {
            Ok(v) => v,
            Err(_) => {
                self.metrics.record_payment_gate_outcome("402_unready");
                let body = PaymentRequired::new("No payment information available", vec![]);
                return StepOutcome::Terminal(TerminalResponse::json(402, &body));
            }
        };

        let requirement = PaymentRequirement {
            scheme: "exact".to_string(),
            network: pricing.network.as_str().to_string(),
            max_amount_required: human_amount,
            resource: format!("mcpay://{}", tool_call.name),
            description: format!("Execution of {}", tool_call.name),
            mime_type: String::new(),
            pay_to,
            max_timeout_seconds: 60,
            asset: pricing.asset_address.clone(),
            output_schema: None,
            extra: None,
        };

        // S_paid_challenge
        let mut header = ctx.get_header("x-payment").map(str::to_string);
        if header.is_none() {
            let auto_sign_eligible = ctx.auth_method == mcpay_core::AuthMethod::ApiKey
                || managed_wallet_headers_present(ctx);
            if auto_sign_eligible {
                let sign_ctx = SignContext {
                    user: ctx.user.as_ref(),
                    requirement: &requirement,
                    is_test_mode: self.is_test_mode,
                    managed_wallet_headers_present: managed_wallet_headers_present(ctx),
                };
                match self.signers.try_sign(&sign_ctx).await {
                    Ok(outcome) => {
                        if outcome.ok {
                            header = outcome.header;
                        }
                    }
                    Err(e) => {
                        self.metrics.record_payment_gate_outcome("402_invalid");
                        return StepOutcome::Terminal(TerminalResponse::json(
                            500,
                            &serde_json::json!({ "error": e.to_string() }),
                        ));
                    }
                }
            }
        }

        // S_need_header
        let Some(header) = header else {
            self.metrics.record_payment_gate_outcome("402_need_header");
            let body = PaymentRequired::new("X-PAYMENT header is required", vec![requirement]);
            return StepOutcome::Terminal(TerminalResponse::json(402, &body));
        };

        // S_verify
        let payload = match PaymentPayload::decode_header(&header) {
            Ok(p) => p,
            Err(e) => {
                self.metrics.record_payment_gate_outcome("402_invalid");
                let body = PaymentRequired::new(e.to_string(), vec![requirement]);
                return StepOutcome::Terminal(TerminalResponse::json(402, &body));
            }
        };

        let facilitator = match self.facilitators.get(&requirement.network) {
            Ok(c) => c,
            Err(e) => {
                self.metrics.record_payment_gate_outcome("402_invalid");
                let body = PaymentRequired::new(e.to_string(), vec![requirement]);
                return StepOutcome::Terminal(TerminalResponse::json(402, &body));
            }
        };

        let verify_result = match facilitator.verify(&payload, &requirement).await {
            Ok(r) => r,
            Err(e) => {
                self.metrics.record_payment_gate_outcome("402_invalid");
                let body = PaymentRequired::new(e.to_string(), vec![requirement]);
                return StepOutcome::Terminal(TerminalResponse::json(402, &body));
            }
        };

        if !verify_result.is_valid {
            self.metrics.record_payment_gate_outcome("402_invalid");
            let mut body = PaymentRequired::new(
                verify_result.invalid_reason.unwrap_or_else(|| "payment invalid".to_string()),
                vec![requirement],
            );
            if let Some(payer) = verify_result.payer {
                body = body.with_payer(payer);
            }
            return StepOutcome::Terminal(TerminalResponse::json(402, &body));
        }

        // S_forward
        let record = PaymentRecord {
            tool_id: tool_call.tool_id.clone().unwrap_or_default(),
            user_id: ctx.user.as_ref().map(|u| u.id.clone()),
            amount_raw: pricing.max_amount_required_raw.clone(),
            token_decimals: pricing.token_decimals,
            asset_address: pricing.asset_address.clone(),
            network: Network::from(requirement.network.as_str()),
            status: PaymentStatus::Pending,
            signature: payload.signature().to_string(),
            payer_address: verify_result.payer,
        };
        // Best-effort; a catalog error here must not block forwarding (spec.md §4.7).
        if let Err(e) = self.catalog.create_payment(record).await {
            tracing::warn!(error = %e, "failed to persist pending payment record");
        }
        self.metrics.record_payment_gate_outcome("settled_pending");

        StepOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mcpay_catalog::InMemoryCatalog;
    use mcpay_core::{FallbackBehavior, PaymentStrategyConfig, PricingEntry, ToolCall};
    use mcpay_signers::TestStrategy;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pricing() -> PricingEntry {
        PricingEntry {
            asset_address: "0xasset".into(),
            network: Network::BaseSepolia,
            max_amount_required_raw: "10000".into(),
            token_decimals: 6,
            active: true,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn paid_ctx(pricing: Option<PricingEntry>, pay_to: Option<String>) -> Context {
        let mut ctx = Context::new("POST".into(), "/mcp/SRV".into(), "".into(), vec![], Bytes::new());
        ctx.tool_call = Some(ToolCall {
            name: "myTool".into(),
            args: serde_json::Value::Null,
            is_paid: true,
            pay_to,
            pricing,
            server_id: "SRV".into(),
            tool_id: Some("t1".into()),
        });
        ctx
    }

    fn registry(max_retries: u32) -> Arc<SignerRegistry> {
        Arc::new(SignerRegistry::new(
            vec![Arc::new(TestStrategy::new())],
            PaymentStrategyConfig {
                enabled: true,
                fallback: FallbackBehavior::Continue,
                max_retries,
                timeout_ms: 5_000,
            },
        ))
    }

    fn test_metrics() -> Arc<MetricsCollector> {
        Arc::new(MetricsCollector::new().unwrap())
    }

    #[tokio::test]
    async fn non_paid_tool_call_passes_through() {
        let catalog = InMemoryCatalog::new();
        let facilitators = Arc::new(FacilitatorClients::new(FacilitatorConfig::default()));
        let step = PaymentGateStep::new(catalog, facilitators, registry(1), test_metrics(), &McpayConfig::default());
        let mut ctx = Context::new("GET".into(), "/mcp/SRV".into(), "".into(), vec![], Bytes::new());
        assert!(matches!(step.run(&mut ctx).await, StepOutcome::Continue));
    }

    #[tokio::test]
    async fn paid_without_pricing_is_unready_402() {
        let catalog = InMemoryCatalog::new();
        let facilitators = Arc::new(FacilitatorClients::new(FacilitatorConfig::default()));
        let step = PaymentGateStep::new(catalog, facilitators, registry(1), test_metrics(), &McpayConfig::default());
        let mut ctx = paid_ctx(None, None);
        match step.run(&mut ctx).await {
            StepOutcome::Terminal(resp) => {
                assert_eq!(resp.status, 402);
                let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
                assert_eq!(body["accepts"].as_array().unwrap().len(), 0);
            }
            _ => panic!("expected 402 unready"),
        }
    }

    #[tokio::test]
    async fn missing_header_yields_need_header_402_with_accepts() {
        let catalog = InMemoryCatalog::new();
        let facilitators = Arc::new(FacilitatorClients::new(FacilitatorConfig::default()));
        let mut config = McpayConfig::default();
        config.payment_strategy.enabled = false;
        let step = PaymentGateStep::new(catalog, facilitators, registry(1), test_metrics(), &config);
        let mut ctx = paid_ctx(Some(pricing()), Some("0xpayee".into()));
        match step.run(&mut ctx).await {
            StepOutcome::Terminal(resp) => {
                assert_eq!(resp.status, 402);
                let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
                assert_eq!(body["error"], "X-PAYMENT header is required");
                assert_eq!(body["accepts"][0]["maxAmountRequired"], "0.01");
            }
            _ => panic!("expected 402 need-header"),
        }
    }

    #[tokio::test]
    async fn test_mode_auto_sign_then_verify_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "isValid": true,
                "payer": "0xpayer"
            })))
            .mount(&server)
            .await;

        let catalog = InMemoryCatalog::new();
        let mut facilitator_config = FacilitatorConfig::default();
        facilitator_config.default_url = server.uri();
        let facilitators = Arc::new(FacilitatorClients::new(facilitator_config));

        let mut config = McpayConfig::default();
        config.runtime = mcpay_core::RuntimeMode::Test;
        let step = PaymentGateStep::new(catalog.clone(), facilitators, registry(1), test_metrics(), &config);

        let mut ctx = paid_ctx(Some(pricing()), Some("0xpayee".into()));
        ctx.auth_method = mcpay_core::AuthMethod::ApiKey;
        let outcome = step.run(&mut ctx).await;
        assert!(matches!(outcome, StepOutcome::Continue));
        assert_eq!(catalog.payment_count(), 1);
    }

    #[tokio::test]
    async fn verify_rejection_surfaces_reason_and_payer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "isValid": false,
                "invalidReason": "insufficient_funds",
                "payer": "0xpayer"
            })))
            .mount(&server)
            .await;

        let catalog = InMemoryCatalog::new();
        let mut facilitator_config = FacilitatorConfig::default();
        facilitator_config.default_url = server.uri();
        let facilitators = Arc::new(FacilitatorClients::new(facilitator_config));

        let mut config = McpayConfig::default();
        config.runtime = mcpay_core::RuntimeMode::Test;
        let step = PaymentGateStep::new(catalog.clone(), facilitators, registry(1), test_metrics(), &config);

        let mut ctx = paid_ctx(Some(pricing()), Some("0xpayee".into()));
        ctx.auth_method = mcpay_core::AuthMethod::ApiKey;
        match step.run(&mut ctx).await {
            StepOutcome::Terminal(resp) => {
                let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
                assert_eq!(body["error"], "insufficient_funds");
                assert_eq!(body["payer"], "0xpayer");
            }
            _ => panic!("expected 402 invalid payment"),
        }
        assert_eq!(catalog.payment_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_signature_does_not_double_record() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"isValid": true})))
            .mount(&server)
            .await;

        let catalog = InMemoryCatalog::new();
        let mut facilitator_config = FacilitatorConfig::default();
        facilitator_config.default_url = server.uri();
        let facilitators = Arc::new(FacilitatorClients::new(facilitator_config));

        let mut config = McpayConfig::default();
        config.runtime = mcpay_core::RuntimeMode::Test;
        let step = PaymentGateStep::new(catalog.clone(), facilitators, registry(1), test_metrics(), &config);

        for _ in 0..2 {
            let payload = mcpay_x402::PaymentPayload {
                x402_version: mcpay_x402::X402_VERSION,
                scheme: "exact".into(),
                network: "base-sepolia".into(),
                payload: mcpay_x402::ExactPayload {
                    signature: "fixed-sig".into(),
                    authorization: mcpay_x402::ExactAuthorization {
                        from: "0xfrom".into(),
                        to: "0xpayee".into(),
                        value: "10000".into(),
                        valid_after: "0".into(),
                        valid_before: "9999999999".into(),
                        nonce: "0xnonce".into(),
                    },
                },
            };
            let mut ctx = paid_ctx(Some(pricing()), Some("0xpayee".into()));
            ctx.request_headers.push(("x-payment".into(), payload.encode_header().unwrap()));
            step.run(&mut ctx).await;
        }
        assert_eq!(catalog.payment_count(), 1);
    }
}

//! Auto-sign strategy registry (spec.md §4.8).
//!
//! Grounded on the teacher's plugin-priority pattern (`ando-plugin`'s
//! priority-sorted execution) generalized per spec.md §9: "represent
//! strategies as a simple interface; the registry owns an ordered list...
//! the cross-cutting timeout/retry/fallback policy belongs to the registry,
//! not to individual strategies."

use std::sync::Arc;
use std::time::Duration;

use mcpay_catalog::{CatalogRepository, Wallet};
use mcpay_core::{FallbackBehavior, PaymentStrategyConfig, User};
use mcpay_x402::PaymentRequirement;

/// The minimal slice of request state a strategy needs to decide whether it
/// can produce a header and to build one. Kept independent of the pipeline's
/// `Context` so this crate has no dependency on `mcpay-pipeline`.
pub struct SignContext<'a> {
    pub user: Option<&'a User>,
    pub requirement: &'a PaymentRequirement,
    pub is_test_mode: bool,
    /// `true` when the caller presented the managed-wallet header pair
    /// (`x-wallet-provider=coinbase-cdp`, `x-wallet-type=managed`), one of
    /// the two auto-sign eligibility conditions in spec.md §4.7 `S_paid_challenge`.
    pub managed_wallet_headers_present: bool,
}

#[derive(Debug, Clone)]
pub struct SignOutcome {
    pub ok: bool,
    pub header: Option<String>,
    pub wallet_address: Option<String>,
    pub error: Option<String>,
}

impl SignOutcome {
    pub fn success(header: String, wallet_address: String) -> Self {
        Self {
            ok: true,
            header: Some(header),
            wallet_address: Some(wallet_address),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            header: None,
            wallet_address: None,
            error: Some(error.into()),
        }
    }
}

/// Raised when auto-sign exhausts every strategy and `PaymentStrategyConfig::fallback`
/// is `Fail` — distinct from `Continue`/`LogOnly`, which both resolve to a normal
/// `SignOutcome::failure` that the caller turns into the standard 402 (spec.md §4.8).
#[derive(Debug, thiserror::Error)]
pub enum SignerRegistryError {
    #[error("auto-sign failed and fallback behavior is 'fail': {0}")]
    Failed(String),
}

#[async_trait::async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Higher runs first. The test strategy uses 1000 to win over
    /// production strategies in test mode (spec.md §4.8).
    fn priority(&self) -> i32;

    async fn can_sign(&self, ctx: &SignContext<'_>) -> bool;

    async fn sign_payment(&self, ctx: &SignContext<'_>) -> SignOutcome;
}

/// Ordered set of strategies with registry-owned retry/timeout/fallback
/// policy (spec.md §4.8, §5).
pub struct SignerRegistry {
    strategies: Vec<Arc<dyn Strategy>>,
    config: PaymentStrategyConfig,
}

impl SignerRegistry {
    pub fn new(mut strategies: Vec<Arc<dyn Strategy>>, config: PaymentStrategyConfig) -> Self {
        strategies.sort_by(|a, b| b.priority().cmp(&a.priority()));
        Self { strategies, config }
    }

    /// Attempts to produce an `X-PAYMENT` header on the caller's behalf.
    /// Wrapped in the registry's overall deadline; individual strategies are
    /// retried with linear backoff before moving to the next strategy.
    ///
    /// When every strategy is exhausted without success, `continue`/`log_only`
    /// both return `Ok(SignOutcome::failure(..))` — the caller falls through to
    /// the standard `S_need_header` 402. `fail` instead returns `Err`, since
    /// spec.md §4.8 treats it as a behavior that raises rather than degrades.
    pub async fn try_sign(&self, ctx: &SignContext<'_>) -> Result<SignOutcome, SignerRegistryError> {
        if !self.config.enabled {
            return Ok(SignOutcome::failure("auto-sign disabled"));
        }

        let deadline = Duration::from_millis(self.config.timeout_ms);
        let outcome = match tokio::time::timeout(deadline, self.try_all_strategies(ctx)).await {
            Ok(outcome) => outcome,
            Err(_) => SignOutcome::failure("timeout"),
        };

        if !outcome.ok && self.config.fallback == FallbackBehavior::Fail {
            let reason = outcome.error.unwrap_or_else(|| "all strategies failed".to_string());
            return Err(SignerRegistryError::Failed(reason));
        }
        Ok(outcome)
    }

    async fn try_all_strategies(&self, ctx: &SignContext<'_>) -> SignOutcome {
        for strategy in &self.strategies {
            if !strategy.can_sign(ctx).await {
                continue; // canSign=false strategies are skipped with no retries.
            }

            let mut last_error = String::new();
            for attempt in 1..=self.config.max_retries.max(1) {
                let outcome = strategy.sign_payment(ctx).await;
                if outcome.ok {
                    return outcome;
                }
                last_error = outcome.error.unwrap_or_default();
                tracing::warn!(
                    strategy = strategy.name(),
                    attempt,
                    error = %last_error,
                    "auto-sign attempt failed"
                );
                if attempt < self.config.max_retries.max(1) {
                    tokio::time::sleep(Duration::from_millis(attempt as u64 * 1000)).await;
                }
            }
            tracing::warn!(strategy = strategy.name(), "auto-sign strategy exhausted retries, trying next");
            let _ = last_error;
        }
        SignOutcome::failure("all strategies failed")
    }
}

/// Looks up custodial wallets for `user`, preferring gas-sponsored "smart"
/// accounts, and materializes an `X-PAYMENT` header via the x402 payload
/// shape. The actual on-chain signing math is delegated to an opaque signer
/// (spec.md §1 Non-goals: "on-chain transaction construction"); this
/// strategy's contract is to pick a wallet and hand back a well-formed
/// header, matching spec.md §4.8's managed-wallet strategy contract.
pub struct ManagedWalletStrategy {
    catalog: Arc<dyn CatalogRepository>,
}

impl ManagedWalletStrategy {
    pub fn new(catalog: Arc<dyn CatalogRepository>) -> Self {
        Self { catalog }
    }

    fn pick_wallet(wallets: &[Wallet], network: &str) -> Option<&Wallet> {
        let candidates: Vec<&Wallet> = wallets.iter().filter(|w| w.network == network).collect();
        candidates
            .iter()
            .find(|w| w.is_smart_account)
            .or_else(|| candidates.first())
            .copied()
    }
}

#[async_trait::async_trait]
impl Strategy for ManagedWalletStrategy {
    fn name(&self) -> &str {
        "managed-wallet"
    }

    fn priority(&self) -> i32 {
        100
    }

    async fn can_sign(&self, ctx: &SignContext<'_>) -> bool {
        ctx.user.is_some()
    }

    async fn sign_payment(&self, ctx: &SignContext<'_>) -> SignOutcome {
        let Some(user) = ctx.user else {
            return SignOutcome::failure("no authenticated user");
        };
        let wallets = self.catalog.get_user_wallets(&user.id, true).await;
        let Some(wallet) = Self::pick_wallet(&wallets, &ctx.requirement.network) else {
            return SignOutcome::failure("no managed wallet for network");
        };
        let payload = mcpay_x402::PaymentPayload {
            x402_version: mcpay_x402::X402_VERSION,
            scheme: ctx.requirement.scheme.clone(),
            network: ctx.requirement.network.clone(),
            payload: mcpay_x402::ExactPayload {
                signature: format!("managed:{}", wallet.address),
                authorization: mcpay_x402::ExactAuthorization {
                    from: wallet.address.clone(),
                    to: ctx.requirement.pay_to.clone(),
                    value: ctx.requirement.max_amount_required.clone(),
                    valid_after: "0".to_string(),
                    valid_before: "9999999999".to_string(),
                    nonce: wallet.address.clone(),
                },
            },
        };
        match payload.encode_header() {
            Ok(header) => SignOutcome::success(header, wallet.address.clone()),
            Err(e) => SignOutcome::failure(e.to_string()),
        }
    }
}

/// Active only in test mode; signs with a fixed process-wide test key for
/// EVM test networks. Priority 1000 so it wins over production strategies
/// when both are registered in test mode (spec.md §4.8, §8 E4).
pub struct TestStrategy {
    test_address: String,
}

impl TestStrategy {
    pub fn new() -> Self {
        Self {
            test_address: "0x000000000000000000000000000000000000test".to_string(),
        }
    }
}

impl Default for TestStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Strategy for TestStrategy {
    fn name(&self) -> &str {
        "test-strategy"
    }

    fn priority(&self) -> i32 {
        1000
    }

    async fn can_sign(&self, ctx: &SignContext<'_>) -> bool {
        ctx.is_test_mode
    }

    async fn sign_payment(&self, ctx: &SignContext<'_>) -> SignOutcome {
        let payload = mcpay_x402::PaymentPayload {
            x402_version: mcpay_x402::X402_VERSION,
            scheme: ctx.requirement.scheme.clone(),
            network: ctx.requirement.network.clone(),
            payload: mcpay_x402::ExactPayload {
                signature: format!("test:{}", uuid::Uuid::new_v4()),
                authorization: mcpay_x402::ExactAuthorization {
                    from: self.test_address.clone(),
                    to: ctx.requirement.pay_to.clone(),
                    value: ctx.requirement.max_amount_required.clone(),
                    valid_after: "0".to_string(),
                    valid_before: "9999999999".to_string(),
                    nonce: uuid::Uuid::new_v4().to_string(),
                },
            },
        };
        match payload.encode_header() {
            Ok(header) => SignOutcome::success(header, self.test_address.clone()),
            Err(e) => SignOutcome::failure(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpay_core::FallbackBehavior;

    fn requirement() -> PaymentRequirement {
        PaymentRequirement {
            scheme: "exact".into(),
            network: "base-sepolia".into(),
            max_amount_required: "0.01".into(),
            resource: "mcpay://myTool".into(),
            description: "Execution of myTool".into(),
            mime_type: "".into(),
            pay_to: "0xpayee".into(),
            max_timeout_seconds: 60,
            asset: "0xasset".into(),
            output_schema: None,
            extra: None,
        }
    }

    #[tokio::test]
    async fn test_strategy_wins_priority_in_test_mode() {
        let registry = SignerRegistry::new(
            vec![Arc::new(TestStrategy::new())],
            PaymentStrategyConfig {
                enabled: true,
                fallback: FallbackBehavior::Continue,
                max_retries: 3,
                timeout_ms: 5_000,
            },
        );
        let req = requirement();
        let ctx = SignContext {
            user: None,
            requirement: &req,
            is_test_mode: true,
            managed_wallet_headers_present: false,
        };
        let outcome = registry.try_sign(&ctx).await.unwrap();
        assert!(outcome.ok);
        assert!(outcome.header.is_some());
    }

    #[tokio::test]
    async fn strategy_skipped_when_not_in_test_mode() {
        let registry = SignerRegistry::new(
            vec![Arc::new(TestStrategy::new())],
            PaymentStrategyConfig {
                enabled: true,
                fallback: FallbackBehavior::Continue,
                max_retries: 1,
                timeout_ms: 5_000,
            },
        );
        let req = requirement();
        let ctx = SignContext {
            user: None,
            requirement: &req,
            is_test_mode: false,
            managed_wallet_headers_present: false,
        };
        let outcome = registry.try_sign(&ctx).await.unwrap();
        assert!(!outcome.ok);
    }

    #[tokio::test]
    async fn disabled_registry_is_a_no_op() {
        let registry = SignerRegistry::new(
            vec![Arc::new(TestStrategy::new())],
            PaymentStrategyConfig {
                enabled: false,
                fallback: FallbackBehavior::Continue,
                max_retries: 3,
                timeout_ms: 5_000,
            },
        );
        let req = requirement();
        let ctx = SignContext {
            user: None,
            requirement: &req,
            is_test_mode: true,
            managed_wallet_headers_present: false,
        };
        let outcome = registry.try_sign(&ctx).await.unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.error.as_deref(), Some("auto-sign disabled"));
    }

    #[tokio::test]
    async fn fallback_fail_raises_instead_of_returning_failure_outcome() {
        let registry = SignerRegistry::new(
            vec![],
            PaymentStrategyConfig {
                enabled: true,
                fallback: FallbackBehavior::Fail,
                max_retries: 1,
                timeout_ms: 5_000,
            },
        );
        let req = requirement();
        let ctx = SignContext {
            user: None,
            requirement: &req,
            is_test_mode: false,
            managed_wallet_headers_present: false,
        };
        let err = registry.try_sign(&ctx).await.unwrap_err();
        assert!(matches!(err, SignerRegistryError::Failed(_)));
    }

    #[tokio::test]
    async fn fallback_continue_does_not_raise_on_exhaustion() {
        let registry = SignerRegistry::new(
            vec![],
            PaymentStrategyConfig {
                enabled: true,
                fallback: FallbackBehavior::Continue,
                max_retries: 1,
                timeout_ms: 5_000,
            },
        );
        let req = requirement();
        let ctx = SignContext {
            user: None,
            requirement: &req,
            is_test_mode: false,
            managed_wallet_headers_present: false,
        };
        let outcome = registry.try_sign(&ctx).await.unwrap();
        assert!(!outcome.ok);
    }
}

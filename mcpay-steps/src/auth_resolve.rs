//! Auth Resolver step (spec.md §4.2).

use std::sync::Arc;

use async_trait::async_trait;
use mcpay_catalog::CatalogRepository;
use mcpay_core::AuthMethod;
use mcpay_pipeline::{Context, Step, StepOutcome};
use sha2::{Digest, Sha256};

/// A session-cookie validator delegated to an external auth provider.
/// spec.md §1 Non-goals: "authentication token issuance" — this trait only
/// validates a cookie value the provider already issued.
#[async_trait]
pub trait SessionValidator: Send + Sync {
    async fn validate(&self, cookie_value: &str) -> Option<String>;
}

/// A validator with no external provider configured; every cookie fails
/// validation. Used when the deployment has no session auth configured.
pub struct NoSessionValidator;

#[async_trait]
impl SessionValidator for NoSessionValidator {
    async fn validate(&self, _cookie_value: &str) -> Option<String> {
        None
    }
}

pub struct AuthResolveStep {
    catalog: Arc<dyn CatalogRepository>,
    session_validator: Arc<dyn SessionValidator>,
}

impl AuthResolveStep {
    pub fn new(catalog: Arc<dyn CatalogRepository>, session_validator: Arc<dyn SessionValidator>) -> Self {
        Self {
            catalog,
            session_validator,
        }
    }
}

fn hash_api_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("{digest:x}")
}

fn extract_api_key(ctx: &Context) -> Option<String> {
    if let Some(key) = ctx.get_header("x-api-key") {
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }
    if let Some(auth) = ctx.get_header("authorization") {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    if let Some(from_query) = query_param(&ctx.query, "api_key") {
        return Some(from_query);
    }
    if let Some(from_body) = body_api_key(&ctx.request_body) {
        return Some(from_body);
    }
    None
}

fn body_api_key(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let key = value.get("api_key")?.as_str()?;
    (!key.is_empty()).then(|| key.to_string())
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let mut parts = pair.splitn(2, '=');
        let k = parts.next()?;
        let v = parts.next().unwrap_or("");
        if k == name && !v.is_empty() {
            Some(v.to_string())
        } else {
            None
        }
    })
}

fn cookie_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("cookie"))
        .and_then(|(_, v)| {
            v.split(';').find_map(|kv| {
                let mut parts = kv.trim().splitn(2, '=');
                let k = parts.next()?;
                let val = parts.next()?;
                (k == name).then_some(val)
            })
        })
}

/// Blockchain inferred heuristically from address shape (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferredChain {
    Evm,
    Solana,
    Near,
    Unknown,
}

pub fn infer_chain(address: &str) -> InferredChain {
    if address.len() == 42 && address.starts_with("0x") {
        InferredChain::Evm
    } else if address.len() == 44 && !address.starts_with("0x") {
        InferredChain::Solana
    } else if address.len() == 64 || address.ends_with(".near") {
        InferredChain::Near
    } else {
        InferredChain::Unknown
    }
}

impl InferredChain {
    pub fn as_str(&self) -> &'static str {
        match self {
            InferredChain::Evm => "evm",
            InferredChain::Solana => "solana",
            InferredChain::Near => "near",
            InferredChain::Unknown => "unknown",
        }
    }
}

#[async_trait]
impl Step for AuthResolveStep {
    fn name(&self) -> &'static str {
        "auth-resolve"
    }

    async fn run(&self, ctx: &mut Context) -> StepOutcome {
        // Any failure here yields (none, nil) — never raises (spec.md §4.2).
        if let Some(api_key) = extract_api_key(ctx) {
            let hash = hash_api_key(&api_key);
            if let Some(user) = self.catalog.get_user_by_api_key_hash(&hash).await {
                self.catalog.stamp_last_used(&user.id).await;
                ctx.user = Some(user);
                ctx.auth_method = AuthMethod::ApiKey;
                return StepOutcome::Continue;
            }
        }

        if let Some(session_cookie) = cookie_value(&ctx.request_headers, "session") {
            if let Some(user_id) = self.session_validator.validate(session_cookie).await {
                if let Some(user) = self.catalog.get_user_by_id(&user_id).await {
                    self.catalog.stamp_last_used(&user.id).await;
                    ctx.user = Some(user);
                    ctx.auth_method = AuthMethod::Session;
                    return StepOutcome::Continue;
                }
            }
        }

        if let Some(wallet) = ctx.get_header("x-wallet-address") {
            let wallet = wallet.to_string();
            let chain = infer_chain(&wallet);
            let user = self.catalog.get_or_create_user_by_wallet(&wallet, chain.as_str()).await;
            ctx.user = Some(user);
            ctx.auth_method = AuthMethod::WalletHeader;
            return StepOutcome::Continue;
        }

        ctx.auth_method = AuthMethod::None;
        StepOutcome::Continue
    }
}

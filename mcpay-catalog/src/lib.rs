//! The catalog repository trait and an in-memory reference implementation.
//!
//! spec.md §6 names the repository's operations but treats its storage as an
//! external collaborator; this mirrors the teacher's `ConfigCache`
//! (`ando-store/src/cache.rs`) — a `DashMap`-backed, value-owned cache that
//! stands in for a real database-backed implementation in tests and small
//! deployments.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use mcpay_core::{PaymentRecord, RegisteredServer, Tool, UsageEvent, User};

/// A custodial wallet owned by a [`User`], as consumed by the managed-wallet
/// auto-sign strategy (spec.md §4.8).
#[derive(Debug, Clone)]
pub struct Wallet {
    pub address: String,
    pub network: String,
    /// Whether this wallet is eligible for auto-sign at all; `get_user_wallets`'s
    /// `active_only` filters on this, independent of `is_smart_account`.
    pub active: bool,
    /// Gas-sponsored managed account; strategies prefer these among active wallets.
    pub is_smart_account: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("not found: {0}")]
    NotFound(String),
}

/// The operations the pipeline consumes from persistent storage (spec.md §6).
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn get_server_by_id(&self, server_id: &str) -> Option<RegisteredServer>;
    async fn list_tools_by_server(&self, server_id: &str) -> Vec<Tool>;
    async fn get_user_by_api_key_hash(&self, hash: &str) -> Option<User>;
    async fn get_user_by_id(&self, user_id: &str) -> Option<User>;
    async fn get_or_create_user_by_wallet(&self, address: &str, chain: &str) -> User;
    async fn get_user_wallets(&self, user_id: &str, active_only: bool) -> Vec<Wallet>;
    async fn create_payment(&self, record: PaymentRecord) -> Result<(), CatalogError>;
    async fn get_payment_by_signature(&self, signature: &str) -> Option<PaymentRecord>;
    async fn record_tool_usage(&self, event: UsageEvent) -> Result<(), CatalogError>;
    /// Best-effort stamping on successful API-key/session resolution
    /// (spec.md §4.2); failures here must never fail the request.
    async fn stamp_last_used(&self, user_id: &str);
}

/// Reference implementation with no external storage, used by tests and
/// standalone deployments. Swapping in a database-backed implementation is a
/// Non-goal of the core; only this trait boundary is.
pub struct InMemoryCatalog {
    servers: DashMap<String, RegisteredServer>,
    tools: DashMap<String, Vec<Tool>>,
    users: DashMap<String, User>,
    api_key_index: DashMap<String, String>,
    wallet_index: DashMap<String, String>,
    wallets: DashMap<String, Vec<Wallet>>,
    payments_by_signature: DashMap<String, PaymentRecord>,
    usage_events: DashMap<u64, UsageEvent>,
    usage_seq: AtomicU64,
}

impl InMemoryCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            servers: DashMap::new(),
            tools: DashMap::new(),
            users: DashMap::new(),
            api_key_index: DashMap::new(),
            wallet_index: DashMap::new(),
            wallets: DashMap::new(),
            payments_by_signature: DashMap::new(),
            usage_events: DashMap::new(),
            usage_seq: AtomicU64::new(0),
        })
    }

    pub fn seed_server(&self, server: RegisteredServer, tools: Vec<Tool>) {
        self.tools.insert(server.server_id.clone(), tools);
        self.servers.insert(server.server_id.clone(), server);
    }

    pub fn seed_user(&self, user: User, api_key_hash: Option<&str>) {
        if let Some(hash) = api_key_hash {
            self.api_key_index.insert(hash.to_string(), user.id.clone());
        }
        self.users.insert(user.id.clone(), user);
    }

    pub fn seed_wallets(&self, user_id: &str, wallets: Vec<Wallet>) {
        self.wallets.insert(user_id.to_string(), wallets);
    }

    pub fn payment_count(&self) -> usize {
        self.payments_by_signature.len()
    }

    pub fn usage_event_count(&self) -> usize {
        self.usage_events.len()
    }
}

#[async_trait]
impl CatalogRepository for InMemoryCatalog {
    async fn get_server_by_id(&self, server_id: &str) -> Option<RegisteredServer> {
        self.servers.get(server_id).map(|e| e.clone())
    }

    async fn list_tools_by_server(&self, server_id: &str) -> Vec<Tool> {
        self.tools.get(server_id).map(|e| e.clone()).unwrap_or_default()
    }

    async fn get_user_by_api_key_hash(&self, hash: &str) -> Option<User> {
        let user_id = self.api_key_index.get(hash)?.clone();
        self.users.get(&user_id).map(|e| e.clone())
    }

    async fn get_user_by_id(&self, user_id: &str) -> Option<User> {
        self.users.get(user_id).map(|e| e.clone())
    }

    async fn get_or_create_user_by_wallet(&self, address: &str, chain: &str) -> User {
        if let Some(user_id) = self.wallet_index.get(address) {
            if let Some(user) = self.users.get(user_id.as_str()) {
                return user.clone();
            }
        }
        let id = format!("wallet-{address}");
        let user = User {
            id: id.clone(),
            email: None,
            display_name: None,
            primary_wallet_address: Some(address.to_string()),
            primary_wallet_chain: Some(chain.to_string()),
        };
        self.wallet_index.insert(address.to_string(), id.clone());
        self.users.insert(id, user.clone());
        user
    }

    async fn get_user_wallets(&self, user_id: &str, active_only: bool) -> Vec<Wallet> {
        let wallets = self.wallets.get(user_id).map(|e| e.clone()).unwrap_or_default();
        if active_only {
            wallets.into_iter().filter(|w| w.active).collect()
        } else {
            wallets
        }
    }

    async fn create_payment(&self, record: PaymentRecord) -> Result<(), CatalogError> {
        // Idempotent on signature uniqueness (spec.md §3, §4.7, §5, testable property 7).
        self.payments_by_signature
            .entry(record.signature.clone())
            .or_insert(record);
        Ok(())
    }

    async fn get_payment_by_signature(&self, signature: &str) -> Option<PaymentRecord> {
        self.payments_by_signature.get(signature).map(|e| e.clone())
    }

    async fn record_tool_usage(&self, event: UsageEvent) -> Result<(), CatalogError> {
        let seq = self.usage_seq.fetch_add(1, Ordering::Relaxed);
        self.usage_events.insert(seq, event);
        Ok(())
    }

    async fn stamp_last_used(&self, _user_id: &str) {
        // Best-effort; no last-login/last-used columns to update in-memory.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpay_core::ServerStatus;

    fn server(id: &str) -> RegisteredServer {
        RegisteredServer {
            server_id: id.to_string(),
            origin_url: "https://up.example".into(),
            receiver_address: "0xpayee".into(),
            auth_headers: Default::default(),
            status: ServerStatus::Active,
        }
    }

    #[tokio::test]
    async fn seeded_server_is_resolvable() {
        let catalog = InMemoryCatalog::new();
        catalog.seed_server(server("SRV"), vec![]);
        let resolved = catalog.get_server_by_id("SRV").await.unwrap();
        assert_eq!(resolved.origin_url, "https://up.example");
    }

    #[tokio::test]
    async fn payment_creation_is_idempotent_on_signature() {
        let catalog = InMemoryCatalog::new();
        let record = PaymentRecord {
            tool_id: "t1".into(),
            user_id: None,
            amount_raw: "10000".into(),
            token_decimals: 6,
            asset_address: "0xasset".into(),
            network: mcpay_core::Network::Base,
            status: mcpay_core::PaymentStatus::Pending,
            signature: "sig-1".into(),
            payer_address: Some("0xpayer".into()),
        };
        catalog.create_payment(record.clone()).await.unwrap();
        catalog.create_payment(record).await.unwrap();
        assert_eq!(catalog.payment_count(), 1);
    }

    #[tokio::test]
    async fn wallet_by_address_creates_user_once() {
        let catalog = InMemoryCatalog::new();
        let first = catalog.get_or_create_user_by_wallet("0xabc", "evm").await;
        let second = catalog.get_or_create_user_by_wallet("0xabc", "evm").await;
        assert_eq!(first.id, second.id);
        assert_eq!(first.primary_wallet_chain.as_deref(), Some("evm"));
    }

    #[tokio::test]
    async fn active_only_filters_to_active_wallets() {
        let catalog = InMemoryCatalog::new();
        catalog.seed_wallets(
            "u1",
            vec![
                Wallet { address: "0x1".into(), network: "base".into(), active: false, is_smart_account: false },
                Wallet { address: "0x2".into(), network: "base".into(), active: true, is_smart_account: false },
            ],
        );
        let active = catalog.get_user_wallets("u1", true).await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].address, "0x2");
    }

    #[tokio::test]
    async fn pick_wallet_prefers_smart_account_among_active() {
        let catalog = InMemoryCatalog::new();
        catalog.seed_wallets(
            "u1",
            vec![
                Wallet { address: "0x1".into(), network: "base".into(), active: true, is_smart_account: false },
                Wallet { address: "0x2".into(), network: "base".into(), active: true, is_smart_account: true },
            ],
        );
        let active = catalog.get_user_wallets("u1", true).await;
        assert_eq!(active.len(), 2);
        assert!(active.iter().any(|w| w.address == "0x1"));
    }
}

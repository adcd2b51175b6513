//! Request-independent data model: catalog entries, identities, ledger rows.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A payment network x402 knows how to settle on.
///
/// Kept as an enum rather than a bare string, mirroring the gateway's
/// preference for closed enums over stringly-typed route fields, with an
/// escape hatch for networks added to the facilitator before this crate
/// catches up.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Network {
    Base,
    BaseSepolia,
    SeiTestnet,
    Other(String),
}

impl Serialize for Network {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Network {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Network::from(s.as_str()))
    }
}

impl Network {
    pub fn as_str(&self) -> &str {
        match self {
            Network::Base => "base",
            Network::BaseSepolia => "base-sepolia",
            Network::SeiTestnet => "sei-testnet",
            Network::Other(s) => s.as_str(),
        }
    }

    /// `base` wins pricing tie-breaks (spec §3, §4.3, §8.6).
    pub fn is_preferred(&self) -> bool {
        matches!(self, Network::Base)
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Network {
    fn from(s: &str) -> Self {
        match s {
            "base" => Network::Base,
            "base-sepolia" => Network::BaseSepolia,
            "sei-testnet" => Network::SeiTestnet,
            other => Network::Other(other.to_string()),
        }
    }
}

/// Lifecycle status of a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Active,
    Disabled,
}

/// A catalog entry for one upstream MCP server.
///
/// Invariant: `origin_url` is an absolute URL with a resolvable host; the
/// catalog repository is responsible for enforcing this at write time, the
/// proxy only ever reads it back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredServer {
    pub server_id: String,
    pub origin_url: String,
    pub receiver_address: String,
    #[serde(default)]
    pub auth_headers: HashMap<String, String>,
    pub status: ServerStatus,
}

/// One tool exposed by a registered server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub tool_id: String,
    pub server_id: String,
    pub name: String,
    #[serde(default)]
    pub input_schema: serde_json::Value,
    #[serde(default)]
    pub pricing: Vec<PricingEntry>,
}

/// One priced offer for invoking a tool on a given network.
///
/// Invariant: at most one row per `(tool, network)` is considered active;
/// when several are active the tie-break in [`pick_active_pricing`] applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingEntry {
    pub asset_address: String,
    pub network: Network,
    /// Smallest-unit integer amount, carried as a decimal string so it
    /// never round-trips through a float.
    pub max_amount_required_raw: String,
    pub token_decimals: u32,
    pub active: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Picks the active pricing row for a tool, preferring `base`, otherwise the
/// first active row in insertion order (spec.md §3, §4.3, testable property 6).
pub fn pick_active_pricing(pricing: &[PricingEntry]) -> Option<&PricingEntry> {
    let active: Vec<&PricingEntry> = pricing.iter().filter(|p| p.active).collect();
    if let Some(base) = active.iter().find(|p| p.network.is_preferred()) {
        return Some(base);
    }
    active.into_iter().next()
}

/// A resolved caller identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub primary_wallet_address: Option<String>,
    /// Chain inferred from `primary_wallet_address`'s shape (spec.md §4.2), e.g. "evm"/"solana"/"near".
    pub primary_wallet_chain: Option<String>,
}

/// How a request's identity was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    ApiKey,
    Session,
    WalletHeader,
    None,
}

/// The request-scoped interpretation of a `tools/call` JSON-RPC body.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    pub args: serde_json::Value,
    pub is_paid: bool,
    pub pay_to: Option<String>,
    pub pricing: Option<PricingEntry>,
    pub server_id: String,
    pub tool_id: Option<String>,
}

/// Ledger status of a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Settled,
    Failed,
}

/// Written when a valid `X-PAYMENT` is first seen. Invariant: unique on
/// `signature` — a duplicate signature must not create a second row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub tool_id: String,
    pub user_id: Option<String>,
    pub amount_raw: String,
    pub token_decimals: u32,
    pub asset_address: String,
    pub network: Network,
    pub status: PaymentStatus,
    pub signature: String,
    pub payer_address: Option<String>,
}

/// Written post-response, regardless of outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub tool_id: Option<String>,
    pub user_id: Option<String>,
    pub response_status: u16,
    pub execution_time_ms: u64,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub request_snapshot: serde_json::Value,
    pub result_snapshot: Option<serde_json::Value>,
}

/// A cached upstream response. Value-owned by the cache map.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: bytes::Bytes,
    pub timestamp_ms: u64,
    pub ttl_ms: u64,
}

impl CacheEntry {
    pub fn is_live(&self, now_ms: u64) -> bool {
        now_ms <= self.timestamp_ms + self.ttl_ms
    }
}

/// Per-upstream-hostname rate-limit bucket state.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucket {
    pub tokens: f64,
    pub last_refill_ms: u64,
    pub last_request_ms: u64,
}

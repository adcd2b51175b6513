//! Facilitator HTTP client (spec.md §6).
//!
//! Grounded directly on `r402-http/src/server/facilitator_client.rs`: same
//! `try_new`/base-URL-plus-suffix construction, the same generic
//! `post_json`/`get_json` helpers, and the same error taxonomy, narrowed to
//! this gateway's three endpoints.

use std::time::Duration;

use mcpay_x402::{PaymentPayload, PaymentRequirement};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum FacilitatorClientError {
    #[error("invalid facilitator URL: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("facilitator HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("facilitator responded with status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("failed to deserialize facilitator response: {0}")]
    JsonDeserialization(serde_json::Error),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest<'a> {
    pub payment_payload: &'a PaymentPayload,
    pub payment_requirements: &'a PaymentRequirement,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub is_valid: bool,
    #[serde(default)]
    pub invalid_reason: Option<String>,
    #[serde(default)]
    pub payer: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleRequest<'a> {
    pub payment_payload: &'a PaymentPayload,
    pub payment_requirements: &'a PaymentRequirement,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    #[serde(default)]
    pub error_reason: Option<String>,
    #[serde(default)]
    pub payer: Option<String>,
    #[serde(default)]
    pub transaction: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupportedKind {
    pub x402_version: u32,
    pub scheme: String,
    pub network: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupportedResponse {
    pub kinds: Vec<SupportedKind>,
}

/// A thin HTTP client bound to one facilitator base URL. The payment gate
/// holds one instance per resolved network (`mcpay-core`'s
/// `FacilitatorConfig::url_for` picks the base URL).
#[derive(Debug, Clone)]
pub struct FacilitatorClient {
    verify_url: Url,
    settle_url: Url,
    supported_url: Url,
    client: reqwest::Client,
}

impl FacilitatorClient {
    pub fn try_new(base_url: &str, timeout: Duration) -> Result<Self, FacilitatorClientError> {
        // `Url::join` treats a non-"/"-terminated path as a file name and
        // replaces its last segment rather than extending it, so
        // "https://x402.org/facilitator".join("verify") silently drops
        // "facilitator". Force a trailing slash before joining.
        let base = format!("{}/", base_url.trim_end_matches('/'));
        let base = Url::parse(&base)?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            verify_url: base.join("verify")?,
            settle_url: base.join("settle")?,
            supported_url: base.join("supported")?,
            client,
        })
    }

    async fn post_json<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        url: &Url,
        body: &Req,
    ) -> Result<Resp, FacilitatorClientError> {
        let response = self.client.post(url.clone()).json(body).send().await?;
        Self::decode(response).await
    }

    async fn get_json<Resp: for<'de> Deserialize<'de>>(
        &self,
        url: &Url,
    ) -> Result<Resp, FacilitatorClientError> {
        let response = self.client.get(url.clone()).send().await?;
        Self::decode(response).await
    }

    async fn decode<Resp: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<Resp, FacilitatorClientError> {
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(FacilitatorClientError::HttpStatus {
                status: status.as_u16(),
                body: text,
            });
        }
        serde_json::from_str(&text).map_err(FacilitatorClientError::JsonDeserialization)
    }

    /// `POST /verify` (spec.md §4.7 `S_verify`, §6).
    pub async fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirement,
    ) -> Result<VerifyResponse, FacilitatorClientError> {
        let request = VerifyRequest {
            payment_payload: payload,
            payment_requirements: requirements,
        };
        self.post_json(&self.verify_url, &request).await
    }

    /// `POST /settle`. Settlement advancement past `pending` is out of core
    /// scope (spec.md §9 open question); this method exists so a later
    /// settlement process can reuse the same client.
    pub async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirement,
    ) -> Result<SettleResponse, FacilitatorClientError> {
        let request = SettleRequest {
            payment_payload: payload,
            payment_requirements: requirements,
        };
        self.post_json(&self.settle_url, &request).await
    }

    /// `GET /supported`.
    pub async fn supported(&self) -> Result<SupportedResponse, FacilitatorClientError> {
        self.get_json(&self.supported_url).await
    }
}

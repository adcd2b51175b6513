//! Wire types for the x402 payment protocol (spec.md §6) and the
//! arbitrary-precision amount conversion spec.md §4.7/§9 require.
//!
//! Grounded on the pack's x402 SDK (`r402/src/proto/v1.rs`), narrowed from
//! that crate's generic `PaymentPayload<TScheme, TPayload>` /
//! `PaymentRequirements<TScheme, TAmount, TAddress, TExtra>` to the concrete
//! JSON shape this gateway's single scheme (`exact`) actually produces.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const X402_VERSION: u32 = 1;

/// A priced offer the gateway is willing to accept payment against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirement {
    pub scheme: String,
    pub network: String,
    pub max_amount_required: String,
    pub resource: String,
    pub description: String,
    pub mime_type: String,
    pub pay_to: String,
    pub max_timeout_seconds: u64,
    pub asset: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// Body of a 402 response (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    pub x402_version: u32,
    pub error: String,
    pub accepts: Vec<PaymentRequirement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
}

impl PaymentRequired {
    pub fn new(error: impl Into<String>, accepts: Vec<PaymentRequirement>) -> Self {
        Self {
            x402_version: X402_VERSION,
            error: error.into(),
            accepts,
            payer: None,
        }
    }

    pub fn with_payer(mut self, payer: impl Into<String>) -> Self {
        self.payer = Some(payer.into());
        self
    }
}

/// The `exact` scheme's on-chain authorization payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactAuthorization {
    pub from: String,
    pub to: String,
    pub value: String,
    pub valid_after: String,
    pub valid_before: String,
    pub nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactPayload {
    pub signature: String,
    pub authorization: ExactAuthorization,
}

/// The decoded contents of a client-supplied `X-PAYMENT` header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub x402_version: u32,
    pub scheme: String,
    pub network: String,
    pub payload: ExactPayload,
}

#[derive(Debug, Error)]
pub enum PaymentPayloadError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid payment payload JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl PaymentPayload {
    /// Decodes a raw `X-PAYMENT` header value (base64 JSON) into a payload.
    pub fn decode_header(raw: &str) -> Result<Self, PaymentPayloadError> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD.decode(raw.trim())?;
        let payload: PaymentPayload = serde_json::from_slice(&bytes)?;
        Ok(payload)
    }

    /// Encodes a payload back into the base64 form used on the wire. Used
    /// by signer strategies producing a header on the caller's behalf.
    pub fn encode_header(&self) -> Result<String, PaymentPayloadError> {
        use base64::Engine;
        let json = serde_json::to_vec(self)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }

    /// Signature used as the idempotence key for `PaymentRecord` (spec.md §3,
    /// §4.7 `S_forward`, testable property 7).
    pub fn signature(&self) -> &str {
        &self.payload.signature
    }
}

#[derive(Debug, Error)]
pub enum AmountError {
    #[error("invalid raw base-unit amount {0:?}")]
    InvalidRaw(String),
}

/// Converts a raw base-unit integer amount into its human-readable decimal
/// form using `tokenDecimals`, never touching a float (spec.md §4.7, §9,
/// testable property 4).
pub fn raw_to_human(raw: &str, token_decimals: u32) -> Result<String, AmountError> {
    let raw_int: i128 = raw
        .parse()
        .map_err(|_| AmountError::InvalidRaw(raw.to_string()))?;
    let scale = Decimal::from(10i128.pow(token_decimals.min(28)));
    let value = Decimal::from(raw_int) / scale;
    Ok(value.normalize().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_to_human_exact_no_float_drift() {
        // 10000 raw units at 6 decimals = 0.01, exactly.
        assert_eq!(raw_to_human("10000", 6).unwrap(), "0.01");
    }

    #[test]
    fn raw_to_human_handles_zero_decimals() {
        assert_eq!(raw_to_human("42", 0).unwrap(), "42");
    }

    #[test]
    fn raw_to_human_rejects_garbage() {
        assert!(raw_to_human("not-a-number", 6).is_err());
    }

    #[test]
    fn payment_payload_round_trips_through_header_encoding() {
        let payload = PaymentPayload {
            x402_version: X402_VERSION,
            scheme: "exact".into(),
            network: "base-sepolia".into(),
            payload: ExactPayload {
                signature: "0xsig".into(),
                authorization: ExactAuthorization {
                    from: "0xfrom".into(),
                    to: "0xto".into(),
                    value: "10000".into(),
                    valid_after: "0".into(),
                    valid_before: "9999999999".into(),
                    nonce: "0xnonce".into(),
                },
            },
        };
        let header = payload.encode_header().unwrap();
        let decoded = PaymentPayload::decode_header(&header).unwrap();
        assert_eq!(decoded.signature(), "0xsig");
        assert_eq!(decoded.network, "base-sepolia");
    }

    #[test]
    fn payment_required_body_matches_spec_shape() {
        let req = PaymentRequirement {
            scheme: "exact".into(),
            network: "base-sepolia".into(),
            max_amount_required: "0.01".into(),
            resource: "mcpay://myTool".into(),
            description: "Execution of myTool".into(),
            mime_type: "".into(),
            pay_to: "0xpayee".into(),
            max_timeout_seconds: 60,
            asset: "0x036C\u{2026}F7e".into(),
            output_schema: None,
            extra: None,
        };
        let body = PaymentRequired::new("X-PAYMENT header is required", vec![req]);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["x402Version"], 1);
        assert_eq!(json["accepts"][0]["network"], "base-sepolia");
        assert_eq!(json["accepts"][0]["maxAmountRequired"], "0.01");
    }
}

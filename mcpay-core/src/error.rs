use thiserror::Error;

/// Unified error type for the gateway.
///
/// Per spec.md §7, raising is reserved for programmer errors; every variant
/// here maps to a terminal HTTP response a step can hand back to the client
/// without the pipeline runner ever seeing a panic.
#[derive(Error, Debug)]
pub enum McpayError {
    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("no payment information available")]
    PaidUnready,

    #[error("X-PAYMENT header is required")]
    PaymentRequired,

    #[error("payment invalid: {0}")]
    PaymentInvalid(String),

    #[error("facilitator unavailable: {0}")]
    FacilitatorUnavailable(String),

    #[error("request body too large")]
    PayloadTooLarge,

    #[error("auth failed: {0}")]
    AuthFailed(String),

    #[error("catalog error: {0}")]
    CatalogError(String),

    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl McpayError {
    /// Map to HTTP status code per spec.md §7's error taxonomy.
    pub fn status_code(&self) -> u16 {
        match self {
            McpayError::ServerNotFound(_) => 404,
            McpayError::PaidUnready
            | McpayError::PaymentRequired
            | McpayError::PaymentInvalid(_)
            | McpayError::FacilitatorUnavailable(_) => 402,
            McpayError::PayloadTooLarge => 413,
            McpayError::AuthFailed(_) => 401,
            McpayError::UpstreamError(_) => 502,
            McpayError::CatalogError(_) => 500,
            McpayError::ConfigError(_) => 500,
            McpayError::Internal(_) | McpayError::Io(_) | McpayError::Serde(_) => 500,
        }
    }

    /// JSON error body shared by all non-402 terminal responses. The 402
    /// path has its own richer body (`accepts`, `payer`) built in
    /// `mcpay-steps`' payment gate, not here.
    pub fn to_json_body(&self) -> Vec<u8> {
        let status = self.status_code();
        let msg = self.to_string();
        serde_json::json!({ "error": msg, "status": status })
            .to_string()
            .into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(McpayError::ServerNotFound("x".into()).status_code(), 404);
        assert_eq!(McpayError::PaidUnready.status_code(), 402);
        assert_eq!(McpayError::PaymentRequired.status_code(), 402);
        assert_eq!(McpayError::PaymentInvalid("x".into()).status_code(), 402);
        assert_eq!(McpayError::FacilitatorUnavailable("x".into()).status_code(), 402);
        assert_eq!(McpayError::PayloadTooLarge.status_code(), 413);
        assert_eq!(McpayError::AuthFailed("x".into()).status_code(), 401);
        assert_eq!(McpayError::UpstreamError("x".into()).status_code(), 502);
    }

    #[test]
    fn json_body_is_valid_json_with_status_and_message() {
        let err = McpayError::ServerNotFound("srv-1".into());
        let parsed: serde_json::Value = serde_json::from_slice(&err.to_json_body()).unwrap();
        assert_eq!(parsed["status"], 404);
        assert!(parsed["error"].as_str().unwrap().contains("srv-1"));
    }
}

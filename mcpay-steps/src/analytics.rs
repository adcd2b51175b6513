//! Analytics Recorder step (spec.md §4.9, testable property 10): runs
//! regardless of upstream status and writes exactly one `UsageEvent`.

use std::sync::Arc;

use async_trait::async_trait;
use mcpay_catalog::CatalogRepository;
use mcpay_core::UsageEvent;
use mcpay_pipeline::{Context, Step, StepOutcome};

pub struct AnalyticsStep {
    catalog: Arc<dyn CatalogRepository>,
}

impl AnalyticsStep {
    pub fn new(catalog: Arc<dyn CatalogRepository>) -> Self {
        Self { catalog }
    }
}

/// Parses a captured body as JSON, falling back to `{"response": rawText}`
/// (spec.md §4.9).
fn snapshot_body(body: &[u8]) -> serde_json::Value {
    serde_json::from_slice::<serde_json::Value>(body)
        .unwrap_or_else(|_| serde_json::json!({ "response": String::from_utf8_lossy(body) }))
}

#[async_trait]
impl Step for AnalyticsStep {
    fn name(&self) -> &'static str {
        "analytics"
    }

    async fn run(&self, ctx: &mut Context) -> StepOutcome {
        let Some(response) = ctx.terminal_response.clone() else {
            return StepOutcome::Continue;
        };

        let result_snapshot = if ctx
            .upstream_response
            .as_ref()
            .is_some_and(|u| u.is_event_stream())
        {
            None
        } else {
            Some(snapshot_body(&response.body))
        };

        let request_snapshot = if ctx.request_body.is_empty() {
            serde_json::Value::Null
        } else {
            snapshot_body(&ctx.request_body)
        };

        let event = UsageEvent {
            tool_id: ctx.tool_call.as_ref().and_then(|t| t.tool_id.clone()),
            user_id: ctx.user.as_ref().map(|u| u.id.clone()),
            response_status: response.status,
            execution_time_ms: ctx.elapsed_ms(),
            ip_address: ctx.client_ip.clone(),
            user_agent: ctx.get_header("user-agent").map(str::to_string),
            request_snapshot,
            result_snapshot,
        };

        // Best-effort; analytics failures never surface to the caller (spec.md §4.1).
        if let Err(e) = self.catalog.record_tool_usage(event).await {
            tracing::warn!(error = %e, "failed to record usage event");
        }

        StepOutcome::Continue
    }
}

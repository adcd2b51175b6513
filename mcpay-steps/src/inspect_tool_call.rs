//! Tool-Call Inspector step (spec.md §4.3), folding in the Catalog Client's
//! `server-id` resolution (spec.md §2's Catalog Client component has no
//! separate canonical-order slot — it runs inline here, the same way the
//! teacher's route matching happens ahead of plugin execution).

use std::sync::Arc;

use async_trait::async_trait;
use mcpay_catalog::CatalogRepository;
use mcpay_core::{pick_active_pricing, ToolCall};
use mcpay_pipeline::{Context, Step, StepOutcome, TerminalResponse};

pub struct InspectToolCallStep {
    catalog: Arc<dyn CatalogRepository>,
}

impl InspectToolCallStep {
    pub fn new(catalog: Arc<dyn CatalogRepository>) -> Self {
        Self { catalog }
    }
}

/// Extracts `serverId` from `^/mcp/([^/]+)`.
pub fn parse_server_id(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/mcp/")?;
    let id = rest.split('/').next().unwrap_or("");
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

fn is_tools_call(body: &serde_json::Value) -> Option<(&str, serde_json::Value)> {
    if body.get("method")?.as_str()? != "tools/call" {
        return None;
    }
    let name = body.get("params")?.get("name")?.as_str()?;
    let args = body
        .get("params")
        .and_then(|p| p.get("arguments"))
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    Some((name, args))
}

#[async_trait]
impl Step for InspectToolCallStep {
    fn name(&self) -> &'static str {
        "inspect-tool-call"
    }

    async fn run(&self, ctx: &mut Context) -> StepOutcome {
        let Some(server_id) = parse_server_id(&ctx.path) else {
            return StepOutcome::Terminal(TerminalResponse::json(
                404,
                &serde_json::json!({ "error": "server not found" }),
            ));
        };

        let Some(server) = self.catalog.get_server_by_id(server_id).await else {
            return StepOutcome::Terminal(TerminalResponse::json(
                404,
                &serde_json::json!({ "error": "server not found" }),
            ));
        };

        ctx.server_id = Some(server_id.to_string());
        ctx.target_upstream = Some(server.origin_url.clone());

        let is_post_json = ctx.method.eq_ignore_ascii_case("POST")
            && ctx
                .get_header("content-type")
                .is_some_and(|ct| ct.contains("application/json"));

        if !is_post_json {
            return StepOutcome::Continue;
        }

        // Body parse failure never raises; the inspector degrades to a free
        // pass-through and lets the upstream complain (spec.md §7).
        let Ok(body) = serde_json::from_slice::<serde_json::Value>(&ctx.request_body) else {
            return StepOutcome::Continue;
        };

        let Some((name, args)) = is_tools_call(&body) else {
            return StepOutcome::Continue;
        };

        let tools = self.catalog.list_tools_by_server(server_id).await;
        let Some(tool) = tools.into_iter().find(|t| t.name == name) else {
            ctx.tool_call = Some(ToolCall {
                name: name.to_string(),
                args,
                is_paid: false,
                pay_to: None,
                pricing: None,
                server_id: server_id.to_string(),
                tool_id: None,
            });
            return StepOutcome::Continue;
        };

        let picked = pick_active_pricing(&tool.pricing).cloned();
        let is_paid = picked.is_some();
        ctx.tool_call = Some(ToolCall {
            name: name.to_string(),
            args,
            is_paid,
            pay_to: is_paid.then(|| server.receiver_address.clone()),
            pricing: picked,
            server_id: server_id.to_string(),
            tool_id: Some(tool.tool_id),
        });

        StepOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mcpay_catalog::InMemoryCatalog;
    use mcpay_core::{Network, PricingEntry, RegisteredServer, ServerStatus, Tool};

    fn server() -> RegisteredServer {
        RegisteredServer {
            server_id: "SRV".into(),
            origin_url: "https://up.example".into(),
            receiver_address: "0xpayee".into(),
            auth_headers: Default::default(),
            status: ServerStatus::Active,
        }
    }

    fn priced_tool() -> Tool {
        Tool {
            tool_id: "t1".into(),
            server_id: "SRV".into(),
            name: "myTool".into(),
            input_schema: serde_json::Value::Null,
            pricing: vec![PricingEntry {
                asset_address: "0xasset".into(),
                network: Network::BaseSepolia,
                max_amount_required_raw: "10000".into(),
                token_decimals: 6,
                active: true,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            }],
        }
    }

    fn ctx_for(method: &str, path: &str, body: serde_json::Value) -> Context {
        let bytes = Bytes::from(serde_json::to_vec(&body).unwrap());
        Context::new(
            method.into(),
            path.into(),
            "".into(),
            vec![("content-type".into(), "application/json".into())],
            bytes,
        )
    }

    #[tokio::test]
    async fn unknown_server_is_404() {
        let catalog = InMemoryCatalog::new();
        let step = InspectToolCallStep::new(catalog);
        let mut ctx = ctx_for("GET", "/mcp/NOPE", serde_json::Value::Null);
        match step.run(&mut ctx).await {
            StepOutcome::Terminal(resp) => assert_eq!(resp.status, 404),
            _ => panic!("expected terminal 404"),
        }
    }

    #[tokio::test]
    async fn paid_tool_sets_pricing_and_pay_to() {
        let catalog = InMemoryCatalog::new();
        catalog.seed_server(server(), vec![priced_tool()]);
        let step = InspectToolCallStep::new(catalog);
        let mut ctx = ctx_for(
            "POST",
            "/mcp/SRV",
            serde_json::json!({"jsonrpc":"2.0","method":"tools/call","params":{"name":"myTool","arguments":{}}}),
        );
        step.run(&mut ctx).await;
        let call = ctx.tool_call.unwrap();
        assert!(call.is_paid);
        assert_eq!(call.pay_to.as_deref(), Some("0xpayee"));
        assert_eq!(call.pricing.unwrap().network, Network::BaseSepolia);
    }

    #[tokio::test]
    async fn non_tools_call_method_passes_through_free() {
        let catalog = InMemoryCatalog::new();
        catalog.seed_server(server(), vec![priced_tool()]);
        let step = InspectToolCallStep::new(catalog);
        let mut ctx = ctx_for("POST", "/mcp/SRV", serde_json::json!({"jsonrpc":"2.0","method":"ping"}));
        step.run(&mut ctx).await;
        assert!(ctx.tool_call.is_none());
    }

    #[tokio::test]
    async fn malformed_json_body_degrades_to_pass_through() {
        let catalog = InMemoryCatalog::new();
        catalog.seed_server(server(), vec![]);
        let step = InspectToolCallStep::new(catalog);
        let mut ctx = Context::new(
            "POST".into(),
            "/mcp/SRV".into(),
            "".into(),
            vec![("content-type".into(), "application/json".into())],
            Bytes::from_static(b"not json"),
        );
        let outcome = step.run(&mut ctx).await;
        assert!(matches!(outcome, StepOutcome::Continue));
        assert!(ctx.tool_call.is_none());
    }

    #[test]
    fn parses_server_id_from_path() {
        assert_eq!(parse_server_id("/mcp/SRV/x"), Some("SRV"));
        assert_eq!(parse_server_id("/mcp/SRV"), Some("SRV"));
        assert_eq!(parse_server_id("/other"), None);
    }
}

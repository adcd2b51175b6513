//! Forwarder's dispatch half (spec.md §4.6, point 4): sends the prepared
//! request and captures the raw response. Non-2xx responses propagate
//! verbatim; there is no retry (spec.md §4.6, §7).

use async_trait::async_trait;
use mcpay_pipeline::{Context, Step, StepOutcome, TerminalResponse, UpstreamResponse};
use reqwest::Method;

pub struct UpstreamDispatchStep {
    client: reqwest::Client,
}

impl UpstreamDispatchStep {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Step for UpstreamDispatchStep {
    fn name(&self) -> &'static str {
        "upstream-dispatch"
    }

    async fn run(&self, ctx: &mut Context) -> StepOutcome {
        let Some(url) = ctx.target_upstream.clone() else {
            return StepOutcome::Terminal(TerminalResponse::json(
                502,
                &serde_json::json!({ "error": "no upstream resolved" }),
            ));
        };

        let method = Method::from_bytes(ctx.method.as_bytes()).unwrap_or(Method::GET);
        let mut request = self.client.request(method, &url);
        for (name, value) in &ctx.outbound_headers {
            request = request.header(name, value);
        }
        if !ctx.request_body.is_empty() {
            request = request.body(ctx.request_body.clone());
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                return StepOutcome::Terminal(TerminalResponse::json(
                    502,
                    &serde_json::json!({ "error": format!("upstream dispatch failed: {e}") }),
                ));
            }
        };

        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let body = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                return StepOutcome::Terminal(TerminalResponse::json(
                    502,
                    &serde_json::json!({ "error": format!("failed to read upstream body: {e}") }),
                ));
            }
        };

        let upstream = UpstreamResponse { status, headers: headers.clone(), body: body.clone() };
        ctx.upstream_response = Some(upstream);
        ctx.terminal_response = Some(TerminalResponse { status, headers, body });

        StepOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn forwards_and_captures_upstream_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let step = UpstreamDispatchStep::new(reqwest::Client::new());
        let mut ctx = Context::new("GET".into(), "/mcp/SRV/health".into(), "".into(), vec![], Bytes::new());
        ctx.target_upstream = Some(format!("{}/health", server.uri()));
        step.run(&mut ctx).await;

        assert_eq!(ctx.upstream_response.as_ref().unwrap().status, 200);
        assert_eq!(ctx.terminal_response.as_ref().unwrap().body, Bytes::from_static(b"ok"));
    }

    #[tokio::test]
    async fn non_2xx_propagates_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let step = UpstreamDispatchStep::new(reqwest::Client::new());
        let mut ctx = Context::new("GET".into(), "/mcp/SRV/broken".into(), "".into(), vec![], Bytes::new());
        ctx.target_upstream = Some(format!("{}/broken", server.uri()));
        step.run(&mut ctx).await;

        assert_eq!(ctx.terminal_response.as_ref().unwrap().status, 503);
    }

    #[tokio::test]
    async fn unresolved_upstream_is_a_502() {
        let step = UpstreamDispatchStep::new(reqwest::Client::new());
        let mut ctx = Context::new("GET".into(), "/mcp/SRV".into(), "".into(), vec![], Bytes::new());
        match step.run(&mut ctx).await {
            StepOutcome::Terminal(resp) => assert_eq!(resp.status, 502),
            _ => panic!("expected 502 terminal"),
        }
    }
}

//! Forwarder's request-side preparation (spec.md §4.6, points 1-3): URL
//! rewrite, header sanitation, body capture. Dispatch itself happens in
//! `upstream_dispatch.rs`; these two steps implement one contract split
//! across the canonical-order slot for `payment-gate` that must run between
//! them.

use async_trait::async_trait;
use mcpay_pipeline::{Context, Step, StepOutcome};
use url::Url;

use crate::header_filter::filter_headers;

pub struct ForwardPrepareStep;

/// Strips the `/mcp/<id>` prefix and appends what remains to the upstream's
/// base path (spec.md §4.6).
fn rewrite_path(client_path: &str, server_id: &str) -> String {
    let prefix = format!("/mcp/{server_id}");
    client_path.strip_prefix(&prefix).unwrap_or("").to_string()
}

/// Merges upstream query parameters over client ones — on key collision the
/// upstream's own value wins (spec.md §4.6, "merge upstream query parameters
/// over client ones").
fn merge_query(client_query: &str, upstream_query: &str) -> String {
    let mut merged: Vec<(String, String)> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for pair in upstream_query.split('&').filter(|p| !p.is_empty()) {
        let mut parts = pair.splitn(2, '=');
        let k = parts.next().unwrap_or("").to_string();
        let v = parts.next().unwrap_or("").to_string();
        seen.insert(k.clone());
        merged.push((k, v));
    }
    for pair in client_query.split('&').filter(|p| !p.is_empty()) {
        let mut parts = pair.splitn(2, '=');
        let k = parts.next().unwrap_or("").to_string();
        let v = parts.next().unwrap_or("").to_string();
        if !seen.contains(&k) {
            merged.push((k, v));
        }
    }

    merged
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

#[async_trait]
impl Step for ForwardPrepareStep {
    fn name(&self) -> &'static str {
        "forward-prepare"
    }

    async fn run(&self, ctx: &mut Context) -> StepOutcome {
        let Some(origin) = ctx.target_upstream.clone() else {
            return StepOutcome::Continue;
        };
        let Some(server_id) = ctx.server_id.clone() else {
            return StepOutcome::Continue;
        };

        let Ok(origin_url) = Url::parse(&origin) else {
            return StepOutcome::Continue;
        };

        let suffix = rewrite_path(&ctx.path, &server_id);
        let full_path = format!("{}{}", origin_url.path().trim_end_matches('/'), suffix);
        let query = merge_query(&ctx.query, origin_url.query().unwrap_or(""));

        let host_port = match (origin_url.host_str(), origin_url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        };
        let rewritten = if query.is_empty() {
            format!("{}://{}{}", origin_url.scheme(), host_port, full_path)
        } else {
            format!("{}://{}{}?{}", origin_url.scheme(), host_port, full_path, query)
        };
        ctx.target_upstream = Some(rewritten);

        let mut headers = filter_headers(&ctx.request_headers);
        if let Some(host) = origin_url.host_str() {
            headers.retain(|(k, _)| !k.eq_ignore_ascii_case("host"));
            let host_value = match origin_url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            headers.push(("host".to_string(), host_value));
        }
        ctx.outbound_headers = headers;

        StepOutcome::Continue
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  MCPay Gateway — x402-metered reverse proxy for MCP servers
//
//  Architecture: one Tokio runtime, two Axum listeners — a proxy
//  listener running the nine-step pipeline, and an admin listener
//  serving /metrics and /healthz.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use clap::Parser;
use mcpay_catalog::InMemoryCatalog;
use mcpay_core::McpayConfig;
use mcpay_observability::{MetricsCollector, VictoriaLogsExporter};
use mcpay_pipeline::{Context, PipelineRunner};
use mcpay_steps::{GatewayDeps, NoSessionValidator};
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "mcpay", version, about = "MCPay Gateway — x402-metered reverse proxy for MCP servers")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, used only when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Collaborators shared by every request across the proxy listener.
struct ProxyState {
    runner: PipelineRunner,
    metrics: Arc<MetricsCollector>,
    access_log: Arc<VictoriaLogsExporter>,
    node_id: String,
    body_cap_bytes: usize,
    /// Flips to `true` once graceful shutdown begins; raced against each
    /// in-flight pipeline run so a draining server cancels requests instead
    /// of letting them run to completion (spec.md §5).
    shutdown: tokio::sync::watch::Receiver<bool>,
}

/// Collaborators shared by the admin listener.
struct AdminState {
    metrics: Arc<MetricsCollector>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", &cli.log_level);
    }
    mcpay_observability::init_tracing();

    info!(version = env!("CARGO_PKG_VERSION"), "MCPay Gateway starting");

    let config = McpayConfig::load(cli.config.as_ref().and_then(|p| p.to_str()))?;
    info!(node_id = %config.node_id, test_mode = config.is_test_mode(), "configuration loaded");

    let catalog = InMemoryCatalog::new();
    let http_client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_millis(config.server.connect_timeout_ms))
        .timeout(std::time::Duration::from_millis(config.server.read_timeout_ms))
        .build()?;

    let metrics = Arc::new(MetricsCollector::new()?);
    let access_log = Arc::new(VictoriaLogsExporter::new(config.observability.victoria_logs.clone()));

    let body_cap_bytes = config.server.body_cap_bytes;
    let proxy_addr = config.server.http_addr;
    let admin_addr = config.server.admin_addr;
    let node_id = config.node_id.clone();

    let runner = mcpay_steps::build_pipeline(GatewayDeps {
        catalog,
        session_validator: Arc::new(NoSessionValidator),
        http_client,
        config,
        metrics: metrics.clone(),
    })?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let admin_shutdown = shutdown_rx.clone();

    let proxy_state = Arc::new(ProxyState {
        runner,
        metrics: metrics.clone(),
        access_log,
        node_id,
        body_cap_bytes,
        shutdown: shutdown_rx,
    });
    let admin_state = Arc::new(AdminState { metrics });

    let proxy_router = Router::new()
        .route("/{*path}", any(proxy_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(proxy_state);

    let admin_router = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(admin_state);

    let proxy_listener = TcpListener::bind(proxy_addr).await?;
    let admin_listener = TcpListener::bind(admin_addr).await?;
    info!(proxy_addr = %proxy_addr, admin_addr = %admin_addr, "MCPay Gateway is ready — serving traffic");

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let proxy_server = axum::serve(
        proxy_listener,
        proxy_router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_shutdown(admin_shutdown.clone()));

    let admin_server =
        axum::serve(admin_listener, admin_router).with_graceful_shutdown(wait_for_shutdown(admin_shutdown));

    let (proxy_result, admin_result) = tokio::join!(proxy_server, admin_server);
    proxy_result?;
    admin_result?;

    info!("MCPay Gateway stopped");
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.gather_text(),
    )
}

/// Converts an inbound HTTP request into a pipeline [`Context`], runs the
/// canonical nine-step pipeline, and converts the resulting
/// [`mcpay_pipeline::TerminalResponse`] back into an Axum response.
async fn proxy_handler(
    State(state): State<Arc<ProxyState>>,
    ConnectInfo(peer): ConnectInfo<std::net::SocketAddr>,
    req: Request<Body>,
) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let uri = req.uri().clone();
    let path = uri.path().to_string();
    let query = uri.query().unwrap_or("").to_string();
    let headers = flatten_headers(req.headers());

    let body_bytes = match axum::body::to_bytes(req.into_body(), state.body_cap_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "request body exceeded cap or failed to read");
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };

    let mut ctx = Context::new(method.clone(), path.clone(), query, headers, body_bytes);
    ctx.client_ip = Some(peer.ip().to_string());

    let ctx = state.runner.run_with_cancellation(ctx, Some(state.shutdown.clone())).await;
    let elapsed_secs = start.elapsed().as_secs_f64();

    let response = match ctx.terminal_response {
        Some(terminal) => terminal,
        None if ctx.cancelled => mcpay_pipeline::TerminalResponse::json(
            StatusCode::SERVICE_UNAVAILABLE.as_u16(),
            &serde_json::json!({ "error": "request cancelled: server is shutting down" }),
        ),
        None => {
            error!("pipeline completed with no terminal response");
            mcpay_pipeline::TerminalResponse::json(
                StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                &serde_json::json!({ "error": "no response produced" }),
            )
        }
    };

    state.metrics.record_request(&state.node_id, &method, response.status, elapsed_secs);
    state.access_log.access_log(
        &state.node_id,
        &method,
        &uri.to_string(),
        response.status,
        elapsed_secs * 1000.0,
        &peer.ip().to_string(),
        None,
    );

    let mut builder = Response::builder().status(response.status);
    for (name, value) in &response.headers {
        builder = builder.header(name, value);
    }
    builder.body(Body::from(response.body)).unwrap_or_else(|e| {
        error!(error = %e, "failed to build response from terminal response");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

fn flatten_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect()
}

/// Awaits the shared shutdown signal, used as both listeners'
/// `with_graceful_shutdown` future so the two servers drain together.
async fn wait_for_shutdown(mut rx: tokio::sync::watch::Receiver<bool>) {
    let _ = rx.wait_for(|signaled| *signaled).await;
}

/// Waits for SIGTERM (container stop) or Ctrl+C, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received, draining in-flight requests");
}

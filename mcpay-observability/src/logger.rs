//! VictoriaLogs push exporter, grounded on the teacher's
//! `VictoriaLogsExporter` (`ando-observability/src/logger.rs`): a true no-op
//! when disabled (no channel, no background task), `try_send` so
//! `access_log` never blocks the request path.

use chrono::Utc;
use mcpay_core::VictoriaLogsConfig;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{debug, error};

pub struct VictoriaLogsExporter {
    sender: Option<mpsc::Sender<serde_json::Value>>,
}

impl VictoriaLogsExporter {
    pub fn new(config: VictoriaLogsConfig) -> Self {
        if !config.enabled {
            return Self { sender: None };
        }

        let (tx, rx) = mpsc::channel(10_000);
        tokio::spawn(Self::flush_loop(config, rx));
        Self { sender: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { sender: None }
    }

    #[inline]
    #[allow(clippy::too_many_arguments)]
    pub fn access_log(
        &self,
        server_id: &str,
        method: &str,
        uri: &str,
        status: u16,
        latency_ms: f64,
        client_ip: &str,
        upstream_addr: Option<&str>,
    ) {
        let Some(sender) = self.sender.as_ref() else {
            return;
        };
        let entry = json!({
            "_msg": format!("{} {} {} {} {:.2}ms", method, uri, status, client_ip, latency_ms),
            "_time": Utc::now().to_rfc3339(),
            "level": "info",
            "type": "access",
            "server_id": server_id,
            "method": method,
            "uri": uri,
            "status": status,
            "latency_ms": latency_ms,
            "client_ip": client_ip,
            "upstream_addr": upstream_addr,
        });
        let _ = sender.try_send(entry);
    }

    async fn flush_loop(config: VictoriaLogsConfig, mut rx: mpsc::Receiver<serde_json::Value>) {
        let client = reqwest::Client::new();
        let mut batch: Vec<serde_json::Value> = Vec::with_capacity(config.batch_size);
        let mut flush_interval = interval(Duration::from_secs(config.flush_interval_secs));

        loop {
            tokio::select! {
                Some(entry) = rx.recv() => {
                    batch.push(entry);
                    if batch.len() >= config.batch_size {
                        Self::flush(&client, &config.endpoint, &mut batch).await;
                    }
                }
                _ = flush_interval.tick() => {
                    if !batch.is_empty() {
                        Self::flush(&client, &config.endpoint, &mut batch).await;
                    }
                }
            }
        }
    }

    async fn flush(client: &reqwest::Client, endpoint: &str, batch: &mut Vec<serde_json::Value>) {
        if batch.is_empty() {
            return;
        }
        let mut body = String::new();
        for entry in batch.iter() {
            body.push_str(&serde_json::to_string(entry).unwrap_or_default());
            body.push('\n');
        }
        let count = batch.len();
        match client
            .post(endpoint)
            .header("Content-Type", "application/stream+json")
            .body(body)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => debug!(count, "flushed logs to VictoriaLogs"),
            Ok(resp) => error!(status = %resp.status(), "VictoriaLogs flush failed"),
            Err(e) => error!(error = %e, "VictoriaLogs connection error"),
        }
        batch.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disabled_config() -> VictoriaLogsConfig {
        VictoriaLogsConfig {
            enabled: false,
            endpoint: "http://localhost:9428/insert/jsonline".to_string(),
            batch_size: 100,
            flush_interval_secs: 5,
        }
    }

    fn enabled_config() -> VictoriaLogsConfig {
        VictoriaLogsConfig {
            enabled: true,
            endpoint: "http://localhost:9428/insert/jsonline".to_string(),
            batch_size: 100,
            flush_interval_secs: 5,
        }
    }

    #[test]
    fn disabled_constructor_has_no_sender() {
        assert!(VictoriaLogsExporter::disabled().sender.is_none());
    }

    #[test]
    fn new_with_disabled_config_has_no_sender() {
        assert!(VictoriaLogsExporter::new(disabled_config()).sender.is_none());
    }

    #[test]
    fn access_log_on_disabled_does_not_panic() {
        let exporter = VictoriaLogsExporter::disabled();
        exporter.access_log("SRV", "GET", "/mcp/SRV", 200, 1.5, "127.0.0.1", None);
    }

    #[tokio::test]
    async fn new_with_enabled_config_has_sender() {
        assert!(VictoriaLogsExporter::new(enabled_config()).sender.is_some());
    }

    #[tokio::test]
    async fn access_log_on_enabled_does_not_block() {
        let exporter = VictoriaLogsExporter::new(enabled_config());
        exporter.access_log("SRV", "GET", "/mcp/SRV", 200, 0.5, "127.0.0.1", None);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

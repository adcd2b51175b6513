pub mod access_log;
pub mod logger;
pub mod metrics;

pub use access_log::AccessLogEntry;
pub use logger::VictoriaLogsExporter;
pub use metrics::MetricsCollector;

/// Installs a `tracing-subscriber` pipeline with an `EnvFilter` and JSON
/// formatting, mirroring the teacher's startup sequence. Call once, at
/// process start.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().with_target(true).init();
}

use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn default_filter(service_name: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{service_name}=info,info")))
}

/// Install the global subscriber. Logs go to stdout, or to a daily-rolled
/// file under `log_dir` when one is given. Keep the guard alive for the
/// lifetime of the process or buffered lines are lost.
pub fn init_tracing(service_name: &str, log_dir: Option<&Path>) -> WorkerGuard {
    let (non_blocking, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, format!("{service_name}.log"));
            tracing_appender::non_blocking(appender)
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(default_filter(service_name))
        .with_writer(non_blocking)
        .with_target(true)
        .with_thread_ids(true)
        .with_ansi(log_dir.is_none())
        .try_init();

    guard
}

/// Install the Prometheus recorder once; later calls return the same handle.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("install prometheus recorder")?;

    let _ = PROM_HANDLE.set(handle.clone());
    Ok(handle)
}

use std::future::Future;

use anyhow::Result;

mod bootstrap;
mod config_loader;
mod dispatcher;
mod feed_runtime;
mod presentation;

#[cfg(test)]
mod tests;

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::async_main().await
}

/// Spawn a background task whose handle nobody joins. Exits of `critical`
/// tasks are logged at info so a silently dead feed shows up in the log.
pub(crate) fn spawn_detached<F>(name: &'static str, critical: bool, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        fut.await;
        if critical {
            tracing::info!(task = name, "critical task exited");
        } else {
            tracing::debug!(task = name, "task exited");
        }
    });
}

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use audit_store::AuditStore;
use core_types::{Event, ExecutionClient, Explainer};
use execution_broker::{BrokerConfig, BrokerExecution, ExecutionMode};
use explainer::{DisabledExplainer, LlmExplainer, PromptBuilder};
use fusion_engine::build_strategy;
use infra_bus::{EventBus, RingBus};
use market_fuser::MarketFuser;
use metrics_exporter_prometheus::PrometheusHandle;
use observability::{init_metrics, init_tracing};
use portfolio::Portfolio;
use risk_engine::RiskManager;
use tokio_util::sync::CancellationToken;

use crate::config_loader::{config_path, load_app_config, AppConfig};
use crate::dispatcher::{Dispatcher, DispatcherParts, ExecutionPolicy};
use crate::feed_runtime::{spawn_market_feed, spawn_news_poller, spawn_vision_loop};
use crate::presentation::{spawn_event_log, spawn_stdin_chat};
use crate::spawn_detached;

const LIVE_ARMED_ENV: &str = "SIGNALFUSE_LIVE_ARMED";
const DEFAULT_INSTRUMENTS: &[&str] = &["NIFTY", "BANKNIFTY", "RELIANCE", "TCS", "INFY"];
const AUDIT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

pub(super) async fn async_main() -> Result<()> {
    let mut cfg = load_app_config()?;
    let _guard = init_tracing("signalfuse", cfg.observability.log_dir.as_deref());
    let prometheus = init_metrics()?;
    tracing::info!(config = %config_path().display(), "configuration loaded");

    if cfg.instruments.is_empty() {
        cfg.instruments = DEFAULT_INSTRUMENTS.iter().map(|s| s.to_string()).collect();
    }
    if cfg.vision.instrument.trim().is_empty() {
        cfg.vision.instrument = cfg.instruments.first().cloned().unwrap_or_default();
    }
    cfg.execution.broker.mode = resolve_execution_mode(&cfg.execution.broker, live_armed());

    let cancel = CancellationToken::new();
    let (bus, rx) = EventBus::<Event>::new(cfg.bus_capacity);
    let presentation = RingBus::<Event>::new(cfg.presentation_capacity);

    let (dispatcher, audit) =
        build_dispatcher(&cfg, bus.clone(), presentation.clone(), cancel.clone())?;

    spawn_event_log(&presentation, cancel.child_token());
    if cfg.stdin_chat {
        spawn_stdin_chat(bus.clone(), cancel.child_token());
    }
    if cfg.market_feed_enabled {
        spawn_market_feed(
            bus.clone(),
            cfg.market_feed.clone(),
            cfg.instruments.clone(),
            cancel.child_token(),
        );
    }
    if cfg.news_enabled && !cfg.news.feeds.is_empty() {
        spawn_news_poller(bus.clone(), cfg.news.clone(), cancel.child_token());
    }
    if cfg.vision.enabled {
        spawn_vision_loop(bus.clone(), cfg.vision.clone(), cancel.child_token());
    }

    {
        let bus = bus.clone();
        let cancel = cancel.clone();
        spawn_detached("ctrl_c", false, async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                res = tokio::signal::ctrl_c() => {
                    if let Err(err) = res {
                        tracing::warn!(?err, "ctrl_c handler failed");
                        return;
                    }
                    tracing::info!("interrupt received; shutting down");
                    cancel.cancel();
                    bus.close();
                }
            }
        });
    }

    tracing::info!(
        instruments = ?cfg.instruments,
        mode = ?cfg.execution.broker.mode,
        "pipeline started"
    );
    let stats = dispatcher.run(rx).await;
    cancel.cancel();

    let drained = tokio::task::spawn_blocking(move || audit.flush(AUDIT_FLUSH_TIMEOUT))
        .await
        .unwrap_or(false);
    if !drained {
        tracing::warn!("audit writer did not drain before shutdown");
    }
    if let Some(path) = cfg.observability.metrics_path.as_deref() {
        if let Err(err) = write_metrics_snapshot(&prometheus, path) {
            tracing::warn!(?err, path = %path.display(), "metrics snapshot not written");
        }
    }
    tracing::info!(
        events = stats.events,
        signals = stats.signals,
        orders_admitted = stats.orders_admitted,
        orders_throttled = stats.orders_throttled,
        fills = stats.fills,
        alerts = stats.alerts,
        handler_panics = stats.handler_panics,
        "shutdown complete"
    );
    Ok(())
}

fn live_armed() -> bool {
    std::env::var(LIVE_ARMED_ENV)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

/// Live trading needs both the config switch and the environment arm.
pub(crate) fn resolve_execution_mode(broker: &BrokerConfig, armed: bool) -> ExecutionMode {
    match broker.mode {
        ExecutionMode::Live if !armed => {
            tracing::warn!(
                "execution.mode=live but {LIVE_ARMED_ENV} is not true; forcing paper mode"
            );
            ExecutionMode::Paper
        }
        mode => mode,
    }
}

pub(crate) fn build_dispatcher(
    cfg: &AppConfig,
    bus: EventBus<Event>,
    presentation: RingBus<Event>,
    cancel: CancellationToken,
) -> Result<(Dispatcher, AuditStore)> {
    let strategy = build_strategy(&cfg.strategy.name, cfg.strategy.fusion.clone())?;
    let fuser = MarketFuser::new(strategy, cfg.strategy.news_scope)
        .with_aliases(cfg.strategy.aliases.clone());

    let execution: Arc<dyn ExecutionClient> = Arc::new(
        BrokerExecution::new(cfg.execution.broker.clone()).context("build execution client")?,
    );
    let explainer: Arc<dyn Explainer> = if cfg.explainer.enabled {
        Arc::new(LlmExplainer::new(&cfg.explainer)?)
    } else {
        Arc::new(DisabledExplainer)
    };
    let audit = AuditStore::spawn(cfg.audit.path.clone(), cfg.audit.enabled);

    let dispatcher = Dispatcher::new(DispatcherParts {
        bus,
        presentation,
        fuser,
        risk: RiskManager::new(cfg.risk.clone()),
        portfolio: Portfolio::new(cfg.initial_cash),
        execution,
        execution_policy: ExecutionPolicy {
            submit_attempts: cfg.execution.submit_attempts,
            submit_backoff: cfg.execution.submit_backoff,
            poll: cfg.execution.poll,
        },
        explainer,
        prompts: PromptBuilder::from_config(&cfg.explainer),
        explain_signals: cfg.explainer.explain_signals,
        audit: audit.clone(),
        cancel,
    });
    Ok((dispatcher, audit))
}

fn write_metrics_snapshot(handle: &PrometheusHandle, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    std::fs::write(path, handle.render()).with_context(|| format!("write {}", path.display()))
}

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use execution_broker::{BrokerConfig, ExecutionMode};
use explainer::ExplainerConfig;
use feed_market::MarketFeedConfig;
use feed_news::NewsConfig;
use feed_vision::VisionConfig;
use fusion_engine::{MultiFusionConfig, MULTI_FUSION};
use market_fuser::NewsScope;
use order_tracker::PollPolicy;
use portfolio::DEFAULT_INITIAL_CASH;
use risk_engine::RiskLimits;
use serde::Deserialize;

pub(crate) const CONFIG_PATH_ENV: &str = "SIGNALFUSE_CONFIG_PATH";
const DEFAULT_CONFIG_PATH: &str = "configs/signalfuse.toml";

pub(crate) fn config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ObservabilityConfig {
    pub log_dir: Option<PathBuf>,
    /// Prometheus text snapshot written on shutdown.
    pub metrics_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StrategyConfig {
    pub name: String,
    pub news_scope: NewsScope,
    pub aliases: HashMap<String, Vec<String>>,
    pub fusion: MultiFusionConfig,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            name: MULTI_FUSION.to_string(),
            news_scope: NewsScope::Global,
            aliases: HashMap::new(),
            fusion: MultiFusionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ExecutionConfig {
    pub broker: BrokerConfig,
    pub submit_attempts: u32,
    pub submit_backoff: Duration,
    pub poll: PollPolicy,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            submit_attempts: 3,
            submit_backoff: Duration::from_millis(500),
            poll: PollPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AuditConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("local_database/app_data.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AppConfig {
    pub observability: ObservabilityConfig,
    pub initial_cash: f64,
    pub risk: RiskLimits,
    pub bus_capacity: usize,
    pub presentation_capacity: usize,
    pub stdin_chat: bool,
    pub instruments: Vec<String>,
    pub strategy: StrategyConfig,
    pub market_feed_enabled: bool,
    pub market_feed: MarketFeedConfig,
    pub news_enabled: bool,
    pub news: NewsConfig,
    pub vision: VisionConfig,
    pub execution: ExecutionConfig,
    pub explainer: ExplainerConfig,
    pub audit: AuditConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            observability: ObservabilityConfig {
                log_dir: None,
                metrics_path: None,
            },
            initial_cash: DEFAULT_INITIAL_CASH,
            risk: RiskLimits::default(),
            bus_capacity: 4_096,
            presentation_capacity: 1_024,
            stdin_chat: false,
            instruments: Vec::new(),
            strategy: StrategyConfig::default(),
            market_feed_enabled: true,
            market_feed: MarketFeedConfig::default(),
            news_enabled: true,
            news: NewsConfig::default(),
            vision: VisionConfig::default(),
            execution: ExecutionConfig::default(),
            explainer: ExplainerConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    observability: Option<ObservabilitySection>,
    portfolio: Option<PortfolioSection>,
    risk: Option<RiskSection>,
    bus: Option<BusSection>,
    presentation: Option<PresentationSection>,
    strategy: Option<StrategySection>,
    market_feed: Option<MarketFeedSection>,
    news: Option<NewsSection>,
    vision: Option<VisionConfig>,
    execution: Option<ExecutionSection>,
    explainer: Option<ExplainerConfig>,
    audit: Option<AuditSection>,
}

#[derive(Debug, Deserialize, Default)]
struct ObservabilitySection {
    log_dir: Option<PathBuf>,
    metrics_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct PortfolioSection {
    initial_cash: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct RiskSection {
    max_order_fraction_of_cash: Option<f64>,
    max_position_fraction_of_portfolio: Option<f64>,
    requests_per_second: Option<u32>,
    min_signal_confidence: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct BusSection {
    capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct PresentationSection {
    capacity: Option<usize>,
    stdin_chat: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct StrategySection {
    name: Option<String>,
    news_scope: Option<NewsScope>,
    news_threshold: Option<f64>,
    aliases: Option<HashMap<String, Vec<String>>>,
}

#[derive(Debug, Deserialize, Default)]
struct MarketFeedSection {
    enabled: Option<bool>,
    instruments: Option<Vec<String>>,
    url: Option<String>,
    reconnect_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    max_reconnects: Option<u32>,
    synthetic_interval_ms: Option<u64>,
    synthetic_start_price: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct NewsSection {
    enabled: Option<bool>,
    feeds: Option<Vec<String>>,
    poll_interval_secs: Option<u64>,
    request_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ExecutionSection {
    mode: Option<String>,
    endpoint: Option<String>,
    api_key_env: Option<String>,
    timeout_ms: Option<u64>,
    submit_attempts: Option<u32>,
    submit_backoff_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    max_polls: Option<u32>,
    max_poll_errors: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct AuditSection {
    enabled: Option<bool>,
    path: Option<PathBuf>,
}

/// Load the app config. A missing file means defaults; a file that does not
/// parse is an error.
pub(crate) fn load_app_config() -> Result<AppConfig> {
    let path = config_path();
    let Ok(raw) = fs::read_to_string(&path) else {
        tracing::warn!(path = %path.display(), "config file not found; using defaults");
        return Ok(AppConfig::default());
    };
    parse_app_config(&raw).with_context(|| format!("parse config {}", path.display()))
}

pub(crate) fn parse_app_config(raw: &str) -> Result<AppConfig> {
    let parsed = toml::from_str::<ConfigFile>(raw)?;
    let mut cfg = AppConfig::default();

    if let Some(section) = parsed.observability {
        cfg.observability.log_dir = section.log_dir;
        cfg.observability.metrics_path = section.metrics_path;
    }
    if let Some(v) = parsed.portfolio.and_then(|s| s.initial_cash) {
        cfg.initial_cash = if v.is_finite() { v.max(0.0) } else { DEFAULT_INITIAL_CASH };
    }
    if let Some(section) = parsed.risk {
        if let Some(v) = section.max_order_fraction_of_cash {
            cfg.risk.max_order_fraction_of_cash = v.clamp(0.0, 1.0);
        }
        if let Some(v) = section.max_position_fraction_of_portfolio {
            cfg.risk.max_position_fraction_of_portfolio = v.clamp(0.0, 1.0);
        }
        if let Some(v) = section.requests_per_second {
            cfg.risk.requests_per_second = v.clamp(1, 1_000);
        }
        if let Some(v) = section.min_signal_confidence {
            cfg.risk.min_signal_confidence = v.clamp(0.0, 1.0);
        }
    }
    if let Some(v) = parsed.bus.and_then(|s| s.capacity) {
        cfg.bus_capacity = v.clamp(16, 262_144);
    }
    if let Some(section) = parsed.presentation {
        if let Some(v) = section.capacity {
            cfg.presentation_capacity = v.clamp(16, 65_536);
        }
        if let Some(v) = section.stdin_chat {
            cfg.stdin_chat = v;
        }
    }
    if let Some(section) = parsed.strategy {
        if let Some(v) = section.name {
            cfg.strategy.name = v.trim().to_string();
        }
        if let Some(v) = section.news_scope {
            cfg.strategy.news_scope = v;
        }
        if let Some(v) = section.news_threshold {
            cfg.strategy.fusion.news_threshold = v.clamp(0.0, 1.0);
        }
        if let Some(v) = section.aliases {
            cfg.strategy.aliases = v;
        }
    }
    if let Some(section) = parsed.market_feed {
        let feed = &mut cfg.market_feed;
        if let Some(v) = section.enabled {
            cfg.market_feed_enabled = v;
        }
        if let Some(v) = section.instruments {
            cfg.instruments = v
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = section.url {
            feed.url = v;
        }
        if let Some(v) = section.reconnect_backoff_ms {
            feed.reconnect_backoff_ms = v.clamp(10, 60_000);
        }
        if let Some(v) = section.max_backoff_ms {
            feed.max_backoff_ms = v.clamp(10, 600_000);
        }
        if let Some(v) = section.max_reconnects {
            feed.max_reconnects = v;
        }
        if let Some(v) = section.synthetic_interval_ms {
            feed.synthetic_interval_ms = v.clamp(10, 60_000);
        }
        if let Some(v) = section.synthetic_start_price {
            if v.is_finite() && v > 0.0 {
                feed.synthetic_start_price = v;
            }
        }
    }
    if let Some(section) = parsed.news {
        if let Some(v) = section.enabled {
            cfg.news_enabled = v;
        }
        if let Some(v) = section.feeds {
            cfg.news.feeds = v;
        }
        if let Some(v) = section.poll_interval_secs {
            cfg.news.poll_interval_secs = v.clamp(1, 86_400);
        }
        if let Some(v) = section.request_timeout_ms {
            cfg.news.request_timeout_ms = v.clamp(100, 120_000);
        }
    }
    if let Some(mut v) = parsed.vision {
        v.interval_ms = v.interval_ms.clamp(10, 60_000);
        v.threshold = v.threshold.clamp(0.0, 1.0);
        cfg.vision = v;
    }
    if let Some(section) = parsed.execution {
        let exec = &mut cfg.execution;
        if let Some(v) = section.mode {
            exec.broker.mode = if v.eq_ignore_ascii_case("live") {
                ExecutionMode::Live
            } else {
                ExecutionMode::Paper
            };
        }
        if let Some(v) = section.endpoint {
            exec.broker.endpoint = v;
        }
        if let Some(var) = section.api_key_env {
            exec.broker.api_key = std::env::var(var).ok().filter(|k| !k.is_empty());
        }
        if let Some(v) = section.timeout_ms {
            exec.broker.timeout = Duration::from_millis(v.clamp(100, 120_000));
        }
        if let Some(v) = section.submit_attempts {
            exec.submit_attempts = v.clamp(1, 10);
        }
        if let Some(v) = section.submit_backoff_ms {
            exec.submit_backoff = Duration::from_millis(v.clamp(1, 60_000));
        }
        if let Some(v) = section.poll_interval_ms {
            exec.poll.interval = Duration::from_millis(v.clamp(10, 600_000));
        }
        if let Some(v) = section.max_polls {
            exec.poll.max_polls = v.clamp(1, 100_000);
        }
        if let Some(v) = section.max_poll_errors {
            exec.poll.max_poll_errors = v.clamp(1, 1_000);
        }
    }
    if let Some(v) = parsed.explainer {
        cfg.explainer = v;
    }
    if let Some(section) = parsed.audit {
        if let Some(v) = section.enabled {
            cfg.audit.enabled = v;
        }
        if let Some(v) = section.path {
            cfg.audit.path = v;
        }
    }
    Ok(cfg)
}

//! Live tick feed over a broker websocket. After too many failed
//! connection attempts in a row the feed degrades to a random walk whose
//! events are labelled `synthetic`.

mod synthetic;

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use core_types::{DynStream, MarketEvent, MarketFeed};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

pub use synthetic::SyntheticWalk;

pub const WS_SOURCE: &str = "ws";
pub const SYNTHETIC_SOURCE: &str = "synthetic";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct MarketFeedConfig {
    pub url: String,
    pub reconnect_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Consecutive failed sessions before switching to synthetic ticks.
    /// Zero never degrades.
    pub max_reconnects: u32,
    pub synthetic_interval_ms: u64,
    pub synthetic_start_price: f64,
}

impl Default for MarketFeedConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765/ticks".to_string(),
            reconnect_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            max_reconnects: 5,
            synthetic_interval_ms: 1_000,
            synthetic_start_price: 100.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WsMarketFeed {
    cfg: MarketFeedConfig,
    cancel: CancellationToken,
}

impl WsMarketFeed {
    pub fn new(cfg: MarketFeedConfig, cancel: CancellationToken) -> Self {
        Self { cfg, cancel }
    }
}

#[async_trait::async_trait]
impl MarketFeed for WsMarketFeed {
    async fn stream_ticks(&self, instruments: Vec<String>) -> Result<DynStream<MarketEvent>> {
        let (tx, rx) = mpsc::channel::<MarketEvent>(4_096);
        let cfg = self.cfg.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            run_feed(cfg, instruments, tx, cancel).await;
        });
        let stream = ReceiverStream::new(rx).map(Ok);
        Ok(Box::pin(stream))
    }
}

async fn run_feed(
    cfg: MarketFeedConfig,
    instruments: Vec<String>,
    tx: mpsc::Sender<MarketEvent>,
    cancel: CancellationToken,
) {
    let wanted = instruments.iter().cloned().collect::<HashSet<_>>();
    let base_backoff = Duration::from_millis(cfg.reconnect_backoff_ms.max(1));
    let max_backoff = Duration::from_millis(cfg.max_backoff_ms.max(cfg.reconnect_backoff_ms));
    let mut backoff = base_backoff;
    let mut failures = 0u32;

    loop {
        let session = tokio::select! {
            _ = cancel.cancelled() => return,
            session = run_ws_session(&cfg.url, &wanted, &tx) => session,
        };
        let ticks = match session {
            SessionEnd::ReceiverGone => return,
            SessionEnd::Closed { ticks } => {
                tracing::warn!(url = %cfg.url, ticks, "market websocket closed; reconnecting");
                ticks
            }
            SessionEnd::Failed { ticks, err } => {
                tracing::warn!(url = %cfg.url, ticks, ?err, "market websocket failed; reconnecting");
                ticks
            }
        };
        // Only sessions that never delivered a tick count toward degrading.
        if ticks > 0 {
            failures = 0;
            backoff = base_backoff;
        } else {
            failures += 1;
        }

        if cfg.max_reconnects > 0 && failures >= cfg.max_reconnects {
            tracing::error!(
                failures,
                "market websocket unavailable; switching to synthetic ticks"
            );
            let walk = SyntheticWalk::new(&instruments, cfg.synthetic_start_price);
            walk.run(
                Duration::from_millis(cfg.synthetic_interval_ms.max(1)),
                &tx,
                &cancel,
            )
            .await;
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(max_backoff);
    }
}

enum SessionEnd {
    Closed { ticks: u64 },
    Failed { ticks: u64, err: anyhow::Error },
    ReceiverGone,
}

async fn run_ws_session(
    url: &str,
    wanted: &HashSet<String>,
    tx: &mpsc::Sender<MarketEvent>,
) -> SessionEnd {
    let (mut ws, _) = match connect_async(url).await {
        Ok(conn) => conn,
        Err(err) => {
            return SessionEnd::Failed {
                ticks: 0,
                err: anyhow::Error::new(err).context(format!("connect market ws: {url}")),
            }
        }
    };
    tracing::info!(url, "connected to market websocket");

    let mut ticks = 0u64;
    while let Some(msg) = ws.next().await {
        let msg = match msg.context("market ws read") {
            Ok(msg) => msg,
            Err(err) => return SessionEnd::Failed { ticks, err },
        };
        let text = match msg {
            Message::Text(t) => t.to_string(),
            Message::Binary(b) => String::from_utf8_lossy(&b).to_string(),
            Message::Ping(v) => {
                let _ = ws.send(Message::Pong(v)).await;
                continue;
            }
            Message::Pong(_) => continue,
            Message::Close(_) => break,
            Message::Frame(_) => continue,
        };

        let Some(tick) = parse_tick(&text) else {
            continue;
        };
        if !wanted.is_empty() && !wanted.contains(&tick.instrument) {
            continue;
        }
        ticks += 1;
        if tx.send(tick).await.is_err() {
            return SessionEnd::ReceiverGone;
        }
    }
    SessionEnd::Closed { ticks }
}

/// Decode `{"type":"tick","ticker":..,"price":..,"volume":..}`. Numbers
/// may arrive as JSON strings.
pub fn parse_tick(text: &str) -> Option<MarketEvent> {
    let payload = serde_json::from_str::<Value>(text).ok()?;
    if payload.get("type").and_then(Value::as_str) != Some("tick") {
        return None;
    }
    let instrument = payload.get("ticker").and_then(Value::as_str)?.trim();
    if instrument.is_empty() {
        return None;
    }
    let price = number(payload.get("price")?)?;
    if !price.is_finite() || price <= 0.0 {
        return None;
    }
    let volume = payload
        .get("volume")
        .and_then(number)
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(0.0);

    Some(MarketEvent {
        instrument: instrument.to_string(),
        price,
        volume,
        source: WS_SOURCE.into(),
        observed_at: Utc::now(),
    })
}

fn number(v: &Value) -> Option<f64> {
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.parse::<f64>().ok()))
}

//! Rule-based fusion of vision and news evidence into a directional intent.

use anyhow::{bail, Result};
use core_types::{
    FusionOutcome, FusionStrategy, InstrumentSnapshot, Intent, MarketEvent, NewsEvent,
    VisionEvent,
};
use serde::{Deserialize, Serialize};

pub const MULTI_FUSION: &str = "multi_fusion";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MultiFusionConfig {
    /// Sentiment strictly above this is bullish, strictly below its negation bearish.
    pub news_threshold: f64,
    /// Number of evidence slots confidence is normalised by. The predictive
    /// model slot is never filled, so confidence tops out at 2/3.
    pub source_slots: u32,
}

impl Default for MultiFusionConfig {
    fn default() -> Self {
        Self {
            news_threshold: 0.2,
            source_slots: 3,
        }
    }
}

/// Directional score of a detected chart pattern.
pub fn vision_score(vision: Option<&VisionEvent>) -> i32 {
    let Some(vision) = vision else {
        return 0;
    };
    let pattern = vision.pattern.to_ascii_lowercase();
    if pattern.contains("bullish") {
        1
    } else if pattern.contains("bearish") {
        -1
    } else {
        0
    }
}

pub fn news_score(news: Option<&NewsEvent>, threshold: f64) -> i32 {
    match news {
        Some(n) if n.sentiment > threshold => 1,
        Some(n) if n.sentiment < -threshold => -1,
        _ => 0,
    }
}

pub fn decide(vision: i32, news: i32) -> Intent {
    let total = vision + news;
    if total >= 2 {
        Intent::Buy
    } else if total <= -2 {
        Intent::Sell
    } else if vision == 1 && news >= 0 {
        Intent::Buy
    } else if vision == -1 && news <= 0 {
        Intent::Sell
    } else {
        Intent::Hold
    }
}

pub fn reason_string(
    action: Intent,
    market: &MarketEvent,
    news: Option<&NewsEvent>,
    vision: Option<&VisionEvent>,
) -> String {
    let pattern = vision.map(|v| v.pattern.as_str()).unwrap_or("N/A");
    let sentiment = news
        .map(|n| format!("{:.2}", n.sentiment))
        .unwrap_or_else(|| "N/A".to_string());
    format!(
        "Signal: {action} {}, Reason: Image model ({pattern}), News ({sentiment})",
        market.instrument
    )
}

/// Pure fusion with the default thresholds.
pub fn fuse(
    market: &MarketEvent,
    news: Option<&NewsEvent>,
    vision: Option<&VisionEvent>,
) -> FusionOutcome {
    MultiSourceFusion::default().fuse(InstrumentSnapshot {
        market,
        news,
        vision,
    })
}

#[derive(Debug, Clone, Default)]
pub struct MultiSourceFusion {
    cfg: MultiFusionConfig,
}

impl MultiSourceFusion {
    pub fn new(cfg: MultiFusionConfig) -> Self {
        Self { cfg }
    }
}

impl FusionStrategy for MultiSourceFusion {
    fn name(&self) -> &str {
        MULTI_FUSION
    }

    fn fuse(&self, snapshot: InstrumentSnapshot<'_>) -> FusionOutcome {
        let v = vision_score(snapshot.vision);
        let n = news_score(snapshot.news, self.cfg.news_threshold);
        let action = decide(v, n);

        let present = u32::from(snapshot.news.is_some()) + u32::from(snapshot.vision.is_some());
        let confidence = f64::from(present) / f64::from(self.cfg.source_slots.max(1));

        FusionOutcome {
            action,
            confidence: confidence.min(1.0),
            reason: reason_string(action, snapshot.market, snapshot.news, snapshot.vision),
        }
    }
}

/// Resolve a configured strategy name.
pub fn build_strategy(name: &str, cfg: MultiFusionConfig) -> Result<Box<dyn FusionStrategy>> {
    match name.trim() {
        "" | MULTI_FUSION => Ok(Box::new(MultiSourceFusion::new(cfg))),
        other => bail!("unknown fusion strategy: {other}"),
    }
}

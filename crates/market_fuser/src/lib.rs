use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use core_types::{
    FusionStrategy, InstrumentSnapshot, Intent, MarketEvent, NewsEvent, SignalEvent, VisionEvent,
};
use serde::{Deserialize, Serialize};

/// Which instruments a headline is fused into.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NewsScope {
    /// One latest-overall headline applies to every instrument.
    #[default]
    Global,
    /// A headline applies only to instruments it names (symbol or alias).
    Keyword,
}

/// Latest observation of each source for one instrument. Older
/// observations are replaced, never merged.
#[derive(Debug, Clone, Default)]
pub struct InstrumentState {
    pub market: Option<MarketEvent>,
    pub news: Option<NewsEvent>,
    pub vision: Option<VisionEvent>,
}

pub struct MarketFuser {
    strategy: Box<dyn FusionStrategy>,
    scope: NewsScope,
    aliases: HashMap<String, Vec<String>>,
    states: BTreeMap<String, InstrumentState>,
    latest_news: Option<NewsEvent>,
}

impl MarketFuser {
    pub fn new(strategy: Box<dyn FusionStrategy>, scope: NewsScope) -> Self {
        Self {
            strategy,
            scope,
            aliases: HashMap::new(),
            states: BTreeMap::new(),
            latest_news: None,
        }
    }

    /// Extra names a headline may use for an instrument, e.g.
    /// `RELIANCE -> ["Reliance Industries", "RIL"]`.
    pub fn with_aliases(mut self, aliases: HashMap<String, Vec<String>>) -> Self {
        self.aliases = aliases
            .into_iter()
            .map(|(k, v)| {
                let terms = v
                    .into_iter()
                    .map(|t| t.trim().to_ascii_uppercase())
                    .filter(|t| !t.is_empty())
                    .collect();
                (k, terms)
            })
            .collect();
        self
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    pub fn on_market(&mut self, event: MarketEvent) -> Option<SignalEvent> {
        let instrument = event.instrument.clone();
        self.states.entry(instrument.clone()).or_default().market = Some(event);
        self.fuse_instrument(&instrument)
    }

    pub fn on_vision(&mut self, event: VisionEvent) -> Option<SignalEvent> {
        let instrument = event.instrument.clone();
        self.states.entry(instrument.clone()).or_default().vision = Some(event);
        self.fuse_instrument(&instrument)
    }

    pub fn on_news(&mut self, event: NewsEvent) -> Vec<SignalEvent> {
        let targets = match self.scope {
            NewsScope::Global => {
                self.latest_news = Some(event);
                self.states.keys().cloned().collect::<Vec<_>>()
            }
            NewsScope::Keyword => {
                let targets = self.mentioned_instruments(&event.headline);
                if targets.is_empty() {
                    tracing::debug!(headline = %event.headline, "headline names no tracked instrument");
                }
                for instrument in &targets {
                    self.states.entry(instrument.clone()).or_default().news = Some(event.clone());
                }
                targets
            }
        };

        targets
            .iter()
            .filter_map(|instrument| self.fuse_instrument(instrument))
            .collect()
    }

    /// Re-run fusion for one instrument. No market observation means no
    /// price reference, so nothing is produced.
    pub fn fuse_instrument(&self, instrument: &str) -> Option<SignalEvent> {
        let state = self.states.get(instrument)?;
        let market = state.market.as_ref()?;
        let news = match self.scope {
            NewsScope::Global => self.latest_news.as_ref(),
            NewsScope::Keyword => state.news.as_ref(),
        };

        let outcome = self.strategy.fuse(InstrumentSnapshot {
            market,
            news,
            vision: state.vision.as_ref(),
        });

        if outcome.action == Intent::Hold {
            return None;
        }

        metrics::counter!("fusion.signal", "action" => outcome.action.to_string()).increment(1);
        tracing::info!(
            instrument,
            action = %outcome.action,
            confidence = outcome.confidence,
            reason = %outcome.reason,
            "fused signal"
        );
        Some(SignalEvent {
            instrument: instrument.to_string(),
            action: outcome.action,
            confidence: outcome.confidence,
            reason: outcome.reason,
            observed_at: Utc::now(),
        })
    }

    pub fn latest_price(&self, instrument: &str) -> Option<f64> {
        self.states
            .get(instrument)
            .and_then(|s| s.market.as_ref())
            .map(|m| m.price)
    }

    pub fn state(&self, instrument: &str) -> Option<&InstrumentState> {
        self.states.get(instrument)
    }

    fn mentioned_instruments(&self, headline: &str) -> Vec<String> {
        let upper = headline.to_ascii_uppercase();
        let tokens = upper
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>();
        let matches = |term: &str| {
            if term.contains(char::is_whitespace) {
                upper.contains(term)
            } else {
                tokens.iter().any(|t| *t == term)
            }
        };

        let mut candidates = self.states.keys().cloned().collect::<Vec<_>>();
        for key in self.aliases.keys() {
            if !self.states.contains_key(key) {
                candidates.push(key.clone());
            }
        }
        candidates.sort();

        candidates
            .into_iter()
            .filter(|instrument| {
                matches(&instrument.to_ascii_uppercase())
                    || self
                        .aliases
                        .get(instrument)
                        .is_some_and(|terms| terms.iter().any(|t| matches(t)))
            })
            .collect()
    }
}

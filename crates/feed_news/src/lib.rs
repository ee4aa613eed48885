mod rss;
mod sentiment;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use core_types::{Event, NewsEvent, SentimentScorer};
use infra_bus::EventBus;
use reqwest::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

pub use rss::{parse_feed, FeedDocument};
pub use sentiment::LexiconSentiment;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct NewsConfig {
    pub feeds: Vec<String>,
    pub poll_interval_secs: u64,
    pub request_timeout_ms: u64,
}

impl Default for NewsConfig {
    fn default() -> Self {
        Self {
            feeds: Vec::new(),
            poll_interval_secs: 300,
            request_timeout_ms: 10_000,
        }
    }
}

/// Polls RSS/Atom feeds and publishes each headline once per process.
pub struct NewsPoller {
    feeds: Vec<String>,
    interval: Duration,
    http: Client,
    scorer: Arc<dyn SentimentScorer>,
    seen: HashSet<String>,
}

impl NewsPoller {
    pub fn new(cfg: NewsConfig, scorer: Arc<dyn SentimentScorer>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms.max(100)))
            .build()?;
        let mut poller = Self {
            feeds: Vec::new(),
            interval: Duration::from_secs(cfg.poll_interval_secs.max(1)),
            http,
            scorer,
            seen: HashSet::new(),
        };
        for feed in cfg.feeds {
            poller.add_feed(&feed);
        }
        Ok(poller)
    }

    pub fn feeds(&self) -> &[String] {
        &self.feeds
    }

    pub fn add_feed(&mut self, url: &str) -> bool {
        let url = url.trim();
        if url.is_empty() || self.feeds.iter().any(|f| f == url) {
            return false;
        }
        self.feeds.push(url.to_string());
        true
    }

    pub fn remove_feed(&mut self, url: &str) -> bool {
        let before = self.feeds.len();
        self.feeds.retain(|f| f != url.trim());
        before != self.feeds.len()
    }

    /// Turn a fetched document into events for headlines not seen before.
    pub fn ingest(&mut self, url: &str, xml: &str) -> Vec<NewsEvent> {
        let doc = parse_feed(xml);
        let source = doc.title.unwrap_or_else(|| url.to_string());
        let mut out = Vec::new();
        for headline in doc.items {
            if !self.seen.insert(headline.clone()) {
                continue;
            }
            let sentiment = self.scorer.score(&headline);
            let sentiment = if sentiment.is_finite() {
                sentiment.clamp(-1.0, 1.0)
            } else {
                0.0
            };
            out.push(NewsEvent {
                headline,
                source: source.clone(),
                sentiment,
                observed_at: Utc::now(),
            });
        }
        out
    }

    pub async fn poll_once(&mut self) -> Vec<NewsEvent> {
        let mut out = Vec::new();
        for url in self.feeds.clone() {
            match self.fetch(&url).await {
                Ok(xml) => {
                    let fresh = self.ingest(&url, &xml);
                    tracing::debug!(feed = %url, fresh = fresh.len(), "feed polled");
                    out.extend(fresh);
                }
                Err(err) => tracing::error!(feed = %url, ?err, "news feed fetch failed"),
            }
        }
        out
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        if let Some(path) = url.strip_prefix("file://") {
            return tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("read feed file {path}"));
        }
        let res = self.http.get(url).send().await.context("request feed")?;
        if !res.status().is_success() {
            bail!("feed returned {}", res.status());
        }
        res.text().await.context("read feed body")
    }

    /// Poll immediately, then every interval, until cancelled or the bus
    /// closes.
    pub async fn run(mut self, bus: EventBus<Event>, cancel: CancellationToken) {
        tracing::info!(
            feeds = self.feeds.len(),
            interval_secs = self.interval.as_secs(),
            "news poller started"
        );
        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => return,
                b = self.poll_once() => b,
            };
            for event in batch {
                if bus.publish(Event::News(event)).await.is_err() {
                    tracing::info!("event bus closed; news poller stopping");
                    return;
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

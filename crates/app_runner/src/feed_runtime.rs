use std::sync::Arc;

use core_types::{Event, MarketFeed};
use feed_market::{MarketFeedConfig, WsMarketFeed};
use feed_news::{LexiconSentiment, NewsConfig, NewsPoller};
use feed_vision::{JsonlPatternDetector, VisionConfig, VisionLoop};
use futures::StreamExt;
use infra_bus::EventBus;
use tokio_util::sync::CancellationToken;

use crate::spawn_detached;

pub(super) fn spawn_market_feed(
    bus: EventBus<Event>,
    cfg: MarketFeedConfig,
    instruments: Vec<String>,
    cancel: CancellationToken,
) {
    spawn_detached("market_feed", true, async move {
        let feed = WsMarketFeed::new(cfg, cancel.clone());
        let mut stream = match feed.stream_ticks(instruments).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(?err, "market feed failed to start");
                return;
            }
        };
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(tick)) => {
                    if bus.publish(Event::Market(tick)).await.is_err() {
                        return;
                    }
                }
                Some(Err(err)) => tracing::warn!(?err, "market feed error"),
                None => return,
            }
        }
    });
}

pub(super) fn spawn_news_poller(bus: EventBus<Event>, cfg: NewsConfig, cancel: CancellationToken) {
    let poller = match NewsPoller::new(cfg, Arc::new(LexiconSentiment)) {
        Ok(poller) => poller,
        Err(err) => {
            tracing::error!(?err, "news poller disabled");
            return;
        }
    };
    tracing::info!(feeds = poller.feeds().len(), "news poller starting");
    spawn_detached("news_poller", true, poller.run(bus, cancel));
}

pub(super) fn spawn_vision_loop(bus: EventBus<Event>, cfg: VisionConfig, cancel: CancellationToken) {
    let Some(path) = cfg.detections_path.clone() else {
        tracing::warn!("vision enabled without a detections_path; skipping");
        return;
    };
    spawn_detached("vision_loop", true, async move {
        let detector = match JsonlPatternDetector::open(&path, cfg.replay_loop).await {
            Ok(detector) => detector,
            Err(err) => {
                tracing::error!(?err, path = %path.display(), "vision detector failed to open");
                return;
            }
        };
        VisionLoop::new(Box::new(detector), &cfg).run(bus, cancel).await;
    });
}

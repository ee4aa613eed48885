use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use async_trait::async_trait;
use core_types::{
    new_id, AlertLevel, ChatRequestEvent, ControlCommand, Event, ExecutionClient,
    ExecutionError, FillEvent,
    FusionOutcome, FusionStrategy, InstrumentSnapshot, MarketEvent, NewsEvent, OrderAck,
    OrderRequestEvent, OrderStatusReport, OrderType, TradeAction, VisionEvent,
};
use execution_broker::{BrokerConfig, BrokerExecution, ExecutionMode};
use explainer::{DisabledExplainer, PromptBuilder, FALLBACK_EXPLANATION};
use fusion_engine::MultiSourceFusion;
use infra_bus::{EventBus, EventReceiver, RingBus};
use market_fuser::{MarketFuser, NewsScope};
use order_tracker::PollPolicy;
use portfolio::Portfolio;
use risk_engine::{RiskLimits, RiskManager};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::{build_dispatcher, resolve_execution_mode};
use crate::config_loader::{parse_app_config, AppConfig};
use crate::dispatcher::{Dispatcher, DispatcherParts, ExecutionPolicy};

struct Harness {
    dispatcher: Dispatcher,
    rx: EventReceiver<Event>,
    bus: EventBus<Event>,
    presentation: RingBus<Event>,
    cancel: CancellationToken,
}

fn harness_with(fuser: MarketFuser, limits: RiskLimits) -> Harness {
    let execution: Arc<dyn ExecutionClient> =
        Arc::new(BrokerExecution::paper().expect("paper broker"));
    harness_on(execution, fuser, limits)
}

fn harness_on(
    execution: Arc<dyn ExecutionClient>,
    fuser: MarketFuser,
    limits: RiskLimits,
) -> Harness {
    let (bus, rx) = EventBus::new(256);
    let presentation = RingBus::new(256);
    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::new(DispatcherParts {
        bus: bus.clone(),
        presentation: presentation.clone(),
        fuser,
        risk: RiskManager::new(limits),
        portfolio: Portfolio::new(100_000.0),
        execution,
        execution_policy: ExecutionPolicy {
            submit_attempts: 2,
            submit_backoff: Duration::from_millis(1),
            poll: PollPolicy {
                interval: Duration::from_millis(5),
                max_polls: 10,
                max_poll_errors: 2,
            },
        },
        explainer: Arc::new(DisabledExplainer),
        prompts: PromptBuilder::default(),
        explain_signals: false,
        audit: Default::default(),
        cancel: cancel.clone(),
    });
    Harness {
        dispatcher,
        rx,
        bus,
        presentation,
        cancel,
    }
}

fn harness() -> Harness {
    let fuser = MarketFuser::new(Box::new(MultiSourceFusion::default()), NewsScope::Global);
    harness_with(fuser, RiskLimits::default())
}

impl Harness {
    /// Feed bus events back into the dispatcher until `done` holds.
    async fn pump_until(&mut self, done: impl Fn(&Dispatcher) -> bool) {
        let deadline = Duration::from_secs(5);
        timeout(deadline, async {
            while !done(&self.dispatcher) {
                let event = self.rx.consume().await.expect("bus open");
                self.dispatcher.process(event);
            }
        })
        .await
        .expect("condition reached in time");
    }
}

fn tick(instrument: &str, price: f64) -> Event {
    Event::Market(MarketEvent {
        instrument: instrument.to_string(),
        price,
        volume: 1_000.0,
        source: "test".into(),
        observed_at: Utc::now(),
    })
}

fn vision(instrument: &str, pattern: &str) -> Event {
    Event::Vision(VisionEvent {
        instrument: instrument.to_string(),
        pattern: pattern.to_string(),
        confidence: 0.9,
        observed_at: Utc::now(),
    })
}

fn order_request(instrument: &str) -> Event {
    Event::OrderRequest(OrderRequestEvent {
        request_id: new_id(),
        instrument: instrument.to_string(),
        action: TradeAction::Buy,
        quantity: 1.0,
        reference_price: 10.0,
        order_type: OrderType::Market,
        observed_at: Utc::now(),
    })
}

fn drain_presentation(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

#[tokio::test]
async fn vision_signal_flows_through_to_a_paper_fill() {
    let mut h = harness();
    let mut display = h.presentation.subscribe();

    h.dispatcher.process(tick("X", 100.0));
    assert_eq!(h.dispatcher.stats().signals, 0, "market alone is a hold");

    h.dispatcher.process(vision("X", "bullish_flag"));
    let stats = h.dispatcher.stats();
    assert_eq!(stats.signals, 1);
    assert_eq!(stats.orders_admitted, 1);

    h.pump_until(|d| d.stats().fills == 1).await;

    let portfolio = h.dispatcher.portfolio();
    assert_eq!(portfolio.held("X"), 100.0);
    assert!((portfolio.cash() - 90_000.0).abs() < 1e-9);
    assert!(h.dispatcher.tracker().is_empty());

    let shown = drain_presentation(&mut display);
    let pnl = shown.iter().rev().find_map(|e| match e {
        Event::PnlUpdate(p) => Some(p.clone()),
        _ => None,
    });
    let pnl = pnl.expect("pnl update published");
    assert!((pnl.portfolio_value - 100_000.0).abs() < 1e-9);
    assert!((pnl.cash - 90_000.0).abs() < 1e-9);
    assert!(shown.iter().any(|e| matches!(e, Event::Signal(_))));
}

#[tokio::test]
async fn held_instrument_ticks_refresh_valuation() {
    let mut h = harness();
    h.dispatcher.process(tick("X", 100.0));
    h.dispatcher.process(Event::Fill(FillEvent {
        order_id: "o-1".into(),
        instrument: "X".into(),
        action: TradeAction::Buy,
        quantity: 10.0,
        price: 100.0,
        observed_at: Utc::now(),
    }));
    let mut display = h.presentation.subscribe();

    h.dispatcher.process(tick("X", 110.0));
    let shown = drain_presentation(&mut display);
    let pnl = shown
        .iter()
        .find_map(|e| match e {
            Event::PnlUpdate(p) => Some(p.clone()),
            _ => None,
        })
        .expect("valuation after tick");
    assert!((pnl.portfolio_value - 100_100.0).abs() < 1e-9);

    h.dispatcher.process(tick("Y", 5.0));
    let shown = drain_presentation(&mut display);
    assert!(!shown.iter().any(|e| matches!(e, Event::PnlUpdate(_))));
}

#[tokio::test]
async fn bearish_agreement_without_a_position_places_no_order() {
    let mut h = harness();
    h.dispatcher.process(tick("X", 100.0));
    h.dispatcher.process(Event::News(NewsEvent {
        headline: "Shares slump".into(),
        source: "wire".into(),
        sentiment: -0.5,
        observed_at: Utc::now(),
    }));
    h.dispatcher.process(vision("X", "bearish_flag"));

    let stats = h.dispatcher.stats();
    assert_eq!(stats.signals, 1, "bearish news alone is a hold");
    assert_eq!(stats.orders_admitted, 0, "nothing held, nothing to sell");
}

#[tokio::test]
async fn ticks_during_an_open_exit_do_not_sell_twice() {
    let mut h = harness();
    h.dispatcher.process(tick("X", 100.0));
    h.dispatcher.process(Event::Fill(FillEvent {
        order_id: "o-1".into(),
        instrument: "X".into(),
        action: TradeAction::Buy,
        quantity: 10.0,
        price: 100.0,
        observed_at: Utc::now(),
    }));

    h.dispatcher.process(vision("X", "bearish_flag"));
    assert_eq!(h.dispatcher.stats().orders_admitted, 1);
    // Each tick re-fuses to SELL while the first exit is still unfilled.
    for price in [101.0, 102.0, 101.5] {
        h.dispatcher.process(tick("X", price));
    }
    let stats = h.dispatcher.stats();
    assert_eq!(stats.signals, 4);
    assert_eq!(stats.orders_admitted, 1);

    h.pump_until(|d| d.tracker().in_flight() == 0).await;
    let stats = h.dispatcher.stats();
    assert_eq!(stats.fills, 2);
    assert_eq!(stats.alerts, 0, "no oversell alarm");
    assert_eq!(h.dispatcher.portfolio().held("X"), 0.0);
}

#[tokio::test]
async fn ticks_during_open_buys_respect_the_position_cap() {
    let mut h = harness();
    h.dispatcher.process(tick("X", 100.0));
    h.dispatcher.process(vision("X", "bullish_flag"));
    for _ in 0..4 {
        h.dispatcher.process(tick("X", 100.0));
    }
    // 100, then 90 from the cash left after the first, then the last 10
    // the 20% cap allows.
    assert_eq!(h.dispatcher.stats().orders_admitted, 3);

    h.pump_until(|d| d.tracker().in_flight() == 0).await;
    let portfolio = h.dispatcher.portfolio();
    let held = portfolio.held("X");
    assert_eq!(held, 200.0);
    let value = portfolio.value_with(|_| Some(100.0)).portfolio_value;
    assert!(held * 100.0 <= 0.2 * value + 1e-9);
    assert_eq!(h.dispatcher.stats().fills, 3);
}

struct RefusingVenue;

#[async_trait]
impl ExecutionClient for RefusingVenue {
    async fn submit_order(&self, _request: &OrderRequestEvent) -> Result<String, ExecutionError> {
        Err(ExecutionError::Rejected("market closed".into()))
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderStatusReport, ExecutionError> {
        Err(ExecutionError::UnknownOrder(order_id.to_string()))
    }
}

#[tokio::test]
async fn failed_submission_releases_its_reservation() {
    let fuser = MarketFuser::new(Box::new(MultiSourceFusion::default()), NewsScope::Global);
    let mut h = harness_on(Arc::new(RefusingVenue), fuser, RiskLimits::default());
    let mut display = h.presentation.subscribe();

    h.dispatcher.process(order_request("X"));
    assert_eq!(h.dispatcher.tracker().in_flight(), 1);
    assert_eq!(h.dispatcher.tracker().exposure("X").buy_quantity, 1.0);

    h.pump_until(|d| d.stats().alerts == 1).await;
    assert_eq!(h.dispatcher.tracker().in_flight(), 0);
    assert_eq!(h.dispatcher.tracker().pending_buy_notional(), 0.0);
    let shown = drain_presentation(&mut display);
    assert!(shown.iter().any(
        |e| matches!(e, Event::Alert(a) if a.level == AlertLevel::Error && a.message.contains("market closed"))
    ));
}

#[tokio::test]
async fn burst_of_requests_is_throttled_to_the_rate_limit() {
    let mut h = harness();
    for _ in 0..15 {
        h.dispatcher.process(order_request("X"));
    }
    let stats = h.dispatcher.stats();
    assert_eq!(stats.orders_admitted, 10);
    assert_eq!(stats.orders_throttled, 5);
    h.cancel.cancel();
}

#[tokio::test]
async fn pause_blocks_new_orders_until_resumed() {
    let mut h = harness();
    h.dispatcher.process(Event::Control(ControlCommand::Pause));
    assert!(h.dispatcher.is_paused());
    h.dispatcher.process(order_request("X"));
    assert_eq!(h.dispatcher.stats().orders_admitted, 0);

    h.dispatcher.process(Event::Control(ControlCommand::Resume));
    h.dispatcher.process(order_request("X"));
    assert_eq!(h.dispatcher.stats().orders_admitted, 1);
    h.cancel.cancel();
}

#[tokio::test]
async fn oversell_fill_raises_an_alert_and_leaves_the_ledger_alone() {
    let mut h = harness();
    let mut display = h.presentation.subscribe();
    h.dispatcher.process(Event::Fill(FillEvent {
        order_id: "o-9".into(),
        instrument: "X".into(),
        action: TradeAction::Sell,
        quantity: 5.0,
        price: 100.0,
        observed_at: Utc::now(),
    }));

    assert_eq!(h.dispatcher.stats().fills, 0);
    assert_eq!(h.dispatcher.stats().alerts, 1);
    assert_eq!(h.dispatcher.portfolio().cash(), 100_000.0);
    let shown = drain_presentation(&mut display);
    assert!(shown
        .iter()
        .any(|e| matches!(e, Event::Alert(a) if a.level == AlertLevel::Error)));
}

#[tokio::test]
async fn unknown_order_is_reported_lost() {
    let mut h = harness();
    h.dispatcher.process(Event::OrderAccepted(OrderAck {
        request_id: new_id(),
        order_id: "never-submitted".into(),
        instrument: "X".into(),
        action: TradeAction::Buy,
        quantity: 1.0,
        observed_at: Utc::now(),
    }));
    assert_eq!(h.dispatcher.tracker().len(), 1);

    h.pump_until(|d| d.stats().alerts == 1).await;
    assert!(h.dispatcher.tracker().is_empty());
    assert_eq!(h.dispatcher.stats().fills, 0);
}

#[tokio::test]
async fn chat_request_yields_an_explanation() {
    let mut h = harness();
    let mut display = h.presentation.subscribe();
    h.dispatcher.process(Event::ChatRequest(ChatRequestEvent {
        text: "how am I doing?".into(),
        observed_at: Utc::now(),
    }));
    let event = timeout(Duration::from_secs(5), h.rx.consume())
        .await
        .expect("explanation in time")
        .expect("bus open");
    h.dispatcher.process(event);

    let shown = drain_presentation(&mut display);
    let explanation = shown
        .iter()
        .find_map(|e| match e {
            Event::Explanation(x) => Some(x.clone()),
            _ => None,
        })
        .expect("explanation displayed");
    assert_eq!(explanation.request, "how am I doing?");
    assert_eq!(explanation.text, FALLBACK_EXPLANATION);
}

#[tokio::test]
async fn explanation_after_bus_close_is_dropped() {
    let mut h = harness();
    h.bus.close();
    h.dispatcher.process(Event::ChatRequest(ChatRequestEvent {
        text: "still there?".into(),
        observed_at: Utc::now(),
    }));
    let next = timeout(Duration::from_secs(5), h.rx.consume())
        .await
        .expect("closed bus drains");
    assert!(next.is_none());
    assert_eq!(h.dispatcher.stats().alerts, 0);
}

struct ExplodingStrategy;

impl FusionStrategy for ExplodingStrategy {
    fn name(&self) -> &str {
        "exploding"
    }

    fn fuse(&self, _snapshot: InstrumentSnapshot<'_>) -> FusionOutcome {
        panic!("strategy blew up");
    }
}

#[tokio::test]
async fn handler_panic_becomes_an_alert_and_dispatch_continues() {
    let fuser = MarketFuser::new(Box::new(ExplodingStrategy), NewsScope::Global);
    let mut h = harness_with(fuser, RiskLimits::default());

    h.dispatcher.process(tick("X", 100.0));
    let stats = h.dispatcher.stats();
    assert_eq!(stats.handler_panics, 1);
    assert_eq!(stats.alerts, 1);

    h.dispatcher.process(Event::Control(ControlCommand::Pause));
    assert!(h.dispatcher.is_paused());
}

#[tokio::test]
async fn shutdown_command_drains_and_stops_the_loop() {
    let h = harness();
    h.bus
        .publish(tick("X", 100.0))
        .await
        .expect("publish tick");
    h.bus
        .publish(Event::Control(ControlCommand::Shutdown))
        .await
        .expect("publish shutdown");

    let stats = timeout(Duration::from_secs(5), h.dispatcher.run(h.rx))
        .await
        .expect("dispatcher stops");
    assert_eq!(stats.events, 2);
    assert!(h.cancel.is_cancelled());
    assert!(h.bus.is_closed());
}

#[test]
fn empty_config_uses_defaults() {
    let cfg = parse_app_config("").expect("parse");
    assert_eq!(cfg, AppConfig::default());
    assert_eq!(cfg.risk.requests_per_second, 10);
    assert_eq!(cfg.initial_cash, 100_000.0);
    assert_eq!(cfg.execution.broker.mode, ExecutionMode::Paper);
}

#[test]
fn config_sections_are_read_and_clamped() {
    let raw = r#"
        [portfolio]
        initial_cash = 5000.0

        [risk]
        max_order_fraction_of_cash = 3.0
        requests_per_second = 0

        [strategy]
        news_scope = "keyword"
        news_threshold = 0.3
        aliases = { RELIANCE = ["Reliance Industries", "RIL"] }

        [market_feed]
        instruments = ["RELIANCE", " ", "TCS"]
        max_reconnects = 2

        [execution]
        mode = "live"
        submit_attempts = 50
        poll_interval_ms = 250
        max_polls = 4

        [explainer]
        model = "llama3"
        explain_signals = true

        [audit]
        enabled = false
    "#;
    let cfg = parse_app_config(raw).expect("parse");
    assert_eq!(cfg.initial_cash, 5000.0);
    assert_eq!(cfg.risk.max_order_fraction_of_cash, 1.0);
    assert_eq!(cfg.risk.requests_per_second, 1);
    assert_eq!(cfg.strategy.news_scope, NewsScope::Keyword);
    assert_eq!(cfg.strategy.fusion.news_threshold, 0.3);
    assert_eq!(cfg.strategy.aliases["RELIANCE"].len(), 2);
    assert_eq!(cfg.instruments, vec!["RELIANCE".to_string(), "TCS".to_string()]);
    assert_eq!(cfg.market_feed.max_reconnects, 2);
    assert_eq!(cfg.execution.broker.mode, ExecutionMode::Live);
    assert_eq!(cfg.execution.submit_attempts, 10);
    assert_eq!(cfg.execution.poll.interval, Duration::from_millis(250));
    assert_eq!(cfg.execution.poll.max_polls, 4);
    assert_eq!(cfg.explainer.model, "llama3");
    assert!(cfg.explainer.explain_signals);
    assert!(!cfg.audit.enabled);
}

#[test]
fn malformed_config_is_an_error() {
    assert!(parse_app_config("[risk]\nrequests_per_second = \"fast\"").is_err());
}

#[test]
fn live_mode_requires_arming() {
    let live = BrokerConfig {
        mode: ExecutionMode::Live,
        ..BrokerConfig::default()
    };
    assert_eq!(resolve_execution_mode(&live, false), ExecutionMode::Paper);
    assert_eq!(resolve_execution_mode(&live, true), ExecutionMode::Live);
    assert_eq!(
        resolve_execution_mode(&BrokerConfig::default(), true),
        ExecutionMode::Paper
    );
}

#[tokio::test]
async fn unknown_strategy_name_fails_bootstrap() {
    let mut cfg = AppConfig::default();
    cfg.strategy.name = "martingale".into();
    cfg.audit.enabled = false;
    let (bus, _rx) = EventBus::new(8);
    let built = build_dispatcher(&cfg, bus, RingBus::new(8), CancellationToken::new());
    assert!(built.is_err());
}

#[tokio::test]
async fn fills_and_signals_reach_the_audit_log() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = dir.path().join("audit.db");
    let mut cfg = AppConfig::default();
    cfg.explainer.enabled = false;
    cfg.audit.path = db.clone();
    cfg.execution.poll.interval = Duration::from_millis(5);

    let (bus, mut rx) = EventBus::new(64);
    let cancel = CancellationToken::new();
    let (mut dispatcher, audit) =
        build_dispatcher(&cfg, bus, RingBus::new(64), cancel.clone()).expect("build");

    dispatcher.process(tick("RELIANCE", 2500.0));
    dispatcher.process(vision("RELIANCE", "bullish_flag"));
    timeout(Duration::from_secs(5), async {
        while dispatcher.stats().fills == 0 {
            let event = rx.consume().await.expect("bus open");
            dispatcher.process(event);
        }
    })
    .await
    .expect("fill in time");
    cancel.cancel();

    assert!(audit.flush(Duration::from_secs(5)));
    let trades = audit_store::read_recent_trades(&db, 10).expect("read trades");
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].ticker, "RELIANCE");
    assert_eq!(trades[0].quantity, 4.0);
    assert_eq!(audit_store::signal_count(&db).expect("count"), 1);
}

//! The single consumer of the event bus. Owns every piece of mutable
//! trading state; everything that waits on I/O is spawned and reports back
//! through the bus.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use audit_store::AuditStore;
use chrono::Utc;
use core_types::{
    AlertEvent, AlertLevel, ChatRequestEvent, ControlCommand, Event, ExecutionClient,
    ExplanationEvent, Explainer, FillEvent, MarketEvent, OrderAck, OrderRequestEvent,
    OrderUpdateEvent, SignalEvent, SubmitFailedEvent,
};
use explainer::PromptBuilder;
use infra_bus::{EventBus, EventReceiver, RingBus};
use market_fuser::MarketFuser;
use order_tracker::{spawn_order_poller, OrderTracker, PollPolicy, Transition};
use portfolio::Portfolio;
use risk_engine::{RiskContext, RiskManager, SlidingWindowLimiter};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ExecutionPolicy {
    pub submit_attempts: u32,
    pub submit_backoff: Duration,
    pub poll: PollPolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DispatchStats {
    pub events: u64,
    pub signals: u64,
    pub orders_admitted: u64,
    pub orders_throttled: u64,
    pub fills: u64,
    pub alerts: u64,
    pub handler_panics: u64,
}

pub(crate) struct Dispatcher {
    bus: EventBus<Event>,
    presentation: RingBus<Event>,
    fuser: MarketFuser,
    risk: RiskManager,
    limiter: SlidingWindowLimiter,
    tracker: OrderTracker,
    portfolio: Portfolio,
    execution: Arc<dyn ExecutionClient>,
    execution_policy: ExecutionPolicy,
    explainer: Arc<dyn Explainer>,
    prompts: PromptBuilder,
    explain_signals: bool,
    audit: AuditStore,
    cancel: CancellationToken,
    paused: bool,
    stats: DispatchStats,
}

pub(crate) struct DispatcherParts {
    pub bus: EventBus<Event>,
    pub presentation: RingBus<Event>,
    pub fuser: MarketFuser,
    pub risk: RiskManager,
    pub portfolio: Portfolio,
    pub execution: Arc<dyn ExecutionClient>,
    pub execution_policy: ExecutionPolicy,
    pub explainer: Arc<dyn Explainer>,
    pub prompts: PromptBuilder,
    pub explain_signals: bool,
    pub audit: AuditStore,
    pub cancel: CancellationToken,
}

impl Dispatcher {
    pub(crate) fn new(parts: DispatcherParts) -> Self {
        let limiter = SlidingWindowLimiter::per_second(parts.risk.limits().requests_per_second);
        Self {
            bus: parts.bus,
            presentation: parts.presentation,
            fuser: parts.fuser,
            risk: parts.risk,
            limiter,
            tracker: OrderTracker::new(),
            portfolio: parts.portfolio,
            execution: parts.execution,
            execution_policy: parts.execution_policy,
            explainer: parts.explainer,
            prompts: parts.prompts,
            explain_signals: parts.explain_signals,
            audit: parts.audit,
            cancel: parts.cancel,
            paused: false,
            stats: DispatchStats::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn stats(&self) -> DispatchStats {
        self.stats
    }

    #[cfg(test)]
    pub(crate) fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    #[cfg(test)]
    pub(crate) fn tracker(&self) -> &OrderTracker {
        &self.tracker
    }

    #[cfg(test)]
    pub(crate) fn is_paused(&self) -> bool {
        self.paused
    }

    /// Drain the bus until it is closed and empty.
    pub(crate) async fn run(mut self, mut rx: EventReceiver<Event>) -> DispatchStats {
        tracing::info!(strategy = self.fuser.strategy_name(), "dispatcher started");
        while let Some(event) = rx.consume().await {
            self.process(event);
        }
        tracing::info!(stats = ?self.stats, "dispatcher drained");
        self.stats
    }

    /// Handle one bus event and everything it derives, in order, before
    /// returning.
    pub(crate) fn process(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            self.stats.events += 1;
            let kind = event.kind();
            metrics::counter!("dispatcher.events", "kind" => kind).increment(1);

            match catch_unwind(AssertUnwindSafe(|| self.handle(event))) {
                Ok(derived) => queue.extend(derived),
                Err(panic) => {
                    let detail = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    self.stats.handler_panics += 1;
                    metrics::counter!("dispatcher.handler_panic", "kind" => kind).increment(1);
                    tracing::error!(kind, panic = %detail, "event handler panicked");
                    queue.push_back(Event::Alert(AlertEvent::new(
                        AlertLevel::Error,
                        format!("{kind} handler panicked: {detail}"),
                    )));
                }
            }
        }
    }

    fn handle(&mut self, event: Event) -> Vec<Event> {
        if event.is_displayable() {
            self.presentation.publish(event.clone());
        }
        match event {
            Event::Market(tick) => self.on_market(tick),
            Event::News(news) => self.fuser.on_news(news).into_iter().map(Event::Signal).collect(),
            Event::Vision(vision) => self.fuser.on_vision(vision).map(Event::Signal).into_iter().collect(),
            Event::Signal(signal) => self.on_signal(signal),
            Event::OrderRequest(request) => self.on_order_request(request),
            Event::OrderAccepted(ack) => self.on_order_accepted(ack),
            Event::SubmitFailed(failed) => self.on_submit_failed(failed),
            Event::OrderUpdate(update) => self.on_order_update(update),
            Event::Fill(fill) => self.on_fill(fill),
            Event::PnlUpdate(_) | Event::Explanation(_) => Vec::new(),
            Event::ChatRequest(chat) => {
                self.on_chat(chat);
                Vec::new()
            }
            Event::Alert(alert) => {
                self.stats.alerts += 1;
                match alert.level {
                    AlertLevel::Info => tracing::info!(message = %alert.message, "alert"),
                    AlertLevel::Warning => tracing::warn!(message = %alert.message, "alert"),
                    AlertLevel::Error => tracing::error!(message = %alert.message, "alert"),
                }
                Vec::new()
            }
            Event::Control(cmd) => {
                self.on_control(cmd);
                Vec::new()
            }
        }
    }

    fn on_market(&mut self, tick: MarketEvent) -> Vec<Event> {
        let held = self.portfolio.is_held(&tick.instrument);
        let mut out = Vec::new();
        if let Some(signal) = self.fuser.on_market(tick) {
            out.push(Event::Signal(signal));
        }
        if held {
            out.push(Event::PnlUpdate(self.valuation()));
        }
        out
    }

    fn on_signal(&mut self, signal: SignalEvent) -> Vec<Event> {
        self.stats.signals += 1;
        self.audit.record_signal(&signal);
        if self.explain_signals {
            let prompt = self.prompts.signal_prompt(&signal.reason);
            self.spawn_explanation(signal.reason.clone(), prompt);
        }

        let exposure = self.tracker.exposure(&signal.instrument);
        let ctx = RiskContext {
            cash: self.portfolio.cash(),
            held: self.portfolio.held(&signal.instrument),
            reference_price: self.fuser.latest_price(&signal.instrument),
            portfolio_value: self.valuation_value(),
            pending_buy: exposure.buy_quantity,
            pending_sell: exposure.sell_quantity,
            pending_buy_notional: self.tracker.pending_buy_notional(),
        };
        match self.risk.evaluate(&signal, &ctx) {
            Ok(request) => vec![Event::OrderRequest(request)],
            Err(_) => Vec::new(),
        }
    }

    fn on_order_request(&mut self, request: OrderRequestEvent) -> Vec<Event> {
        if self.paused {
            tracing::info!(instrument = %request.instrument, "paused; order request dropped");
            return Vec::new();
        }
        if !self.limiter.try_acquire() {
            self.stats.orders_throttled += 1;
            tracing::warn!(
                instrument = %request.instrument,
                action = %request.action,
                quantity = request.quantity,
                reason = "rate_limited",
                "order request throttled"
            );
            return Vec::new();
        }
        if let Err(err) = self.tracker.reserve(&request) {
            tracing::warn!(request_id = %request.request_id, error = %err, "order request ignored");
            return Vec::new();
        }
        self.stats.orders_admitted += 1;
        self.spawn_submit(request);
        Vec::new()
    }

    fn on_submit_failed(&mut self, failed: SubmitFailedEvent) -> Vec<Event> {
        if self.tracker.on_submit_failed(&failed.request_id).is_none() {
            tracing::debug!(request_id = %failed.request_id, "no reservation to release");
        }
        vec![Event::Alert(AlertEvent::new(
            AlertLevel::Error,
            format!("order for {} failed: {}", failed.instrument, failed.reason),
        ))]
    }

    fn on_order_accepted(&mut self, ack: OrderAck) -> Vec<Event> {
        if let Err(err) = self.tracker.on_accepted(&ack) {
            tracing::warn!(order_id = %ack.order_id, error = %err, "ignoring acknowledgement");
            return Vec::new();
        }
        spawn_order_poller(
            self.execution.clone(),
            self.bus.clone(),
            ack.order_id,
            self.execution_policy.poll,
            self.cancel.child_token(),
        );
        Vec::new()
    }

    fn on_order_update(&mut self, update: OrderUpdateEvent) -> Vec<Event> {
        match self.tracker.on_update(&update) {
            Ok(Transition::Filled(fill)) => vec![Event::Fill(fill)],
            Ok(Transition::Closed { order_id, status }) => {
                tracing::info!(order_id = %order_id, status = %status, "order closed");
                Vec::new()
            }
            Ok(Transition::Lost { order_id, reason }) => vec![Event::Alert(AlertEvent::new(
                AlertLevel::Warning,
                format!("lost track of order {order_id}: {reason}"),
            ))],
            Err(err) => {
                tracing::warn!(order_id = %update.order_id, error = %err, "stale order update ignored");
                Vec::new()
            }
        }
    }

    fn on_fill(&mut self, fill: FillEvent) -> Vec<Event> {
        match self.portfolio.apply_fill(&fill) {
            Ok(_) => {
                self.stats.fills += 1;
                self.audit.record_trade(&fill);
                vec![Event::PnlUpdate(self.valuation())]
            }
            Err(err) if err.is_integrity_violation() => {
                metrics::counter!("ledger.integrity_alarm").increment(1);
                tracing::error!(
                    order_id = %fill.order_id,
                    instrument = %fill.instrument,
                    reason = %err,
                    "fill rejected by ledger"
                );
                vec![Event::Alert(AlertEvent::new(
                    AlertLevel::Error,
                    format!("fill {} rejected: {err}", fill.order_id),
                ))]
            }
            Err(err) => {
                tracing::warn!(order_id = %fill.order_id, reason = %err, "malformed fill dropped");
                Vec::new()
            }
        }
    }

    fn on_chat(&mut self, chat: ChatRequestEvent) {
        let context = self.chat_context();
        let prompt = self.prompts.chat_prompt(&chat.text, &context);
        self.spawn_explanation(chat.text, prompt);
    }

    fn on_control(&mut self, cmd: ControlCommand) {
        match cmd {
            ControlCommand::Pause => {
                self.paused = true;
                tracing::info!("order flow paused");
            }
            ControlCommand::Resume => {
                self.paused = false;
                tracing::info!("order flow resumed");
            }
            ControlCommand::Shutdown => {
                tracing::info!("shutdown requested");
                self.cancel.cancel();
                self.bus.close();
            }
        }
    }

    fn valuation(&self) -> core_types::PnLUpdateEvent {
        self.portfolio
            .value_with(|instrument| self.fuser.latest_price(instrument))
            .to_event()
    }

    fn valuation_value(&self) -> f64 {
        self.portfolio
            .value_with(|instrument| self.fuser.latest_price(instrument))
            .portfolio_value
    }

    fn chat_context(&self) -> String {
        let v = self
            .portfolio
            .value_with(|instrument| self.fuser.latest_price(instrument));
        let positions = self
            .portfolio
            .positions()
            .map(|p| format!("{}={}", p.instrument, p.quantity))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "cash={:.2}, portfolio_value={:.2}, realized_pnl={:.2}, positions=[{}], paused={}",
            v.cash, v.portfolio_value, v.realized_pnl, positions, self.paused
        )
    }

    fn spawn_submit(&self, request: OrderRequestEvent) {
        let execution = self.execution.clone();
        let bus = self.bus.clone();
        let policy = self.execution_policy;
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let submitted = execution_broker::submit_with_retry(
                execution.as_ref(),
                &request,
                policy.submit_attempts,
                policy.submit_backoff,
                &cancel,
            )
            .await;
            let event = match submitted {
                Ok(order_id) => Event::OrderAccepted(OrderAck {
                    request_id: request.request_id,
                    order_id,
                    instrument: request.instrument,
                    action: request.action,
                    quantity: request.quantity,
                    observed_at: Utc::now(),
                }),
                Err(err) => {
                    tracing::error!(instrument = %request.instrument, error = %err, "order submission failed");
                    Event::SubmitFailed(SubmitFailedEvent {
                        request_id: request.request_id,
                        instrument: request.instrument,
                        reason: err.to_string(),
                        observed_at: Utc::now(),
                    })
                }
            };
            if let Err(err) = bus.publish(event).await {
                tracing::warn!(error = %err, "submit outcome dropped");
            }
        });
    }

    fn spawn_explanation(&self, request: String, prompt: String) {
        let explainer = self.explainer.clone();
        let bus = self.bus.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let text = tokio::select! {
                _ = cancel.cancelled() => return,
                text = explainer.explain(&prompt) => text,
            };
            let event = Event::Explanation(ExplanationEvent {
                request,
                text,
                observed_at: Utc::now(),
            });
            if let Err(err) = bus.publish(event).await {
                tracing::warn!(error = %err, "explanation dropped");
            }
        });
    }
}

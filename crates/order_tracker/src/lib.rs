//! Order lifecycle: a registry of in-flight orders with monotone status
//! transitions, and the polling task that reports venue status back.
//!
//! A request is reserved the moment risk admits it, before the broker
//! answers. Reserved and tracked quantities together are the exposure that
//! sizing must not double count.

mod poller;

use std::collections::HashMap;

use chrono::Utc;
use core_types::{
    FillEvent, OrderAck, OrderOutcome, OrderRequestEvent, OrderStatus, OrderUpdateEvent,
    TradeAction,
};
use thiserror::Error;

pub use poller::{spawn_order_poller, PollPolicy};

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedOrder {
    pub order_id: String,
    pub request_id: String,
    pub instrument: String,
    pub action: TradeAction,
    pub quantity: f64,
    pub reference_price: f64,
    pub status: OrderStatus,
}

/// An admitted request the broker has not acknowledged yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub request_id: String,
    pub instrument: String,
    pub action: TradeAction,
    pub quantity: f64,
    pub reference_price: f64,
}

/// Quantity committed to unfinished orders for one instrument.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Exposure {
    pub buy_quantity: f64,
    pub sell_quantity: f64,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransitionError {
    #[error("order {0} is not tracked")]
    Unknown(String),
    #[error("order {0} already registered")]
    Duplicate(String),
}

/// What the dispatcher should do after an update was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Filled(FillEvent),
    Closed { order_id: String, status: OrderStatus },
    Lost { order_id: String, reason: String },
}

#[derive(Debug, Default)]
pub struct OrderTracker {
    submitting: HashMap<String, Reservation>,
    orders: HashMap<String, TrackedOrder>,
}

impl OrderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, request: &OrderRequestEvent) -> Result<(), TransitionError> {
        if self.submitting.contains_key(&request.request_id) {
            return Err(TransitionError::Duplicate(request.request_id.clone()));
        }
        self.submitting.insert(
            request.request_id.clone(),
            Reservation {
                request_id: request.request_id.clone(),
                instrument: request.instrument.clone(),
                action: request.action,
                quantity: request.quantity,
                reference_price: request.reference_price,
            },
        );
        Ok(())
    }

    /// Drop the reservation of a submission the broker never accepted.
    pub fn on_submit_failed(&mut self, request_id: &str) -> Option<Reservation> {
        self.submitting.remove(request_id)
    }

    pub fn on_accepted(&mut self, ack: &OrderAck) -> Result<(), TransitionError> {
        if self.orders.contains_key(&ack.order_id) {
            return Err(TransitionError::Duplicate(ack.order_id.clone()));
        }
        let reference_price = self
            .submitting
            .remove(&ack.request_id)
            .map(|r| r.reference_price)
            .unwrap_or(0.0);
        tracing::info!(
            order_id = %ack.order_id,
            instrument = %ack.instrument,
            action = %ack.action,
            quantity = ack.quantity,
            "tracking order"
        );
        self.orders.insert(
            ack.order_id.clone(),
            TrackedOrder {
                order_id: ack.order_id.clone(),
                request_id: ack.request_id.clone(),
                instrument: ack.instrument.clone(),
                action: ack.action,
                quantity: ack.quantity,
                reference_price,
                status: OrderStatus::Pending,
            },
        );
        Ok(())
    }

    /// Apply a reported outcome. Every outcome is terminal for tracking, so
    /// the order leaves the registry and a later update for the same id is
    /// `Unknown`; that is what keeps a fill from being emitted twice. A fill
    /// with an unusable price or quantity resolves the order as lost.
    pub fn on_update(&mut self, update: &OrderUpdateEvent) -> Result<Transition, TransitionError> {
        let Some(order) = self.orders.remove(&update.order_id) else {
            return Err(TransitionError::Unknown(update.order_id.clone()));
        };

        if let OrderOutcome::Filled { price, quantity } = &update.outcome {
            let quantity = quantity.unwrap_or(order.quantity);
            for (field, value) in [("price", *price), ("quantity", quantity)] {
                if !value.is_finite() || value <= 0.0 {
                    let reason = format!("fill report with invalid {field}: {value}");
                    metrics::counter!("orders.lost").increment(1);
                    tracing::warn!(order_id = %order.order_id, reason = %reason, "order tracking lost");
                    return Ok(Transition::Lost {
                        order_id: order.order_id,
                        reason,
                    });
                }
            }
        }

        let transition = match &update.outcome {
            OrderOutcome::Filled { price, quantity } => {
                Transition::Filled(FillEvent {
                    order_id: order.order_id,
                    instrument: order.instrument,
                    action: order.action,
                    quantity: quantity.unwrap_or(order.quantity),
                    price: *price,
                    observed_at: Utc::now(),
                })
            }
            OrderOutcome::Rejected { reason } => {
                tracing::info!(order_id = %order.order_id, reason = %reason, "order rejected");
                Transition::Closed {
                    order_id: order.order_id,
                    status: OrderStatus::Rejected,
                }
            }
            OrderOutcome::Cancelled => {
                tracing::info!(order_id = %order.order_id, "order cancelled");
                Transition::Closed {
                    order_id: order.order_id,
                    status: OrderStatus::Cancelled,
                }
            }
            OrderOutcome::Lost { reason } => {
                metrics::counter!("orders.lost").increment(1);
                tracing::warn!(order_id = %order.order_id, reason = %reason, "order tracking lost");
                Transition::Lost {
                    order_id: order.order_id,
                    reason: reason.clone(),
                }
            }
        };
        Ok(transition)
    }

    pub fn exposure(&self, instrument: &str) -> Exposure {
        let reserved = self
            .submitting
            .values()
            .map(|r| (r.instrument.as_str(), r.action, r.quantity));
        let tracked = self
            .orders
            .values()
            .map(|o| (o.instrument.as_str(), o.action, o.quantity));
        reserved
            .chain(tracked)
            .filter(|(i, _, _)| *i == instrument)
            .fold(Exposure::default(), |mut acc, (_, action, quantity)| {
                match action {
                    TradeAction::Buy => acc.buy_quantity += quantity,
                    TradeAction::Sell => acc.sell_quantity += quantity,
                }
                acc
            })
    }

    /// Cash earmarked for unfinished buys, valued at their sizing price.
    pub fn pending_buy_notional(&self) -> f64 {
        let reserved = self
            .submitting
            .values()
            .map(|r| (r.action, r.quantity * r.reference_price));
        let tracked = self
            .orders
            .values()
            .map(|o| (o.action, o.quantity * o.reference_price));
        reserved
            .chain(tracked)
            .filter(|(action, _)| *action == TradeAction::Buy)
            .map(|(_, notional)| notional)
            .sum()
    }

    pub fn in_flight(&self) -> usize {
        self.submitting.len() + self.orders.len()
    }

    pub fn get(&self, order_id: &str) -> Option<&TrackedOrder> {
        self.orders.get(order_id)
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

pub(crate) fn update(order_id: &str, outcome: OrderOutcome) -> OrderUpdateEvent {
    OrderUpdateEvent {
        order_id: order_id.to_string(),
        outcome,
        observed_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(order_id: &str, quantity: f64) -> OrderAck {
        OrderAck {
            request_id: format!("req-{order_id}"),
            order_id: order_id.to_string(),
            instrument: "RELIANCE".to_string(),
            action: TradeAction::Buy,
            quantity,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn fill_is_emitted_exactly_once() {
        let mut tracker = OrderTracker::new();
        tracker.on_accepted(&ack("o1", 10.0)).expect("accepted");
        assert_eq!(tracker.get("o1").map(|o| o.status), Some(OrderStatus::Pending));

        let filled = update("o1", OrderOutcome::Filled { price: 2_500.0, quantity: None });
        let Transition::Filled(fill) = tracker.on_update(&filled).expect("fill") else {
            panic!("expected fill");
        };
        assert_eq!(fill.quantity, 10.0);
        assert_eq!(fill.price, 2_500.0);
        assert!(tracker.is_empty());

        assert_eq!(
            tracker.on_update(&filled),
            Err(TransitionError::Unknown("o1".to_string()))
        );
    }

    #[test]
    fn reported_quantity_wins_over_requested() {
        let mut tracker = OrderTracker::new();
        tracker.on_accepted(&ack("o1", 10.0)).expect("accepted");
        let out = tracker
            .on_update(&update("o1", OrderOutcome::Filled { price: 99.0, quantity: Some(4.0) }))
            .expect("fill");
        assert!(matches!(out, Transition::Filled(f) if f.quantity == 4.0));
    }

    #[test]
    fn rejection_closes_without_fill() {
        let mut tracker = OrderTracker::new();
        tracker.on_accepted(&ack("o1", 1.0)).expect("accepted");
        let out = tracker
            .on_update(&update("o1", OrderOutcome::Rejected { reason: "margin".into() }))
            .expect("closed");
        assert_eq!(
            out,
            Transition::Closed { order_id: "o1".into(), status: OrderStatus::Rejected }
        );
        // Terminal: a late fill report is ignored.
        assert!(tracker
            .on_update(&update("o1", OrderOutcome::Filled { price: 1.0, quantity: None }))
            .is_err());
    }

    #[test]
    fn lost_order_leaves_registry() {
        let mut tracker = OrderTracker::new();
        tracker.on_accepted(&ack("o1", 1.0)).expect("accepted");
        let out = tracker
            .on_update(&update("o1", OrderOutcome::Lost { reason: "poll budget".into() }))
            .expect("lost");
        assert!(matches!(out, Transition::Lost { .. }));
        assert_eq!(tracker.len(), 0);
    }

    fn request(request_id: &str, action: TradeAction, quantity: f64, price: f64) -> OrderRequestEvent {
        OrderRequestEvent {
            request_id: request_id.to_string(),
            instrument: "RELIANCE".to_string(),
            action,
            quantity,
            reference_price: price,
            order_type: Default::default(),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn invalid_fill_resolves_the_order_as_lost() {
        let mut tracker = OrderTracker::new();
        tracker.on_accepted(&ack("o1", 1.0)).expect("accepted");
        let out = tracker
            .on_update(&update("o1", OrderOutcome::Filled { price: 0.0, quantity: None }))
            .expect("resolved");
        let Transition::Lost { order_id, reason } = out else {
            panic!("expected lost");
        };
        assert_eq!(order_id, "o1");
        assert!(reason.contains("price"), "{reason}");
        assert!(tracker.is_empty());
        assert_eq!(tracker.exposure("RELIANCE"), Exposure::default());

        tracker.on_accepted(&ack("o2", 1.0)).expect("accepted");
        let out = tracker
            .on_update(&update("o2", OrderOutcome::Filled { price: 10.0, quantity: Some(f64::NAN) }))
            .expect("resolved");
        assert!(matches!(out, Transition::Lost { ref reason, .. } if reason.contains("quantity")));
        assert!(tracker.is_empty());
    }

    #[test]
    fn reservations_count_until_the_order_resolves() {
        let mut tracker = OrderTracker::new();
        tracker
            .reserve(&request("req-o1", TradeAction::Buy, 10.0, 100.0))
            .expect("reserved");
        tracker
            .reserve(&request("req-o2", TradeAction::Sell, 3.0, 100.0))
            .expect("reserved");
        assert_eq!(
            tracker.exposure("RELIANCE"),
            Exposure { buy_quantity: 10.0, sell_quantity: 3.0 }
        );
        assert_eq!(tracker.exposure("TCS"), Exposure::default());
        assert_eq!(tracker.pending_buy_notional(), 1_000.0);
        assert_eq!(tracker.in_flight(), 2);

        // The ack carries the reservation over into the tracked order.
        tracker.on_accepted(&ack("o1", 10.0)).expect("accepted");
        assert_eq!(tracker.in_flight(), 2);
        assert_eq!(tracker.exposure("RELIANCE").buy_quantity, 10.0);
        assert_eq!(tracker.pending_buy_notional(), 1_000.0);

        tracker
            .on_update(&update("o1", OrderOutcome::Cancelled))
            .expect("closed");
        assert_eq!(tracker.exposure("RELIANCE").buy_quantity, 0.0);
        assert_eq!(tracker.pending_buy_notional(), 0.0);

        let released = tracker.on_submit_failed("req-o2").expect("reservation");
        assert_eq!(released.action, TradeAction::Sell);
        assert_eq!(tracker.in_flight(), 0);
        assert!(tracker.on_submit_failed("req-o2").is_none());
    }

    #[test]
    fn duplicate_reservation_is_refused() {
        let mut tracker = OrderTracker::new();
        let req = request("r1", TradeAction::Buy, 1.0, 5.0);
        tracker.reserve(&req).expect("reserved");
        assert_eq!(tracker.reserve(&req), Err(TransitionError::Duplicate("r1".into())));
        assert_eq!(tracker.exposure("RELIANCE").buy_quantity, 1.0);
    }

    #[test]
    fn duplicate_ack_is_refused() {
        let mut tracker = OrderTracker::new();
        tracker.on_accepted(&ack("o1", 1.0)).expect("accepted");
        assert_eq!(
            tracker.on_accepted(&ack("o1", 2.0)),
            Err(TransitionError::Duplicate("o1".into()))
        );
        assert_eq!(tracker.get("o1").map(|o| o.quantity), Some(1.0));
    }
}
